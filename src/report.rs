use crate::types::CollectionResult;
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

/// How a run ended, as reported to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Every discovered actor was processed without failure.
    Complete,
    /// The table was written but some actors failed or the run stopped early.
    Partial,
    /// Discovery could not be performed; nothing was collected.
    Fatal,
}

impl ExitStatus {
    pub fn of(result: &CollectionResult) -> Self {
        if result.is_partial() {
            ExitStatus::Partial
        } else {
            ExitStatus::Complete
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Complete => 0,
            ExitStatus::Partial => 1,
            ExitStatus::Fatal => 2,
        }
    }
}

/// The `RunReport` struct renders the end-of-run summary printed after a collection.
pub struct RunReport<'a> {
    /// The finished collection.
    result: &'a CollectionResult,
    /// Wall-clock duration of the run.
    elapsed: Option<Duration>,
    /// Where the table was written.
    output: Option<PathBuf>,
}

impl<'a> RunReport<'a> {
    /// Creates a new `RunReport` for the given result.
    ///
    /// # Arguments
    ///
    /// * `result` - The joined table and failure list of a run.
    ///
    /// # Returns
    ///
    /// A new instance of `RunReport`.
    pub fn new(result: &'a CollectionResult) -> Self {
        Self {
            result,
            elapsed: None,
            output: None,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Builds the summary text.
    ///
    /// Every actor failure is listed with its phase and cause, so a partial table can be
    /// told apart from a complete one.
    ///
    /// # Returns
    ///
    /// A multi-line summary string.
    pub fn build(&self) -> String {
        let r = self.result;
        let status = match ExitStatus::of(r) {
            ExitStatus::Complete => "complete",
            _ if r.cancelled => "partial (cancelled)",
            _ => "partial",
        };
        let joined = r.rows.iter().filter(|row| row.profile.is_some()).count();

        let mut out = String::new();
        let _ = writeln!(out, "=== Collection Summary ===");
        let _ = writeln!(out, "Status: {status}");
        if let Some(at) = r.collected_at {
            let _ = writeln!(out, "Collected at: {}", at.to_rfc3339());
        }
        if let Some(elapsed) = self.elapsed {
            let _ = writeln!(out, "Processing time: {elapsed:.2?}");
        }
        let _ = writeln!(out, "Actors processed: {}", r.actors);
        let _ = writeln!(out, "Posts: {} ({} with profile)", r.rows.len(), joined);
        let _ = writeln!(out, "Profiles: {}", r.profiles.len());
        if r.shape_warnings > 0 {
            let _ = writeln!(out, "Shape warnings: {}", r.shape_warnings);
        }
        if r.suspect_truncations > 0 {
            let _ = writeln!(
                out,
                "Timelines possibly truncated (full page without next link): {}",
                r.suspect_truncations
            );
        }
        if let Some(output) = &self.output {
            let _ = writeln!(out, "Output: {}", output.display());
        }

        if !r.discovery_interruptions.is_empty() {
            let _ = writeln!(out, "\nSearches stopped early:");
            for reason in &r.discovery_interruptions {
                let _ = writeln!(out, "  {reason}");
            }
        }
        if !r.failures.is_empty() {
            let _ = writeln!(out, "\nFailures ({}):", r.failures.len());
            for failure in &r.failures {
                let _ = writeln!(out, "  {} [{}] {}", failure.actor, failure.phase, failure.cause);
            }
        }
        out
    }
}
