use crate::types::{CollectionResult, CollectionRow};
use crate::{CollectorError, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// One line of the flat export: the post columns, then its author's profile columns.
#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    platform: &'static str,
    author_handle: Option<&'a str>,
    author_id: Option<&'a str>,
    post_id: Option<&'a str>,
    text: Option<&'a str>,
    created_at: Option<String>,
    like_count: Option<u64>,
    repost_count: Option<u64>,
    reply_count: Option<u64>,
    language: Option<&'a str>,
    external_link: Option<&'a str>,
    is_reshare: bool,
    profile_id: Option<&'a str>,
    display_name: Option<&'a str>,
    followers_count: Option<u64>,
    following_count: Option<u64>,
    posts_count: Option<u64>,
    description: Option<&'a str>,
}

impl<'a> From<&'a CollectionRow> for ExportRow<'a> {
    fn from(row: &'a CollectionRow) -> Self {
        let post = &row.post;
        let profile = row.profile.as_ref();
        Self {
            platform: post.platform.as_str(),
            author_handle: post.author_handle.as_deref(),
            author_id: post.author_id.as_deref(),
            post_id: post.post_id.as_deref(),
            text: post.text.as_deref(),
            created_at: post.created_at.map(|t| t.to_rfc3339()),
            like_count: post.like_count,
            repost_count: post.repost_count,
            reply_count: post.reply_count,
            language: post.language.as_deref(),
            external_link: post.external_link.as_deref(),
            is_reshare: post.is_reshare,
            profile_id: profile.and_then(|p| p.id.as_deref()),
            display_name: profile.and_then(|p| p.display_name.as_deref()),
            followers_count: profile.and_then(|p| p.followers_count),
            following_count: profile.and_then(|p| p.following_count),
            posts_count: profile.and_then(|p| p.posts_count),
            description: profile.and_then(|p| p.description.as_deref()),
        }
    }
}

/// The `CsvExporter` struct writes a run's joined table as a single CSV file.
pub struct CsvExporter {
    path: PathBuf,
}

impl CsvExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes every row of `result` to the exporter's path, replacing any existing file.
    ///
    /// # Returns
    ///
    /// The number of rows written.
    pub fn write(&self, result: &CollectionResult) -> Result<usize> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CollectorError::Export(e.to_string()))?;
        }
        let file = std::fs::File::create(&self.path)
            .map_err(|e| CollectorError::Export(format!("{}: {e}", self.path.display())))?;
        let written = write_csv(file, result)?;
        info!(path = %self.path.display(), rows = written, "Export written");
        Ok(written)
    }
}

/// Writes the joined table of `result` as CSV with a header row.
pub fn write_csv<W: Write>(writer: W, result: &CollectionResult) -> Result<usize> {
    let mut csv = csv::Writer::from_writer(writer);
    for row in &result.rows {
        csv.serialize(ExportRow::from(row))?;
    }
    csv.flush().map_err(|e| CollectorError::Export(e.to_string()))?;
    Ok(result.rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanonicalPost, CanonicalProfile, Platform};

    #[test]
    fn test_rows_without_profile_have_empty_columns() {
        let mut post = CanonicalPost::empty(Platform::Mastodon);
        post.author_handle = Some("a@m.example".into());
        post.text = Some("hello, \"world\"".into());
        post.like_count = Some(3);

        let mut profile = CanonicalProfile::empty(Platform::Mastodon);
        profile.handle = Some("a@m.example".into());
        profile.followers_count = Some(12);

        let result = CollectionResult {
            rows: vec![
                CollectionRow {
                    post: post.clone(),
                    profile: Some(profile),
                },
                CollectionRow { post, profile: None },
            ],
            ..CollectionResult::default()
        };

        let mut out = Vec::new();
        assert_eq!(write_csv(&mut out, &result).unwrap(), 2);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("platform,author_handle,author_id,post_id,text"));
        assert!(lines[0].ends_with("posts_count,description"));
        assert!(lines[1].contains(r#""hello, ""world""""#));
        assert!(lines[1].contains(",12,"));
        assert!(lines[2].ends_with("false,,,,,,"));
    }

    #[test]
    fn test_write_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(dir.path().join("nested/out.csv"));
        let written = exporter.write(&CollectionResult::default()).unwrap();
        assert_eq!(written, 0);
        assert!(exporter.path().exists());
    }
}
