use anyhow::Context;
use clap::Parser;
use feedharvest::{
    collector::Collector,
    export::CsvExporter,
    report::{ExitStatus, RunReport},
    CollectorConfig, Platform,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Discover authors by keyword and collect their timelines and profiles into one CSV table.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// A TOML, YAML or JSON configuration file.
    #[arg(short, long, env = "FEEDHARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// A search keyword; repeat for several.
    #[arg(short, long = "keyword")]
    keywords: Vec<String>,

    /// A platform to collect from; repeat for several.
    #[arg(short, long = "platform")]
    platforms: Vec<Platform>,

    /// The number of search posts read while discovering authors.
    #[arg(long)]
    max_discovery_posts: Option<usize>,

    /// The most posts collected per author. Unbounded when omitted.
    #[arg(long)]
    max_posts_per_user: Option<usize>,

    /// Where the joined table is written.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(self, config: &mut CollectorConfig) {
        if !self.keywords.is_empty() {
            config.keywords = self.keywords;
        }
        if !self.platforms.is_empty() {
            config.platforms = self.platforms;
        }
        if let Some(max) = self.max_discovery_posts {
            config.max_discovery_posts = max;
        }
        if let Some(max) = self.max_posts_per_user {
            config.max_posts_per_user = Some(max);
        }
        if let Some(output) = self.output {
            config.output = output;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "feedharvest=debug" } else { "feedharvest=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitStatus> {
    let mut config = CollectorConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let start_time = Instant::now();
    let collector = Collector::new(config.clone());

    let cancel = collector.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current page and writing what was collected");
            cancel.cancel();
        }
    });

    let result = collector.run().await.context("Collection aborted")?;

    let exporter = CsvExporter::new(&config.output);
    exporter
        .write(&result)
        .with_context(|| format!("Failed to write {}", config.output.display()))?;

    let report = RunReport::new(&result)
        .with_elapsed(start_time.elapsed())
        .with_output(exporter.path())
        .build();
    println!("\n{report}");

    Ok(ExitStatus::of(&result))
}

/// The main entry point of the application.
///
/// Exits with 0 when every actor was collected, 1 when the table is partial, and 2 when
/// nothing could be collected.
#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let status = match run(cli).await {
        Ok(status) => status,
        Err(e) => {
            error!("{e:#}");
            ExitStatus::Fatal
        }
    };
    std::process::exit(status.code());
}
