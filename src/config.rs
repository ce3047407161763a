use crate::types::Platform;
use crate::{CollectorError, Result};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The `CollectorConfig` struct holds the configuration settings for a collection run.
/// It includes the search keywords, pagination limits, pacing, retry policy, and per-platform credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// The keywords used to discover actors.
    pub keywords: Vec<String>,
    /// The platforms to collect from.
    pub platforms: Vec<Platform>,
    /// The maximum number of posts read during the discovery phase.
    pub max_discovery_posts: usize,
    /// The maximum number of posts collected per actor. `None` means everything available.
    pub max_posts_per_user: Option<usize>,
    /// The requested number of items per page, clamped to what each platform allows.
    pub page_size: u32,
    /// The pause between successive pages of one walk, in milliseconds.
    pub request_delay_ms: u64,
    /// The timeout for a single HTTP request, in seconds.
    pub timeout_secs: u64,
    /// The user agent string sent with every request.
    pub user_agent: String,
    /// The number of actors processed at the same time.
    pub concurrency: usize,
    /// The maximum number of in-flight requests per platform.
    pub max_concurrent_requests: usize,
    /// An optional deadline for the whole run, in seconds.
    pub run_timeout_secs: Option<u64>,
    /// Where the joined table is written.
    pub output: PathBuf,
    /// Whether to draw a progress bar while processing actors.
    pub show_progress: bool,
    /// The retry settings for rate limits and transport failures.
    pub retry: RetryConfig,
    /// The Bluesky settings.
    pub bluesky: BlueskyConfig,
    /// The Mastodon settings.
    pub mastodon: MastodonConfig,
    /// The Twitter settings.
    pub twitter: TwitterConfig,
}

/// The `RetryConfig` struct holds the backoff settings shared by every platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// The wait after a 429 when the server does not suggest one, in seconds.
    pub rate_limit_fallback_secs: u64,
    /// An optional cap on the total time spent waiting out rate limits per request, in seconds.
    pub max_total_backoff_secs: Option<u64>,
    /// How many times a transport failure is retried before giving up.
    pub max_transport_retries: u32,
    /// The first transport retry delay in milliseconds; doubles on every attempt.
    pub base_backoff_ms: u64,
}

/// The `BlueskyConfig` struct holds the endpoint and credential for the AT-protocol app view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueskyConfig {
    /// The XRPC service base URL.
    pub base_url: String,
    /// An access JWT from an existing session.
    pub access_token: Option<String>,
}

/// The `MastodonConfig` struct holds the instances to crawl and the token used for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MastodonConfig {
    /// The instance base URLs; each one is discovered and crawled separately.
    pub instances: Vec<String>,
    /// A bearer token accepted by the instances.
    pub access_token: Option<String>,
}

/// The `TwitterConfig` struct holds the API base URL and app bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitterConfig {
    /// The v2 API base URL.
    pub base_url: String,
    /// The app-only bearer token.
    pub bearer_token: Option<String>,
}

impl Default for CollectorConfig {
    /// Provides default values for the `CollectorConfig` struct.
    ///
    /// # Returns
    ///
    /// A `CollectorConfig` instance with default settings.
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            platforms: vec![Platform::Bluesky],
            max_discovery_posts: crate::DEFAULT_MAX_DISCOVERY_POSTS,
            max_posts_per_user: None,
            page_size: crate::DEFAULT_PAGE_SIZE,
            request_delay_ms: crate::DEFAULT_REQUEST_DELAY.as_millis() as u64,
            timeout_secs: crate::DEFAULT_TIMEOUT.as_secs(),
            user_agent: format!("feedharvest/{}", env!("CARGO_PKG_VERSION")),
            concurrency: crate::DEFAULT_CONCURRENCY,
            max_concurrent_requests: crate::DEFAULT_MAX_CONCURRENT_REQUESTS,
            run_timeout_secs: None,
            output: PathBuf::from("harvest.csv"),
            show_progress: true,
            retry: RetryConfig::default(),
            bluesky: BlueskyConfig::default(),
            mastodon: MastodonConfig::default(),
            twitter: TwitterConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_fallback_secs: crate::DEFAULT_RATE_LIMIT_FALLBACK.as_secs(),
            max_total_backoff_secs: None,
            max_transport_retries: crate::DEFAULT_MAX_TRANSPORT_RETRIES,
            base_backoff_ms: 1000,
        }
    }
}

impl Default for BlueskyConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://public.api.bsky.app"),
            access_token: None,
        }
    }
}

impl Default for MastodonConfig {
    fn default() -> Self {
        Self {
            instances: vec![
                String::from("https://mastodon.social"),
                String::from("https://fosstodon.org"),
            ],
            access_token: None,
        }
    }
}

impl Default for TwitterConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://api.twitter.com"),
            bearer_token: None,
        }
    }
}

impl CollectorConfig {
    /// Loads the configuration from defaults, an optional TOML file, and `FEEDHARVEST_*` variables.
    ///
    /// # Arguments
    ///
    /// * `path` - An optional path to a configuration file. A missing file is an error.
    ///
    /// # Returns
    ///
    /// A `Result` containing the merged `CollectorConfig`, or an error if a source is malformed.
    /// The result is not validated, so that command-line overrides can be applied first.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("FEEDHARVEST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("keywords")
                .with_list_parse_key("platforms")
                .with_list_parse_key("mastodon.instances"),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Checks the settings that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(CollectorError::Config(
                "at least one search keyword is required".to_string(),
            ));
        }
        if self.platforms.is_empty() {
            return Err(CollectorError::Config(
                "at least one platform must be enabled".to_string(),
            ));
        }
        if self.page_size == 0 || self.concurrency == 0 || self.max_concurrent_requests == 0 {
            return Err(CollectorError::Config(
                "page_size, concurrency and max_concurrent_requests must be positive".to_string(),
            ));
        }
        if self.platforms.contains(&Platform::Twitter) && self.twitter.bearer_token.is_none() {
            return Err(CollectorError::Config(
                "twitter requires twitter.bearer_token".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}
