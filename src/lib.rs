use std::time::Duration;
use thiserror::Error;

pub mod backoff;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod export;
pub mod fetch;
pub mod normalize;
pub mod platforms;
pub mod report;
pub mod richtext;
pub mod types;
pub mod walker;

// Re-export commonly used types
pub use config::CollectorConfig;
pub use types::{
    ActorFailure, ActorRef, CanonicalPost, CanonicalProfile, CollectionResult, CollectionRow,
    PaginationToken, Phase, Platform, RawPage,
};

/// The `CollectorError` enum represents the failures a collection run can classify.
#[derive(Error, Debug)]
pub enum CollectorError {
    /// The network call failed or the server answered 5xx. Retryable.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The platform answered HTTP 429. Retryable after waiting.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// The wait the server asked for, if it said.
        retry_after: Option<Duration>,
    },
    /// Any 4xx answer other than 429. Not retryable.
    #[error("client error {status} from {url}: {message}")]
    ClientError {
        status: u16,
        url: String,
        message: String,
    },
    /// The response body did not have a shape the adapter can read.
    #[error("unexpected response shape: {0}")]
    Shape(String),
    /// A failure that terminated one phase of one actor's processing.
    #[error("actor {actor} failed during {phase}: {source}")]
    Actor {
        actor: ActorRef,
        phase: Phase,
        #[source]
        source: Box<CollectorError>,
    },
    /// The keyword search that seeds a run could not be performed.
    #[error("discovery failed: {0}")]
    Discovery(#[source] Box<CollectorError>),
    /// Rate-limit waits exceeded the configured total budget.
    #[error("backoff budget of {0:?} exhausted")]
    BackoffExhausted(Duration),
    /// The run was cancelled between pages or actors.
    #[error("run cancelled")]
    Cancelled,
    /// The configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// The collected table could not be written.
    #[error("export failed: {0}")]
    Export(String),
}

impl CollectorError {
    /// Whether waiting and re-issuing the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectorError::Transport(_) | CollectorError::RateLimited { .. }
        )
    }

    /// Wraps this error as the failure of one actor phase.
    pub fn for_actor(self, actor: &ActorRef, phase: Phase) -> Self {
        CollectorError::Actor {
            actor: actor.clone(),
            phase,
            source: Box::new(self),
        }
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CollectorError::Shape(err.to_string())
        } else if err.is_builder() {
            CollectorError::Config(err.to_string())
        } else {
            CollectorError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        CollectorError::Shape(err.to_string())
    }
}

impl From<::config::ConfigError> for CollectorError {
    fn from(err: ::config::ConfigError) -> Self {
        CollectorError::Config(err.to_string())
    }
}

impl From<csv::Error> for CollectorError {
    fn from(err: csv::Error) -> Self {
        CollectorError::Export(err.to_string())
    }
}

/// A type alias for `Result` with the `CollectorError` error type.
pub type Result<T> = std::result::Result<T, CollectorError>;

// Constants

/// The default timeout duration for HTTP requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// The default number of actors processed at the same time.
pub const DEFAULT_CONCURRENCY: usize = 1;
/// The default number of in-flight requests per platform.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 2;
/// The default number of retries after a transport failure.
pub const DEFAULT_MAX_TRANSPORT_RETRIES: u32 = 3;
/// The wait used after a 429 when the server does not suggest one.
pub const DEFAULT_RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(300);
/// The pause between successive pages of one walk.
pub const DEFAULT_REQUEST_DELAY: Duration = Duration::from_secs(1);
/// The number of search posts read while discovering actors.
pub const DEFAULT_MAX_DISCOVERY_POSTS: usize = 1000;
/// The requested page size before per-platform clamping.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
