use crate::backoff::RetryPolicy;
use crate::config::CollectorConfig;
use crate::types::{PaginationToken, RawPage};
use crate::{CollectorError, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, LINK, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Turns a decoded response body (and the `rel="next"` link, if any) into a page.
pub type PageReader = fn(Value, Option<String>) -> Result<RawPage>;

/// How an endpoint asks for the following page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Paging {
    /// The cursor is sent back in the named query parameter; other parameters are kept.
    Cursor(&'static str),
    /// The next page is the absolute URL of the `Link` header; it replaces the endpoint.
    LinkHeader,
}

/// A request target: base URL, query parameters, and how to read and advance its pages.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub paging: Paging,
    pub reader: PageReader,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, paging: Paging, reader: PageReader) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            paging,
            reader,
        }
    }

    /// A target fetched once rather than walked, such as a profile.
    pub fn single(url: impl Into<String>) -> Self {
        Self::new(url, Paging::LinkHeader, read_single)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// The request that fetches the page `token` points at.
    ///
    /// A cursor only replaces the cursor parameter. A next-page URL supersedes the
    /// whole request, prior query parameters included.
    pub fn advance(&self, token: &PaginationToken) -> Endpoint {
        match token {
            PaginationToken::Cursor(cursor) => {
                let param = match self.paging {
                    Paging::Cursor(param) => param,
                    Paging::LinkHeader => "cursor",
                };
                let mut next = self.clone();
                next.query.retain(|(key, _)| key != param);
                next.query.push((param.to_string(), cursor.clone()));
                next
            }
            PaginationToken::NextUrl(url) => Endpoint {
                url: url.clone(),
                query: Vec::new(),
                paging: self.paging.clone(),
                reader: self.reader,
            },
        }
    }
}

/// The `RunContext` struct carries everything one platform's requests share during a run.
///
/// It replaces process-wide client state: credentials, the request limiter, the retry
/// policy and the cancellation token travel together and are passed to every fetch.
#[derive(Clone)]
pub struct RunContext {
    /// The HTTP client used for making requests.
    client: Client,
    /// The bearer credential sent with every request, if any.
    bearer: Option<String>,
    /// Bounds the requests in flight against one platform.
    limiter: Arc<Semaphore>,
    /// The retry policy applied by callers around each fetch.
    pub retry: RetryPolicy,
    /// Checked between pages and between actors.
    pub cancel: CancellationToken,
    /// The pause between successive pages of one walk.
    pub request_delay: Duration,
}

impl RunContext {
    /// Creates a new `RunContext` for one platform.
    ///
    /// # Arguments
    ///
    /// * `config` - The run configuration.
    /// * `bearer` - The credential for this platform.
    /// * `cancel` - The run's cancellation token.
    ///
    /// # Returns
    ///
    /// A `Result` containing the context, or an error if the client could not be created.
    pub fn new(
        config: &CollectorConfig,
        bearer: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            bearer,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            retry: RetryPolicy::from(&config.retry),
            cancel,
            request_delay: config.request_delay(),
        })
    }

    /// Performs one GET against `endpoint` and decodes the JSON body.
    ///
    /// Never retries. A 429 becomes `RateLimited`, a 5xx a `Transport` failure, and any
    /// other non-2xx a `ClientError`.
    ///
    /// # Returns
    ///
    /// The decoded body and the `rel="next"` link target, if the response had one.
    #[instrument(skip(self, endpoint), fields(url = %endpoint.url))]
    pub async fn fetch_json(&self, endpoint: &Endpoint) -> Result<(Value, Option<String>)> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| CollectorError::Cancelled)?;

        let mut request = self
            .client
            .get(&endpoint.url)
            .header(ACCEPT, "application/json");
        if !endpoint.query.is_empty() {
            request = request.query(&endpoint.query);
        }
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(status = %status, "Response received");

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CollectorError::RateLimited {
                retry_after: retry_after(response.headers(), Utc::now()),
            });
        }
        if status.is_server_error() {
            return Err(CollectorError::Transport(format!(
                "{} answered {}",
                response.url(),
                status
            )));
        }
        if !status.is_success() {
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            return Err(CollectorError::ClientError {
                status: status.as_u16(),
                url,
                message: body.chars().take(200).collect(),
            });
        }

        let link = response
            .headers()
            .get(LINK)
            .and_then(|value| value.to_str().ok())
            .and_then(next_link);
        let body = response.json::<Value>().await?;
        Ok((body, link))
    }

    /// Performs one page request and reads it with the endpoint's reader.
    pub async fn fetch_page(&self, endpoint: &Endpoint) -> Result<RawPage> {
        let (body, link) = self.fetch_json(endpoint).await?;
        (endpoint.reader)(body, link)
    }

    /// Fetches a single-object endpoint once, under the retry policy.
    pub async fn fetch_object(&self, endpoint: &Endpoint) -> Result<Value> {
        let (body, _) = self
            .retry
            .run(&self.cancel, &endpoint.url, || self.fetch_json(endpoint))
            .await?;
        Ok(body)
    }
}

/// Extracts the `rel="next"` target from a `Link` header value.
pub fn next_link(header: &str) -> Option<String> {
    header
        .split(',')
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| {
            let start = part.find('<')? + 1;
            let end = part[start..].find('>')? + start;
            Some(part[start..end].trim().to_string())
        })
        .filter(|url| !url.is_empty())
}

/// The wait a 429 response asks for.
///
/// Reads `Retry-After` (seconds), then a rate-limit reset header given either as epoch
/// seconds or as an RFC 3339 timestamp.
pub fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

    if let Some(secs) = header(RETRY_AFTER.as_str()).and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }

    let reset = header("x-rate-limit-reset").or_else(|| header("x-ratelimit-reset"))?;
    let reset_at = match reset.parse::<i64>() {
        Ok(epoch) => DateTime::<Utc>::from_timestamp(epoch, 0)?,
        Err(_) => DateTime::parse_from_rfc3339(reset).ok()?.with_timezone(&Utc),
    };
    let secs = (reset_at - now).num_seconds().max(0) as u64;
    Some(Duration::from_secs(secs))
}

/// A reader for endpoints that answer with a bare JSON array and page via `Link`.
pub fn read_array_with_link(body: Value, link: Option<String>) -> Result<RawPage> {
    match body {
        Value::Array(items) => Ok(RawPage::new(items, link.map(PaginationToken::NextUrl))),
        other => Err(CollectorError::Shape(format!(
            "expected a JSON array, got {}",
            kind_of(&other)
        ))),
    }
}

/// A reader for single-object endpoints: the whole body is the one item.
pub fn read_single(body: Value, _link: Option<String>) -> Result<RawPage> {
    Ok(RawPage::new(vec![body], None))
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
