use crate::config::RetryConfig;
use crate::{CollectorError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The `RetryPolicy` struct decides how long to wait before re-issuing a failed request.
///
/// Rate limits are waited out for as long as it takes unless `max_total_backoff` is set.
/// Transport failures are retried `max_transport_retries` times with exponential delays.
/// Every other error is returned straight away.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// The wait after a 429 that carried no suggestion.
    pub rate_limit_fallback: Duration,
    /// The cap on total rate-limit waiting for one request.
    pub max_total_backoff: Option<Duration>,
    /// The number of retries after a transport failure.
    pub max_transport_retries: u32,
    /// The first transport retry delay.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            rate_limit_fallback: Duration::from_secs(config.rate_limit_fallback_secs),
            max_total_backoff: config.max_total_backoff_secs.map(Duration::from_secs),
            max_transport_retries: config.max_transport_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// The delay before the `attempt`-th transport retry (1-based).
    pub fn transport_delay(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Runs `op` until it succeeds or fails in a way this policy will not retry.
    ///
    /// # Arguments
    ///
    /// * `cancel` - Aborts a pending wait; the request itself is never interrupted.
    /// * `label` - A short description of the request for the logs.
    /// * `op` - Produces a fresh attempt of the request each time it is called.
    ///
    /// # Returns
    ///
    /// The first successful value, or the error that ended the retries.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut transport_failures = 0u32;
        let mut rate_limited_for = Duration::ZERO;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            let wait = match err {
                CollectorError::RateLimited { retry_after } => {
                    let wait = retry_after.unwrap_or(self.rate_limit_fallback);
                    if let Some(max) = self.max_total_backoff {
                        if rate_limited_for + wait > max {
                            return Err(CollectorError::BackoffExhausted(max));
                        }
                    }
                    rate_limited_for += wait;
                    warn!(request = label, wait_secs = wait.as_secs_f32(), "Rate limited, waiting before retry");
                    wait
                }
                CollectorError::Transport(ref message) => {
                    transport_failures += 1;
                    if transport_failures > self.max_transport_retries {
                        warn!(request = label, attempts = transport_failures, error = %message, "Giving up after transport failures");
                        return Err(err);
                    }
                    let wait = self.transport_delay(transport_failures);
                    debug!(request = label, attempt = transport_failures, error = %message, "Transport failure, retrying");
                    wait
                }
                other => return Err(other),
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(CollectorError::Cancelled),
                _ = sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            rate_limit_fallback: Duration::from_millis(1),
            max_total_backoff: None,
            max_transport_retries: 3,
            base_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried_until_success() {
        let attempts = AtomicU32::new(0);
        let result = quick_policy()
            .run(&CancellationToken::new(), "test", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 5 {
                    Err(CollectorError::RateLimited { retry_after: None })
                } else {
                    Ok("page")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "page");
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_transport_failures_are_capped() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = quick_policy()
            .run(&CancellationToken::new(), "test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(CollectorError::Transport("connection reset".into()))
            })
            .await;

        assert!(matches!(result, Err(CollectorError::Transport(_))));
        // the first attempt plus three retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = quick_policy()
            .run(&CancellationToken::new(), "test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(CollectorError::ClientError {
                    status: 404,
                    url: "http://localhost/x".into(),
                    message: "not found".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(CollectorError::ClientError { status: 404, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_total_backoff_budget() {
        let policy = RetryPolicy {
            max_total_backoff: Some(Duration::from_millis(5)),
            ..quick_policy()
        };
        let result: Result<()> = policy
            .run(&CancellationToken::new(), "test", || async {
                Err(CollectorError::RateLimited {
                    retry_after: Some(Duration::from_millis(2)),
                })
            })
            .await;

        assert!(matches!(result, Err(CollectorError::BackoffExhausted(_))));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let policy = RetryPolicy {
            rate_limit_fallback: Duration::from_secs(300),
            ..quick_policy()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = policy
            .run(&cancel, "test", || async {
                Err(CollectorError::RateLimited { retry_after: None })
            })
            .await;

        assert!(matches!(result, Err(CollectorError::Cancelled)));
    }

    #[test]
    fn test_transport_delay_doubles() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(100),
            ..quick_policy()
        };
        assert_eq!(policy.transport_delay(1), Duration::from_millis(100));
        assert_eq!(policy.transport_delay(3), Duration::from_millis(400));
    }
}
