//! Retry policy with exponential backoff for upstream calls.
//!
//! Both the pagination walk and detail fetches go through [`RetryPolicy::run`]:
//! bounded attempts, `2^attempt * base` backoff capped at a maximum, and a
//! predicate deciding which errors are worth another attempt.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::AppError;

/// Retry policy for a single logical request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    rate_limit_multiplier: u32,
    retryable: fn(&AppError) -> bool,
}

impl RetryPolicy {
    /// Creates a policy retrying [`AppError::is_retryable`] errors.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            rate_limit_multiplier: 2,
            retryable: AppError::is_retryable,
        }
    }

    pub fn from_http_config(config: &HttpConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_base_delay(),
            config.max_backoff(),
        )
        .with_rate_limit_multiplier(config.rate_limit_multiplier)
    }

    /// Replaces the retryable-error predicate.
    pub fn with_predicate(mut self, retryable: fn(&AppError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_rate_limit_multiplier(mut self, multiplier: u32) -> Self {
        self.rate_limit_multiplier = multiplier.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    ///
    /// `2^attempt * base`, multiplied again for rate limits, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32, err: &AppError) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let mut delay = self.base_delay.saturating_mul(factor);
        if matches!(err, AppError::RateLimitExceeded) {
            delay = delay.saturating_mul(self.rate_limit_multiplier);
        }
        delay.min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `operation` receives the 1-based attempt number. On exhaustion the last
    /// error is returned. If `cancel` fires while waiting to retry, the wait is
    /// abandoned and `AppError::Cancelled` is returned; an attempt already in
    /// flight is never interrupted.
    pub async fn run<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, AppError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(self.retryable)(&err) {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!(
                    attempts = attempt,
                    error = %err,
                    "Max retries exhausted"
                );
                return Err(err);
            }

            let delay = self.backoff(attempt, &err);
            debug!(
                attempt,
                max_attempts = self.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient error"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_http_config(&HttpConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = policy(3)
            .run(&CancellationToken::new(), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, AppError>("page")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "page");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_network_errors_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();

        let result = policy(3)
            .run(&CancellationToken::new(), |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(AppError::NetworkError("connection reset".to_string()))
                    } else {
                        Ok(vec![1, 2])
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two delayed retries: 2s after attempt 1, 4s after attempt 2.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), AppError> = policy(3)
            .run(&CancellationToken::new(), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::ServerError(503))
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::ServerError(503))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), AppError> = policy(5)
            .run(&CancellationToken::new(), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::AuthError(401))
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::AuthError(401))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), AppError> = policy(3)
            .with_predicate(|_| false)
            .run(&CancellationToken::new(), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::ServerError(500))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_between_attempts() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let token = cancel.clone();

        let result: Result<(), AppError> = policy(5)
            .run(&cancel, |_| {
                let counter = counter.clone();
                let token = token.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    token.cancel();
                    Err(AppError::Timeout(30))
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let p = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(10));
        let err = AppError::ServerError(500);
        assert_eq!(p.backoff(1, &err), Duration::from_secs(2));
        assert_eq!(p.backoff(2, &err), Duration::from_secs(4));
        assert_eq!(p.backoff(3, &err), Duration::from_secs(8));
        assert_eq!(p.backoff(4, &err), Duration::from_secs(10));
        assert_eq!(p.backoff(40, &err), Duration::from_secs(10));
    }

    #[test]
    fn test_rate_limit_backs_off_longer() {
        let p = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(
            p.backoff(1, &AppError::RateLimitExceeded),
            Duration::from_secs(4)
        );
        assert_eq!(
            p.backoff(1, &AppError::NetworkError("x".into())),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_from_http_config() {
        let p = RetryPolicy::from_http_config(&HttpConfig {
            max_retries: 0,
            ..Default::default()
        });
        assert_eq!(p.max_attempts(), 1);
    }
}
