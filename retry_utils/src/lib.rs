use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classification of errors for retry strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableError {
    /// 429 Rate Limit - retry with twice the normal delay
    RateLimit,
    /// Network, timeout or 5xx failures - retry with the normal delay
    Transient,
    /// Don't retry
    Permanent,
}

/// Exponential backoff policy: attempt `n` (1-based retry number) waits
/// `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including initial attempt)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
            ..Self::default()
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32, error_type: RetryableError) -> Option<Duration> {
        if retry == 0 || retry > self.max_attempts {
            return None;
        }

        let factor = 2u32.saturating_pow(retry - 1);
        let delay = match error_type {
            RetryableError::Permanent => return None,
            RetryableError::Transient => self.base_delay.saturating_mul(factor),
            RetryableError::RateLimit => self.base_delay.saturating_mul(factor).saturating_mul(2),
        };

        Some(delay.min(self.max_delay))
    }
}

/// Result of a retried operation together with the number of attempts it took
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> Retried<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Retry an async operation with exponential backoff
///
/// # Arguments
/// * `operation` - The async operation to retry (should be a closure that returns a Future)
/// * `config` - Retry configuration
/// * `classify_error` - Function to classify errors for retry strategy
///
/// # Example
/// ```ignore
/// let outcome = retry_with_backoff(
///     || async { my_api_call().await },
///     &RetryConfig::exponential(3, 200),
///     |e| if e.is_rate_limit() { RetryableError::RateLimit } else { RetryableError::Transient }
/// ).await;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    config: &RetryConfig,
    classify_error: impl Fn(&E) -> RetryableError,
) -> Retried<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!("Operation succeeded after {} attempts", attempts);
                }
                return Retried {
                    result: Ok(result),
                    attempts,
                };
            }
            Err(e) => {
                let error_type = classify_error(&e);

                let delay = match config.delay_for(attempts, error_type) {
                    Some(d) => d,
                    None => {
                        debug!(
                            "Operation failed after {} attempt(s), not retrying: {}",
                            attempts, e
                        );
                        return Retried {
                            result: Err(e),
                            attempts,
                        };
                    }
                };

                warn!(
                    "Operation failed (attempt {}/{}): {} - retrying in {}ms ({:?})",
                    attempts,
                    config.max_attempts + 1,
                    e,
                    delay.as_millis(),
                    error_type
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
