use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How a failed attempt should be treated by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Explicit rate-limit response - wait with escalating backoff
    RateLimit,
    /// Transient transport failure (timeout, 5xx) - wait the base delay
    Transient,
    /// Permanent failure (e.g. not found, bad request) - don't retry
    Fatal,
}

/// Retry policy for calls against external services
///
/// Transient failures wait `base_delay_ms` between attempts. Rate-limit
/// responses wait `base_delay_ms * backoff_multiplier^(attempt + 1)` so the
/// wait grows each time the service pushes back.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt on rate-limit responses
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_multiplier: 4.0,
        }
    }
}

impl RetryPolicy {
    /// Get the delay before the next attempt, or None when the error is fatal
    fn delay_for(&self, attempt: u32, kind: RetryKind) -> Option<Duration> {
        match kind {
            RetryKind::Fatal => None,
            RetryKind::Transient => Some(Duration::from_millis(self.base_delay_ms)),
            RetryKind::RateLimit => {
                let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32 + 1);
                Some(Duration::from_millis(
                    (self.base_delay_ms as f64 * factor) as u64,
                ))
            }
        }
    }
}

/// Retry an async operation under a policy
///
/// # Arguments
/// * `operation` - The async operation to retry (a closure that returns a Future)
/// * `policy` - Retry policy
/// * `classify_error` - Function to classify errors for retry strategy
///
/// # Returns
/// * `Ok(T)` - Operation succeeded (either on first attempt or after retries)
/// * `Err(E)` - Operation failed fatally or after all retries exhausted
///
/// # Example
/// ```ignore
/// let result = retry_with_backoff(
///     || async { my_api_call().await },
///     &RetryPolicy::default(),
///     |e| if e.is_rate_limit() { RetryKind::RateLimit } else { RetryKind::Fatal },
/// ).await;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    policy: &RetryPolicy,
    classify_error: impl Fn(&E) -> RetryKind,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("✅ Operation succeeded after {} retry attempts", attempt);
                }
                return Ok(result);
            }
            Err(e) => {
                let kind = classify_error(&e);

                if kind == RetryKind::Fatal {
                    error!("❌ Operation failed with non-retryable error: {}", e);
                    return Err(e);
                }

                if attempt >= policy.max_attempts {
                    error!(
                        "❌ Operation failed after {} attempts (max retries exhausted): {}",
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = match policy.delay_for(attempt, kind) {
                    Some(d) => d,
                    None => return Err(e),
                };

                warn!(
                    "⚠️  Operation failed (attempt {}/{}): {} - Retrying in {}ms (error type: {:?})",
                    attempt + 1,
                    policy.max_attempts + 1,
                    e,
                    delay.as_millis(),
                    kind
                );

                tokio::time::sleep(delay).await;

                attempt += 1;
            }
        }
    }
}
