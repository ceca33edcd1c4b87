//! Bounded retry with exponential backoff for resource downloads.
//!
//! Throttling never reaches this layer: the rate limiter absorbs it below.
//! What is retried here are transient failures such as timeouts, dropped
//! connections and 5xx answers.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::RequestError;

/// Longest wait between two attempts.
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.resource_retry_attempts,
            initial_delay: config.resource_retry_delay,
            max_delay: MAX_DELAY,
            jitter: true,
        }
    }
}

/// Run `operation`, retrying retryable failures up to the policy's bound.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once retries
/// are exhausted.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut attempt = 0;
    let mut delay = policy.initial_delay;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    error = %e,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis(),
                    "Request failed, retrying"
                );
                let wait = if policy.jitter { add_jitter(delay) } else { delay };
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(policy.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Spread a delay by up to ±25%.
fn add_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use reqwest::StatusCode;

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&policy(3), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(RequestError::Status(StatusCode::SERVICE_UNAVAILABLE))
                } else {
                    Ok(call)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RequestError::Status(StatusCode::BAD_GATEWAY)) }
        })
        .await;
        assert!(matches!(result, Err(RequestError::Status(StatusCode::BAD_GATEWAY))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RequestError::NotFound) }
        })
        .await;
        assert!(matches!(result, Err(RequestError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        for _ in 0..100 {
            let jittered = add_jitter(Duration::from_millis(1000));
            assert!(jittered >= Duration::from_millis(750));
            assert!(jittered <= Duration::from_millis(1250));
        }
    }
}
