use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::utils::error::ProviderError;

/// Exponential backoff with jitter for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(45),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based): initial * 2^(attempt-1),
    /// capped at `max_delay`, with +/-50% jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter = rand::rng().random_range(0.5..1.5);
        base.mul_f64(jitter)
    }
}

/// Run `op` under the policy. Retries only when the returned
/// `ProviderError` carries a retryable kind; other kinds fail fast.
pub async fn retry_provider_call<T, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    kind = ?err.kind,
                    delay_ms = delay.as_millis() as u64,
                    "Transient provider failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                debug!(op = op_name, attempt, kind = ?err.kind, "Provider call failed");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::ProviderErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_provider_call(fast_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::new(ProviderErrorKind::RateLimited, "429"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = retry_provider_call(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::new(ProviderErrorKind::BadKey, "401")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let result: Result<u32, _> = retry_provider_call(fast_policy(), "test", || async {
            Err(ProviderError::new(ProviderErrorKind::Timeout, "timed out"))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Timeout);
    }
}
