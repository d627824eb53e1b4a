//! Retry policy for provider calls made during a run

use std::future::Future;
use std::time::Duration;

use crate::config::RunSettings;
use crate::providers::ProviderError;

/// Transient failures are retried up to `max_attempts` with doubling delays.
/// Rate-limit responses are waited out without using an attempt, as long as
/// the total wait stays within `wait_budget`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub wait_budget: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RunSettings) -> Self {
        Self {
            max_attempts: settings.record_max_attempts.max(1),
            base_delay: settings.retry_base_delay,
            wait_budget: settings.rate_limit_wait_budget,
        }
    }

    /// Delay before retry number `retry` (1-based)
    fn backoff(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(retry.saturating_sub(1).min(16)))
    }

    /// Run `op` until it succeeds, fails permanently, or retries are exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempts = 0_u32;
        let mut rate_limited = 0_u32;
        let mut waited = Duration::ZERO;

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let delay = match &error {
                ProviderError::RateLimited { retry_after }
                | ProviderError::Backpressure { retry_after } => {
                    rate_limited += 1;
                    let delay = (*retry_after).max(self.backoff(rate_limited));
                    if waited + delay > self.wait_budget {
                        tracing::warn!(
                            call = label,
                            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                            "Rate-limit wait budget exhausted"
                        );
                        return Err(error);
                    }
                    waited += delay;
                    delay
                }
                ProviderError::Transient(message) => {
                    attempts += 1;
                    if attempts >= self.max_attempts {
                        return Err(error);
                    }
                    tracing::debug!(call = label, attempt = attempts, %message, "Retrying transient failure");
                    self.backoff(attempts)
                }
                _ => return Err(error),
            };
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RunSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            wait_budget: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_up_to_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .run("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Transient("502".into()))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success_returns_value() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = policy()
            .run("upsert", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::Transient("timeout".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_wait_without_using_attempts() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = policy()
            .run("fetch", || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0..=4 => Err(ProviderError::RateLimited {
                        retry_after: Duration::from_secs(2),
                    }),
                    _ => Ok("page"),
                }
            })
            .await;

        assert_eq!(result.unwrap(), "page");
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_wait_is_bounded_by_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .run("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::RateLimited {
                    retry_after: Duration::from_secs(20),
                })
            })
            .await;

        assert!(matches!(result, Err(ProviderError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .run("upsert", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Validation("bad email".into()))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
