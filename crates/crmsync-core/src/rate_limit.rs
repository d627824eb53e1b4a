//! Per-connection request throttling.
//!
//! Every provider call takes a token from the connection's in-process bucket
//! and, when the connection has a day limit, one unit of its persisted day
//! quota. Callers wait for a token up to `max_wait`; longer waits surface as
//! [`ProviderError::Backpressure`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::models::{Connection, ConnectionId, RateLimitConfig};
use crate::providers::ProviderError;

/// Shared day-quota counter, persisted so it holds across restarts
#[async_trait]
pub trait DailyQuota: Send + Sync {
    /// Count one request for `day`; false when `limit` is already spent
    async fn consume(&self, connection_id: &ConnectionId, day: &str, limit: u32) -> Result<bool>;
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    config: RateLimitConfig,
    tokens: u32,
    next_refill: Instant,
}

impl Bucket {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            config,
            tokens: config.capacity,
            next_refill: now + config.refill_interval(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if now < self.next_refill {
            return;
        }
        let interval = self.config.refill_interval().max(Duration::from_millis(1));
        let elapsed = now.duration_since(self.next_refill);
        let periods = u32::try_from(elapsed.as_nanos() / interval.as_nanos())
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        self.tokens = self
            .tokens
            .saturating_add(self.config.refill_amount.saturating_mul(periods))
            .min(self.config.capacity);
        self.next_refill += interval.saturating_mul(periods);
    }
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<ConnectionId, Bucket>>,
    quota: Option<Arc<dyn DailyQuota>>,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            quota: None,
            max_wait,
        }
    }

    #[must_use]
    pub fn with_quota(mut self, quota: Arc<dyn DailyQuota>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Wait for permission to make one request on behalf of `connection`
    pub async fn acquire(&self, connection: &Connection) -> std::result::Result<(), ProviderError> {
        loop {
            let wait = {
                let now = Instant::now();
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets
                    .entry(connection.id)
                    .or_insert_with(|| Bucket::new(connection.rate_limit, now));
                if bucket.config != connection.rate_limit {
                    bucket.config = connection.rate_limit;
                    bucket.tokens = bucket.tokens.min(bucket.config.capacity);
                }
                bucket.refill(now);

                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    break;
                }
                bucket.next_refill.saturating_duration_since(now)
            };

            if wait > self.max_wait {
                tracing::warn!(
                    connection_id = %connection.id,
                    wait_ms = wait.as_millis(),
                    "Rate limiter backpressure"
                );
                return Err(ProviderError::Backpressure { retry_after: wait });
            }
            tracing::debug!(
                connection_id = %connection.id,
                wait_ms = wait.as_millis(),
                "Waiting for rate limit token"
            );
            tokio::time::sleep(wait).await;
        }

        self.consume_daily(connection).await
    }

    async fn consume_daily(&self, connection: &Connection) -> std::result::Result<(), ProviderError> {
        let (Some(quota), Some(limit)) = (&self.quota, connection.rate_limit.daily_limit) else {
            return Ok(());
        };

        let now = Utc::now();
        let day = now.format("%Y-%m-%d").to_string();
        let admitted = quota
            .consume(&connection.id, &day, limit)
            .await
            .map_err(|error| ProviderError::Transient(format!("day quota unavailable: {error}")))?;
        if admitted {
            return Ok(());
        }

        let until_midnight = now
            .date_naive()
            .checked_add_days(Days::new(1))
            .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
            .map(|midnight| midnight.and_utc() - now)
            .and_then(|delta| delta.to_std().ok())
            .unwrap_or(Duration::from_secs(60 * 60));
        tracing::warn!(
            connection_id = %connection.id,
            daily_limit = limit,
            "Daily request quota exhausted"
        );
        Err(ProviderError::Backpressure {
            retry_after: until_midnight,
        })
    }

    /// Empty the bucket and hold refills until `retry_after` has passed
    pub async fn penalize(&self, connection: &Connection, retry_after: Duration) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(connection.id)
            .or_insert_with(|| Bucket::new(connection.rate_limit, now));
        bucket.tokens = 0;
        bucket.next_refill = bucket.next_refill.max(now + retry_after);
        tracing::info!(
            connection_id = %connection.id,
            retry_after_ms = retry_after.as_millis(),
            "Provider rate limit hit; bucket drained"
        );
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_wait", &self.max_wait)
            .field("persistent_quota", &self.quota.is_some())
            .finish_non_exhaustive()
    }
}
