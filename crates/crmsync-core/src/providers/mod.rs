//! CRM provider adapters
//!
//! Each adapter speaks one provider's REST API and normalizes its records and
//! failures into [`RemoteRecord`] and [`ProviderError`]. Adapters are picked by
//! [`Provider`] through the [`AdapterRegistry`].

mod credentials;
mod http;
mod hubspot;
mod pipedrive;
mod salesforce;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::models::{Checkpoint, Connection, Provider, RecordErrorKind, RemoteRecord};
use crate::rate_limit::RateLimiter;

pub use credentials::{Credential, CredentialVault, FileCredentialVault, MemoryCredentialVault};
pub use http::{classify_status, ProviderHttp};
pub use hubspot::HubSpotAdapter;
pub use pipedrive::PipedriveAdapter;
pub(crate) use pipedrive::to_record as pipedrive_record;
pub use salesforce::SalesforceAdapter;

/// Normalized provider failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Credential missing, expired beyond refresh, or revoked
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider asked us to slow down
    #[error("rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// Provider rejected the payload
    #[error("rejected by provider: {0}")]
    Validation(String),

    /// Network failure, timeout or provider 5xx
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Local limiter would have to wait longer than allowed
    #[error("rate limiter backpressure, retry after {}ms", retry_after.as_millis())]
    Backpressure { retry_after: Duration },
}

impl ProviderError {
    /// Delay requested by a rate limit, if this is one
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } | Self::Backpressure { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub const fn kind(&self) -> RecordErrorKind {
        match self {
            Self::Auth(_) => RecordErrorKind::Auth,
            Self::RateLimited { .. } | Self::Backpressure { .. } => RecordErrorKind::RateLimited,
            Self::Validation(_) => RecordErrorKind::Validation,
            Self::Transient(_) => RecordErrorKind::Transient,
            Self::NotFound(_) => RecordErrorKind::NotFound,
        }
    }
}

/// One page request for changed records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    /// Only records modified at or after this point; `None` fetches everything
    pub since: Option<Checkpoint>,
    /// Cursor returned by the previous page
    pub page_token: Option<String>,
    /// Provider field names to include
    pub properties: Vec<String>,
}

/// One page of changed records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchPage {
    pub records: Vec<RemoteRecord>,
    pub next_page_token: Option<String>,
    /// Latest modification seen on this page, or the requested `since`
    pub checkpoint: Option<Checkpoint>,
}

/// Result of a confirmed remote write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub external_id: String,
    /// Provider modification time (unix ms), when the response carried one
    pub modified_at: Option<i64>,
}

/// Contract every provider adapter fulfils
#[async_trait]
pub trait CrmAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Return a usable credential, refreshing it first when it is about to expire
    async fn authenticate(&self, connection: &Connection) -> std::result::Result<Credential, ProviderError>;

    async fn fetch_changed(
        &self,
        connection: &Connection,
        credential: &Credential,
        request: &FetchRequest,
    ) -> std::result::Result<FetchPage, ProviderError>;

    /// Fetch one record; `None` when the provider no longer has it
    async fn fetch_record(
        &self,
        connection: &Connection,
        credential: &Credential,
        external_id: &str,
        properties: &[String],
    ) -> std::result::Result<Option<RemoteRecord>, ProviderError>;

    /// Create the record when it has no external id, update it otherwise
    async fn upsert_remote(
        &self,
        connection: &Connection,
        credential: &Credential,
        record: &RemoteRecord,
    ) -> std::result::Result<UpsertOutcome, ProviderError>;
}

/// Adapters keyed by provider
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn CrmAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three production adapters
    pub fn with_defaults(
        config: &EngineConfig,
        limiter: Arc<RateLimiter>,
        vault: Arc<dyn CredentialVault>,
    ) -> Result<Self> {
        let http = ProviderHttp::new(config.http_timeout, limiter)?;
        let mut registry = Self::new();
        registry.register(Arc::new(HubSpotAdapter::new(
            http.clone(),
            Arc::clone(&vault),
            config.hubspot.clone(),
        )));
        registry.register(Arc::new(SalesforceAdapter::new(
            http.clone(),
            Arc::clone(&vault),
            config.salesforce.clone(),
            config.salesforce_login_url.clone(),
        )));
        registry.register(Arc::new(PipedriveAdapter::new(http, vault)));
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn CrmAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn CrmAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("no adapter registered for {provider}")))
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Later of two checkpoints; instants compare by time, opaque cursors prefer `next`
pub fn later_checkpoint(current: Option<Checkpoint>, next: Option<Checkpoint>) -> Option<Checkpoint> {
    match (current, next) {
        (None, next) => next,
        (current, None) => current,
        (Some(current), Some(next)) => match (current.as_datetime(), next.as_datetime()) {
            (Some(a), Some(b)) if a > b => Some(current),
            _ => Some(next),
        },
    }
}

/// Latest modification time across records, falling back to `since`
pub(crate) fn page_checkpoint(records: &[RemoteRecord], since: Option<&Checkpoint>) -> Option<Checkpoint> {
    let latest = records
        .iter()
        .filter_map(|record| record.modified_at)
        .max()
        .map(Checkpoint::from_datetime);
    later_checkpoint(since.cloned(), latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn later_checkpoint_compares_instants() {
        let early = Checkpoint::from_datetime(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let late = Checkpoint::from_datetime(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());

        assert_eq!(later_checkpoint(Some(late.clone()), Some(early.clone())), Some(late.clone()));
        assert_eq!(later_checkpoint(Some(early), Some(late.clone())), Some(late.clone()));
        assert_eq!(later_checkpoint(None, Some(late.clone())), Some(late.clone()));
        assert_eq!(later_checkpoint(Some(late.clone()), None), Some(late));
    }

    #[test]
    fn page_checkpoint_falls_back_to_since() {
        let since = Checkpoint::from_datetime(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(page_checkpoint(&[], Some(&since)), Some(since.clone()));

        let mut record = RemoteRecord::new(Some("1".into()));
        record.modified_at = Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
        assert_eq!(
            page_checkpoint(&[record], Some(&since)),
            Some(Checkpoint::from_datetime(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()))
        );
    }

    #[test]
    fn error_kinds_and_retry_hints() {
        let limited = ProviderError::RateLimited {
            retry_after: Duration::from_secs(2),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(limited.kind(), RecordErrorKind::RateLimited);
        assert!(ProviderError::Transient("502".into()).is_transient());
        assert_eq!(ProviderError::NotFound("x".into()).retry_after(), None);
    }
}
