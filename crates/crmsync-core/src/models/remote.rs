//! Provider-side record representation

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How far a delta fetch has progressed.
///
/// Adapters that page by modification time store an RFC 3339 instant; the
/// value is otherwise opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(String);

impl Checkpoint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret the checkpoint as an instant, if it was written as one.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.0)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }
}

/// A contact as the provider represents it: a flat property bag keyed by the
/// provider's field names.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Provider id; `None` for records not yet created remotely
    pub external_id: Option<String>,
    pub properties: Map<String, Value>,
    /// Provider modification time, when the provider exposes one
    pub modified_at: Option<DateTime<Utc>>,
    /// Key derived from the local record id used by providers that dedupe creations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl RemoteRecord {
    pub fn new(external_id: Option<String>) -> Self {
        Self {
            external_id,
            ..Self::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn modified_at_millis(&self) -> Option<i64> {
        self.modified_at.map(|at| at.timestamp_millis())
    }
}

/// Change notification received from a provider webhook, queued for the next run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChangeEvent {
    pub external_id: String,
    /// Full record when the payload carried one; otherwise fetched during the run
    pub record: Option<RemoteRecord>,
    pub occurred_at: Option<DateTime<Utc>>,
}
