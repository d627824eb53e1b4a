//! Records waiting for the retry sweep

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ids::{ConnectionId, ContactId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailedRecordStatus {
    /// Eligible for the next retry sweep
    Pending,
    /// Retry age exceeded; needs manual intervention
    Permanent,
}

impl FailedRecordStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Permanent => "permanent",
        }
    }
}

impl FromStr for FailedRecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "permanent" => Ok(Self::Permanent),
            other => Err(format!("unknown failed record status: {other}")),
        }
    }
}

/// A record whose transient failures exhausted the in-run attempt ceiling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub connection_id: ConnectionId,
    /// Local id, when the record is paired or originated locally
    pub local_id: Option<ContactId>,
    /// Remote id, for remote-only records that could not be imported
    pub external_id: Option<String>,
    pub attempts: u32,
    pub first_failed_at: i64,
    pub last_failed_at: i64,
    pub last_error: String,
    pub status: FailedRecordStatus,
}

impl FailedRecord {
    /// Stable key identifying the record within its connection
    pub fn record_key(&self) -> String {
        record_key(self.local_id, self.external_id.as_deref())
    }
}

/// Key used for the failed-record primary key: local id when known.
pub fn record_key(local_id: Option<ContactId>, external_id: Option<&str>) -> String {
    match (local_id, external_id) {
        (Some(local_id), _) => format!("local:{local_id}"),
        (None, Some(external_id)) => format!("remote:{external_id}"),
        (None, None) => "unknown".to_string(),
    }
}
