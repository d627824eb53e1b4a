//! Field-level conflict model

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::contact::FieldValue;
use super::ids::{ConflictId, ConnectionId, ContactId};

/// Resolution status of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    ResolvedLocal,
    ResolvedRemote,
    ResolvedManual,
}

impl ConflictStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::ResolvedLocal => "resolved_local",
            Self::ResolvedRemote => "resolved_remote",
            Self::ResolvedManual => "resolved_manual",
        }
    }

    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl FromStr for ConflictStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "resolved_local" => Ok(Self::ResolvedLocal),
            "resolved_remote" => Ok(Self::ResolvedRemote),
            "resolved_manual" => Ok(Self::ResolvedManual),
            other => Err(format!("unknown conflict status: {other}")),
        }
    }
}

/// One unresolved (or formerly unresolved) field divergence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub connection_id: ConnectionId,
    pub local_id: ContactId,
    pub field_path: String,
    pub local_value: FieldValue,
    pub local_modified_at: i64,
    pub remote_value: FieldValue,
    pub remote_modified_at: Option<i64>,
    pub status: ConflictStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub resolved_at: Option<i64>,
}

/// Operator choice when resolving a conflict by hand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "value", rename_all = "snake_case")]
pub enum ConflictChoice {
    KeepLocal,
    KeepRemote,
    /// Use an operator-provided value on both sides
    Custom(FieldValue),
}

impl ConflictChoice {
    pub const fn status(&self) -> ConflictStatus {
        match self {
            Self::KeepLocal => ConflictStatus::ResolvedLocal,
            Self::KeepRemote => ConflictStatus::ResolvedRemote,
            Self::Custom(_) => ConflictStatus::ResolvedManual,
        }
    }
}
