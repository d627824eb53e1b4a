//! Sync run log model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ids::{ConnectionId, ContactId, RunId};

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
    Retry,
}

/// Scope of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "local_id", rename_all = "snake_case")]
pub enum RunMode {
    /// Ignore checkpoints and re-evaluate every record
    Full,
    /// Only records changed since the last checkpoints
    Delta,
    /// One local record, evaluated as a full run
    SingleRecord(ContactId),
}

/// Terminal or in-flight state of a run log row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    Cancelled,
    /// Another run held the connection's lock
    Skipped,
}

macro_rules! str_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

str_enum!(RunTrigger {
    Scheduled => "scheduled",
    Manual => "manual",
    Retry => "retry",
});

str_enum!(RunStatus {
    Running => "running",
    Completed => "completed",
    Aborted => "aborted",
    Cancelled => "cancelled",
    Skipped => "skipped",
});

impl RunMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Delta => "delta",
            Self::SingleRecord(_) => "single_record",
        }
    }

    pub const fn ignores_checkpoint(self) -> bool {
        !matches!(self, Self::Delta)
    }
}

/// Error class recorded against a record in the run log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordErrorKind {
    Validation,
    Transient,
    RateLimited,
    NotFound,
    Auth,
    Storage,
}

str_enum!(RecordErrorKind {
    Validation => "validation",
    Transient => "transient",
    RateLimited => "rate_limited",
    NotFound => "not_found",
    Auth => "auth",
    Storage => "storage",
});

/// One per-record error entry, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunErrorEntry {
    pub kind: RecordErrorKind,
    pub local_id: Option<ContactId>,
    pub external_id: Option<String>,
    /// Canonical field path for per-field mapping errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    pub at: i64,
}

/// Per-run counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub scanned: u32,
    pub upserted_local: u32,
    pub upserted_remote: u32,
    pub skipped: u32,
    pub failed: u32,
    pub conflicts: u32,
}

/// A persisted sync run log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: RunId,
    pub connection_id: ConnectionId,
    pub trigger: RunTrigger,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub counts: RunCounts,
    pub abort_reason: Option<String>,
    pub errors: Vec<RunErrorEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_enums_roundtrip() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Aborted,
            RunStatus::Cancelled,
            RunStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert_eq!("retry".parse::<RunTrigger>().unwrap(), RunTrigger::Retry);
        assert!("weekly".parse::<RunTrigger>().is_err());
    }

    #[test]
    fn run_mode_serializes_with_record_id() {
        let id = ContactId::new();
        let json = serde_json::to_value(RunMode::SingleRecord(id)).unwrap();
        assert_eq!(json["kind"], "single_record");
        assert_eq!(json["local_id"], id.to_string());
        assert!(RunMode::Full.ignores_checkpoint());
        assert!(!RunMode::Delta.ignores_checkpoint());
    }
}
