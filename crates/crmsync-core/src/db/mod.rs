//! Database layer for crmsync

mod conflict_repository;
mod connection;
mod connection_repository;
mod contact_repository;
mod coordination_repository;
mod failed_record_repository;
mod mapping_repository;
mod migrations;
mod sync_log_repository;
mod sync_state_repository;
mod webhook_repository;

use std::str::FromStr;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub use conflict_repository::{ConflictObservation, LibSqlConflictRepository};
pub use connection::Database;
pub use connection_repository::{ConnectionRepository, LibSqlConnectionRepository};
pub use contact_repository::{ContactRepository, LibSqlContactRepository};
pub use coordination_repository::LibSqlCoordinationRepository;
pub use failed_record_repository::LibSqlFailedRecordRepository;
pub use mapping_repository::LibSqlMappingRepository;
pub use sync_log_repository::LibSqlSyncLogRepository;
pub use sync_state_repository::LibSqlSyncStateRepository;
pub use webhook_repository::{LibSqlWebhookRepository, StoredWebhookEvent};

/// Parse a text column into a typed value
fn parse_column<T>(value: &str, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|error| Error::Database(format!("invalid {column} '{value}': {error}")))
}

/// Parse an optional text column into a typed value
fn parse_optional_column<T>(value: Option<String>, column: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.map(|value| parse_column(&value, column)).transpose()
}

/// Decode a JSON text column
fn json_column<T: DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(value)?)
}

/// Row limit as a SQL parameter, saturating instead of wrapping negative
fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Non-negative integer column as `u32`
fn u32_column(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
