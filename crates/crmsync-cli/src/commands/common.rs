use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use crmsync_core::config::EngineConfig;
use crmsync_core::models::{
    Conflict, ConflictId, Connection, ConnectionId, ContactId, FieldValue, SyncRun, TenantId,
};
use crmsync_core::services::{SyncService, SyncStore};
use serde::Serialize;

use crate::error::CliError;

/// How often a waiting command re-reads the run log
pub const RUN_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct Context {
    pub config: EngineConfig,
    pub service: SyncService,
}

impl Context {
    pub fn store(&self) -> &SyncStore {
        self.service.store()
    }
}

pub async fn open_context(db_path: Option<&Path>) -> Result<Context, CliError> {
    let mut config = EngineConfig::from_env()?;
    if let Some(path) = db_path {
        config.database_path = path.to_path_buf();
    }

    let store = SyncStore::open_path(config.database_path.clone()).await?;
    let service = SyncService::from_config(&config, store)?;
    Ok(Context { config, service })
}

fn parse_id<T: FromStr>(kind: &'static str, value: &str) -> Result<T, CliError> {
    value.trim().parse().map_err(|_| CliError::InvalidId {
        kind,
        value: value.to_string(),
    })
}

pub fn parse_connection_id(value: &str) -> Result<ConnectionId, CliError> {
    parse_id("connection", value)
}

pub fn parse_contact_id(value: &str) -> Result<ContactId, CliError> {
    parse_id("contact", value)
}

pub fn parse_conflict_id(value: &str) -> Result<ConflictId, CliError> {
    parse_id("conflict", value)
}

pub fn parse_tenant_id(value: &str) -> Result<TenantId, CliError> {
    parse_id("tenant", value)
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn format_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => "(empty)".to_string(),
        FieldValue::Text(text) | FieldValue::Enum(text) => text.clone(),
        FieldValue::Date(date) => date.to_string(),
        FieldValue::List(items) => items.join(", "),
    }
}

pub fn format_connection_line(connection: &Connection) -> String {
    let mut line = format!(
        "{}  {:<10}  {:<12}  tenant={}  policy={}",
        connection.id,
        connection.provider.as_str(),
        connection.status.as_str(),
        short_id(&connection.tenant_id.to_string()),
        connection.conflict_policy.as_str()
    );
    if let Some(error) = &connection.last_error {
        line.push_str(&format!("  last_error=\"{error}\""));
    }
    line
}

pub fn format_run_line(run: &SyncRun) -> String {
    let now_ms = Utc::now().timestamp_millis();
    let counts = &run.counts;
    let mut line = format!(
        "{}  {:<9}  {:<13}  {:<9}  {:>8}  scanned={} local={} remote={} skipped={} failed={} conflicts={}",
        short_id(&run.id.to_string()),
        run.status.as_str(),
        run.mode.as_str(),
        run.trigger.as_str(),
        format_relative_time(run.started_at, now_ms),
        counts.scanned,
        counts.upserted_local,
        counts.upserted_remote,
        counts.skipped,
        counts.failed,
        counts.conflicts
    );
    if let Some(reason) = &run.abort_reason {
        line.push_str(&format!("  reason=\"{reason}\""));
    }
    line
}

pub fn format_conflict_line(conflict: &Conflict) -> String {
    format!(
        "{}  {:<15}  contact={}  {}  local=\"{}\" remote=\"{}\"  {}",
        conflict.id,
        conflict.status.as_str(),
        short_id(&conflict.local_id.to_string()),
        conflict.field_path,
        format_value(&conflict.local_value),
        format_value(&conflict.remote_value),
        format_timestamp(conflict.created_at)
    )
}
