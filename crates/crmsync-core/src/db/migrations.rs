//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, V1_STATEMENTS).await?;
    }
    if version < 2 {
        apply(conn, 2, V2_STATEMENTS).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Version 1: host contacts and the core sync bookkeeping tables
const V1_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS contacts (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        first_name TEXT,
        last_name TEXT,
        email TEXT,
        phones TEXT NOT NULL DEFAULT '[]',
        company TEXT,
        job_title TEXT,
        lifecycle_stage TEXT,
        birthday TEXT,
        custom_fields TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_contacts_tenant_updated ON contacts(tenant_id, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_contacts_tenant_email ON contacts(tenant_id, email COLLATE NOCASE)",
    "CREATE TABLE IF NOT EXISTS crm_connections (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        credential_ref TEXT NOT NULL,
        status TEXT NOT NULL,
        rate_limit TEXT NOT NULL,
        conflict_policy TEXT NOT NULL,
        natural_key TEXT NOT NULL,
        remote_checkpoint TEXT,
        local_checkpoint INTEGER,
        health_failures INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_crm_connections_live
        ON crm_connections(tenant_id, provider)
        WHERE status != 'disconnected'",
    "CREATE TABLE IF NOT EXISTS crm_field_mappings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        connection_id TEXT NOT NULL REFERENCES crm_connections(id) ON DELETE CASCADE,
        local_path TEXT NOT NULL,
        remote_key TEXT NOT NULL,
        direction TEXT NOT NULL,
        transform TEXT,
        origin TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE INDEX IF NOT EXISTS idx_crm_field_mappings_connection ON crm_field_mappings(connection_id)",
    "CREATE TABLE IF NOT EXISTS crm_sync_state (
        connection_id TEXT NOT NULL REFERENCES crm_connections(id) ON DELETE CASCADE,
        local_id TEXT NOT NULL,
        external_id TEXT,
        local_version INTEGER NOT NULL,
        remote_version INTEGER,
        last_synced_at INTEGER NOT NULL,
        unlinked_at INTEGER,
        baseline TEXT NOT NULL DEFAULT '{}',
        open_conflict_id TEXT,
        PRIMARY KEY (connection_id, local_id)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_crm_sync_state_external
        ON crm_sync_state(connection_id, external_id)
        WHERE external_id IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS crm_sync_logs (
        id TEXT PRIMARY KEY,
        connection_id TEXT NOT NULL,
        trigger TEXT NOT NULL,
        mode TEXT NOT NULL,
        local_id TEXT,
        status TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        finished_at INTEGER,
        scanned INTEGER NOT NULL DEFAULT 0,
        upserted_local INTEGER NOT NULL DEFAULT 0,
        upserted_remote INTEGER NOT NULL DEFAULT 0,
        skipped INTEGER NOT NULL DEFAULT 0,
        failed INTEGER NOT NULL DEFAULT 0,
        conflicts INTEGER NOT NULL DEFAULT 0,
        abort_reason TEXT,
        errors TEXT NOT NULL DEFAULT '[]'
    )",
    "CREATE INDEX IF NOT EXISTS idx_crm_sync_logs_connection
        ON crm_sync_logs(connection_id, started_at DESC)",
    "CREATE TABLE IF NOT EXISTS crm_conflicts (
        id TEXT PRIMARY KEY,
        connection_id TEXT NOT NULL,
        local_id TEXT NOT NULL,
        field_path TEXT NOT NULL,
        local_value TEXT NOT NULL,
        local_modified_at INTEGER NOT NULL,
        remote_value TEXT NOT NULL,
        remote_modified_at INTEGER,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        resolved_at INTEGER
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_crm_conflicts_open
        ON crm_conflicts(connection_id, local_id, field_path)
        WHERE status = 'open'",
    "CREATE INDEX IF NOT EXISTS idx_crm_conflicts_status ON crm_conflicts(status, created_at)",
    "INSERT INTO schema_version (version) VALUES (1)",
];

/// Version 2: retry queue, webhook inbox and cross-process coordination
const V2_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS crm_failed_records (
        connection_id TEXT NOT NULL,
        record_key TEXT NOT NULL,
        local_id TEXT,
        external_id TEXT,
        attempts INTEGER NOT NULL,
        first_failed_at INTEGER NOT NULL,
        last_failed_at INTEGER NOT NULL,
        last_error TEXT NOT NULL,
        status TEXT NOT NULL,
        PRIMARY KEY (connection_id, record_key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_crm_failed_records_status
        ON crm_failed_records(status, last_failed_at)",
    "CREATE TABLE IF NOT EXISTS crm_webhook_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        connection_id TEXT NOT NULL,
        external_id TEXT NOT NULL,
        record TEXT,
        occurred_at INTEGER,
        received_at INTEGER NOT NULL,
        processed_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_crm_webhook_events_pending
        ON crm_webhook_events(connection_id, processed_at)",
    "CREATE TABLE IF NOT EXISTS crm_run_locks (
        connection_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        acquired_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS crm_rate_quota (
        connection_id TEXT NOT NULL,
        day TEXT NOT NULL,
        used INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (connection_id, day)
    )",
    "INSERT INTO schema_version (version) VALUES (2)",
];

/// Apply one migration's statements in a single transaction
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version} of {CURRENT_VERSION}");
    Ok(())
}
