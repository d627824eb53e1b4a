//! Shared database service used by the engine, the CLI and the API.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::Connection as LibSqlConnection;
use tokio::sync::Mutex;

use crate::db::{
    ConflictObservation, ConnectionRepository, ContactRepository, Database,
    LibSqlConflictRepository, LibSqlConnectionRepository, LibSqlContactRepository,
    LibSqlCoordinationRepository, LibSqlFailedRecordRepository, LibSqlMappingRepository,
    LibSqlSyncLogRepository, LibSqlSyncStateRepository, LibSqlWebhookRepository,
    StoredWebhookEvent,
};
use crate::error::{Error, Result};
use crate::mapping::{default_mappings, FieldMapping, MappingSet};
use crate::models::{
    Checkpoint, Conflict, ConflictId, ConflictStatus, Connection, ConnectionId, ConnectionStatus,
    Contact, ContactId, FailedRecord, NaturalKey, RemoteChangeEvent, RunId, RunStatus, SyncRun,
    SyncState, TenantId,
};
use crate::rate_limit::DailyQuota;
use crate::sync::ConflictDraft;

/// Local contact write that belongs to a record commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalWrite {
    Insert(Contact),
    Update(Contact),
}

/// Everything one reconciled record persists, committed atomically
#[derive(Debug, Clone)]
pub struct RecordCommit {
    pub local: Option<LocalWrite>,
    pub state: SyncState,
    /// Divergences left open for an operator
    pub conflicts: Vec<ConflictDraft>,
    /// Open conflicts this pass settled
    pub resolved: Vec<(ConflictId, ConflictStatus)>,
}

/// Thread-safe service for DB and repository operations.
#[derive(Clone)]
pub struct SyncStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl SyncStore {
    /// Open the database at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&db_path).await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    // Connections

    /// Insert a connection together with its provider's default mappings.
    pub async fn add_connection(&self, connection: &Connection) -> Result<()> {
        let defaults = MappingSet::validate(default_mappings(connection.provider))?;
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<()> = async {
            LibSqlConnectionRepository::new(conn).insert(connection).await?;
            LibSqlMappingRepository::new(conn)
                .replace(&connection.id, &defaults)
                .await
        }
        .await;
        finish_transaction(conn, result).await
    }

    pub async fn get_connection(&self, id: &ConnectionId) -> Result<Option<Connection>> {
        let db = self.db.lock().await;
        LibSqlConnectionRepository::new(db.connection()).get(id).await
    }

    /// Fetch a connection or fail with `NotFound`.
    pub async fn require_connection(&self, id: &ConnectionId) -> Result<Connection> {
        self.get_connection(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))
    }

    pub async fn list_connections(&self, tenant: Option<&TenantId>) -> Result<Vec<Connection>> {
        let db = self.db.lock().await;
        LibSqlConnectionRepository::new(db.connection()).list(tenant).await
    }

    pub async fn list_active_connections(&self) -> Result<Vec<Connection>> {
        let db = self.db.lock().await;
        LibSqlConnectionRepository::new(db.connection())
            .list_active()
            .await
    }

    pub async fn update_connection(&self, connection: &Connection) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlConnectionRepository::new(db.connection())
            .update(connection)
            .await
    }

    pub async fn set_connection_status(
        &self,
        id: &ConnectionId,
        status: ConnectionStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlConnectionRepository::new(db.connection())
            .set_status(id, status, last_error)
            .await
    }

    pub async fn set_connection_health(
        &self,
        id: &ConnectionId,
        failures: u32,
        last_error: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlConnectionRepository::new(db.connection())
            .set_health(id, failures, last_error)
            .await
    }

    pub async fn save_checkpoints(
        &self,
        id: &ConnectionId,
        remote: Option<&Checkpoint>,
        local: Option<i64>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlConnectionRepository::new(db.connection())
            .save_checkpoints(id, remote, local)
            .await
    }

    // Mappings

    pub async fn load_mappings(&self, connection_id: &ConnectionId) -> Result<MappingSet> {
        let db = self.db.lock().await;
        LibSqlMappingRepository::new(db.connection())
            .load(connection_id)
            .await
    }

    /// Validate and store a connection's full mapping set.
    pub async fn replace_mappings(
        &self,
        connection_id: &ConnectionId,
        rows: Vec<FieldMapping>,
    ) -> Result<MappingSet> {
        let set = MappingSet::validate(rows)?;
        let db = self.db.lock().await;
        LibSqlMappingRepository::new(db.connection())
            .replace(connection_id, &set)
            .await?;
        Ok(set)
    }

    // Contacts

    pub async fn get_contact(&self, id: &ContactId) -> Result<Option<Contact>> {
        let db = self.db.lock().await;
        LibSqlContactRepository::new(db.connection()).get(id).await
    }

    pub async fn list_contacts_changed_since(
        &self,
        tenant: &TenantId,
        since: Option<i64>,
    ) -> Result<Vec<Contact>> {
        let db = self.db.lock().await;
        LibSqlContactRepository::new(db.connection())
            .list_changed_since(tenant, since)
            .await
    }

    pub async fn find_contacts_by_natural_key(
        &self,
        tenant: &TenantId,
        key: NaturalKey,
        value: &str,
    ) -> Result<Vec<Contact>> {
        let db = self.db.lock().await;
        LibSqlContactRepository::new(db.connection())
            .find_by_natural_key(tenant, key, value)
            .await
    }

    pub async fn insert_contact(&self, contact: &Contact) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlContactRepository::new(db.connection())
            .insert(contact)
            .await
    }

    pub async fn update_contact(&self, contact: &Contact) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlContactRepository::new(db.connection())
            .update(contact)
            .await
    }

    pub async fn delete_contact(&self, id: &ContactId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlContactRepository::new(db.connection()).delete(id).await
    }

    // Sync state

    pub async fn get_state(
        &self,
        connection_id: &ConnectionId,
        local_id: &ContactId,
    ) -> Result<Option<SyncState>> {
        let db = self.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .get(connection_id, local_id)
            .await
    }

    pub async fn get_state_by_external(
        &self,
        connection_id: &ConnectionId,
        external_id: &str,
    ) -> Result<Option<SyncState>> {
        let db = self.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .get_by_external(connection_id, external_id)
            .await
    }

    /// Write a state row on its own (used when a combined commit failed)
    pub async fn save_state(&self, state: &SyncState) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .upsert(state)
            .await
    }

    pub async fn mark_unlinked(
        &self,
        connection_id: &ConnectionId,
        local_id: &ContactId,
        at: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .mark_unlinked(connection_id, local_id, at)
            .await
    }

    pub async fn delete_state(&self, connection_id: &ConnectionId, local_id: &ContactId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .delete(connection_id, local_id)
            .await
    }

    pub async fn count_states(&self, connection_id: &ConnectionId) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .count(connection_id)
            .await
    }

    /// Persist one reconciled record in a single transaction.
    ///
    /// Returns the stored state with its open conflict reference filled in.
    pub async fn commit_record(&self, commit: RecordCommit, now: i64) -> Result<SyncState> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = write_record(conn, commit, now).await;
        finish_transaction(conn, result).await
    }

    // Conflicts

    pub async fn get_conflict(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection()).get(id).await
    }

    pub async fn list_conflicts(
        &self,
        connection_id: &ConnectionId,
        status: Option<ConflictStatus>,
        limit: usize,
    ) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list(connection_id, status, limit)
            .await
    }

    pub async fn list_open_conflicts_for_record(
        &self,
        connection_id: &ConnectionId,
        local_id: &ContactId,
    ) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_open_for_record(connection_id, local_id)
            .await
    }

    pub async fn list_stale_conflicts(&self, cutoff: i64, limit: usize) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_open_older_than(cutoff, limit)
            .await
    }

    pub async fn count_open_conflicts(&self, connection_id: &ConnectionId) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .count_open(connection_id)
            .await
    }

    /// Apply an operator decision: optional local write, new baseline and the
    /// conflict status, all in one transaction. False when the conflict was
    /// no longer open.
    pub async fn settle_conflict(
        &self,
        conflict: &Conflict,
        status: ConflictStatus,
        local: Option<&Contact>,
        state: Option<&SyncState>,
        now: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<bool> = async {
            let closed = LibSqlConflictRepository::new(conn)
                .resolve(&conflict.id, status, now)
                .await?;
            if !closed {
                return Ok(false);
            }
            if let Some(contact) = local {
                LibSqlContactRepository::new(conn).update(contact).await?;
            }
            if let Some(state) = state {
                LibSqlSyncStateRepository::new(conn).upsert(state).await?;
            }
            Ok(true)
        }
        .await;
        finish_transaction(conn, result).await
    }

    // Run logs

    pub async fn insert_run(&self, run: &SyncRun) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncLogRepository::new(db.connection()).insert(run).await
    }

    pub async fn close_run(&self, run: &SyncRun) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlSyncLogRepository::new(db.connection()).close(run).await
    }

    pub async fn get_run(&self, id: &RunId) -> Result<Option<SyncRun>> {
        let db = self.db.lock().await;
        LibSqlSyncLogRepository::new(db.connection()).get(id).await
    }

    pub async fn list_recent_runs(
        &self,
        connection_id: &ConnectionId,
        limit: usize,
    ) -> Result<Vec<SyncRun>> {
        let db = self.db.lock().await;
        LibSqlSyncLogRepository::new(db.connection())
            .list_recent(connection_id, limit)
            .await
    }

    pub async fn latest_run_with_status(
        &self,
        connection_id: &ConnectionId,
        status: RunStatus,
    ) -> Result<Option<SyncRun>> {
        let db = self.db.lock().await;
        LibSqlSyncLogRepository::new(db.connection())
            .latest_with_status(connection_id, status)
            .await
    }

    pub async fn delete_runs_before(&self, cutoff: i64) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlSyncLogRepository::new(db.connection())
            .delete_closed_before(cutoff)
            .await
    }

    // Failed records

    pub async fn record_failure(
        &self,
        connection_id: &ConnectionId,
        local_id: Option<ContactId>,
        external_id: Option<&str>,
        error: &str,
        now: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlFailedRecordRepository::new(db.connection())
            .record_failure(connection_id, local_id, external_id, error, now)
            .await
    }

    pub async fn clear_failure(
        &self,
        connection_id: &ConnectionId,
        local_id: Option<ContactId>,
        external_id: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlFailedRecordRepository::new(db.connection())
            .clear(connection_id, local_id, external_id)
            .await
    }

    pub async fn list_pending_failures(&self, limit: usize) -> Result<Vec<FailedRecord>> {
        let db = self.db.lock().await;
        LibSqlFailedRecordRepository::new(db.connection())
            .list_pending(limit)
            .await
    }

    pub async fn list_failures_for_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Vec<FailedRecord>> {
        let db = self.db.lock().await;
        LibSqlFailedRecordRepository::new(db.connection())
            .list_for_connection(connection_id)
            .await
    }

    pub async fn mark_failures_permanent_before(&self, cutoff: i64) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlFailedRecordRepository::new(db.connection())
            .mark_permanent_before(cutoff)
            .await
    }

    // Webhook events

    pub async fn enqueue_events(
        &self,
        connection_id: &ConnectionId,
        events: &[RemoteChangeEvent],
        now: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlWebhookRepository::new(db.connection())
            .enqueue(connection_id, events, now)
            .await
    }

    pub async fn list_pending_events(
        &self,
        connection_id: &ConnectionId,
        limit: usize,
    ) -> Result<Vec<StoredWebhookEvent>> {
        let db = self.db.lock().await;
        LibSqlWebhookRepository::new(db.connection())
            .list_pending(connection_id, limit)
            .await
    }

    pub async fn mark_events_processed(&self, ids: &[i64], now: i64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let db = self.db.lock().await;
        LibSqlWebhookRepository::new(db.connection())
            .mark_processed(ids, now)
            .await
    }

    pub async fn delete_events_before(&self, cutoff: i64) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlWebhookRepository::new(db.connection())
            .delete_processed_before(cutoff)
            .await
    }

    // Coordination

    pub async fn try_acquire_lock(
        &self,
        connection_id: &ConnectionId,
        run_id: &RunId,
        now: i64,
        ttl_ms: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlCoordinationRepository::new(db.connection())
            .try_acquire_lock(connection_id, run_id, now, ttl_ms)
            .await
    }

    pub async fn renew_lock(
        &self,
        connection_id: &ConnectionId,
        run_id: &RunId,
        now: i64,
        ttl_ms: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlCoordinationRepository::new(db.connection())
            .renew_lock(connection_id, run_id, now, ttl_ms)
            .await
    }

    pub async fn release_lock(&self, connection_id: &ConnectionId, run_id: &RunId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlCoordinationRepository::new(db.connection())
            .release_lock(connection_id, run_id)
            .await
    }

    pub async fn lock_holder(&self, connection_id: &ConnectionId, now: i64) -> Result<Option<String>> {
        let db = self.db.lock().await;
        LibSqlCoordinationRepository::new(db.connection())
            .lock_holder(connection_id, now)
            .await
    }

    pub async fn prune_quota(&self, keep_day: &str) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlCoordinationRepository::new(db.connection())
            .prune_quota(keep_day)
            .await
    }
}

#[async_trait]
impl DailyQuota for SyncStore {
    async fn consume(&self, connection_id: &ConnectionId, day: &str, limit: u32) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlCoordinationRepository::new(db.connection())
            .consume_daily_quota(connection_id, day, limit)
            .await
    }
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

async fn write_record(conn: &LibSqlConnection, commit: RecordCommit, now: i64) -> Result<SyncState> {
    let RecordCommit {
        local,
        mut state,
        conflicts,
        resolved,
    } = commit;

    let contacts = LibSqlContactRepository::new(conn);
    match &local {
        Some(LocalWrite::Insert(contact)) => contacts.insert(contact).await?,
        Some(LocalWrite::Update(contact)) => contacts.update(contact).await?,
        None => {}
    }

    let conflict_repo = LibSqlConflictRepository::new(conn);
    for (id, status) in &resolved {
        conflict_repo.resolve(id, *status, now).await?;
    }
    let mut opened = Vec::with_capacity(conflicts.len());
    for draft in &conflicts {
        let observation = ConflictObservation {
            field_path: &draft.field_path,
            local_value: &draft.local_value,
            local_modified_at: draft.local_modified_at.unwrap_or_default(),
            remote_value: &draft.remote_value,
            remote_modified_at: draft.remote_modified_at,
        };
        opened.push(
            conflict_repo
                .upsert_open(&state.connection_id, &state.local_id, &observation, now)
                .await?,
        );
    }

    state.open_conflict_id = opened.first().copied();
    LibSqlSyncStateRepository::new(conn).upsert(&state).await?;
    Ok(state)
}

async fn finish_transaction<T>(conn: &LibSqlConnection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(error) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldValue, Provider};
    use pretty_assertions::assert_eq;

    async fn store_with_connection() -> (SyncStore, Connection) {
        let store = SyncStore::open_in_memory().await.unwrap();
        let connection = Connection::new(TenantId::new(), Provider::HubSpot, "vault:hubspot");
        store.add_connection(&connection).await.unwrap();
        (store, connection)
    }

    fn draft(field: &str) -> ConflictDraft {
        ConflictDraft {
            field_path: field.to_string(),
            local_value: FieldValue::Text("local".into()),
            local_modified_at: Some(10),
            remote_value: FieldValue::Text("remote".into()),
            remote_modified_at: Some(20),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn add_connection_installs_default_mappings() {
        let (store, connection) = store_with_connection().await;
        let mappings = store.load_mappings(&connection.id).await.unwrap();
        assert!(!mappings.is_empty());
        assert_eq!(
            store.require_connection(&connection.id).await.unwrap().id,
            connection.id
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commit_record_writes_contact_state_and_conflicts() {
        let (store, connection) = store_with_connection().await;
        let contact = Contact::new(connection.tenant_id);
        let mut state = SyncState::new(connection.id, contact.id);
        state.external_id = Some("101".into());

        let stored = store
            .commit_record(
                RecordCommit {
                    local: Some(LocalWrite::Insert(contact.clone())),
                    state,
                    conflicts: vec![draft("email")],
                    resolved: Vec::new(),
                },
                100,
            )
            .await
            .unwrap();

        assert!(store.get_contact(&contact.id).await.unwrap().is_some());
        let open = store
            .list_open_conflicts_for_record(&connection.id, &contact.id)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(stored.open_conflict_id, Some(open[0].id));
        assert_eq!(
            store.get_state(&connection.id, &contact.id).await.unwrap(),
            Some(stored.clone())
        );

        // Settling the field clears the reference
        let settled = store
            .commit_record(
                RecordCommit {
                    local: None,
                    state: stored,
                    conflicts: Vec::new(),
                    resolved: vec![(open[0].id, ConflictStatus::ResolvedLocal)],
                },
                200,
            )
            .await
            .unwrap();
        assert_eq!(settled.open_conflict_id, None);
        assert_eq!(store.count_open_conflicts(&connection.id).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_commit_rolls_back_every_write() {
        let (store, connection) = store_with_connection().await;
        let contact = Contact::new(connection.tenant_id);
        store.insert_contact(&contact).await.unwrap();

        let mut state = SyncState::new(connection.id, contact.id);
        state.external_id = Some("101".into());
        let result = store
            .commit_record(
                RecordCommit {
                    // Duplicate primary key
                    local: Some(LocalWrite::Insert(contact.clone())),
                    state,
                    conflicts: vec![draft("email")],
                    resolved: Vec::new(),
                },
                100,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(store.get_state(&connection.id, &contact.id).await.unwrap(), None);
        assert_eq!(store.count_open_conflicts(&connection.id).await.unwrap(), 0);

        // The connection is usable after the rollback
        let state = SyncState::new(connection.id, contact.id);
        store.save_state(&state).await.unwrap();
        assert_eq!(store.count_states(&connection.id).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn daily_quota_is_shared_through_store() {
        let (store, connection) = store_with_connection().await;
        assert!(store.consume(&connection.id, "2024-05-01", 2).await.unwrap());
        assert!(store.consume(&connection.id, "2024-05-01", 2).await.unwrap());
        assert!(!store.consume(&connection.id, "2024-05-01", 2).await.unwrap());
    }
}
