//! Trigger interface shared by the CLI, the API and the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::store::SyncStore;
use crate::config::{EngineConfig, RunSettings};
use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictChoice, ConflictId, Connection, ConnectionId, ContactId, FailedRecordStatus,
    RunId, RunMode, RunStatus, RunTrigger, SyncRun,
};
use crate::providers::{AdapterRegistry, CredentialVault, FileCredentialVault};
use crate::rate_limit::RateLimiter;
use crate::sync::{Orchestrator, RunRequest};
use crate::util::unix_millis_now;
use crate::webhooks::normalize_webhook;

/// Snapshot of one connection's sync health
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub connection: Connection,
    /// Run currently holding the connection lock
    pub running_run_id: Option<String>,
    pub last_run: Option<SyncRun>,
    pub last_completed_run: Option<SyncRun>,
    pub open_conflicts: u64,
    pub pending_failures: usize,
    pub linked_records: u64,
}

/// Outcome of an operator conflict resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictResolution {
    pub conflict: Conflict,
    /// Single-record run started to carry the choice to the provider
    pub follow_up_run: Option<RunId>,
}

/// Starts, tracks and cancels sync runs.
#[derive(Clone)]
pub struct SyncService {
    store: SyncStore,
    adapters: Arc<AdapterRegistry>,
    orchestrator: Orchestrator,
    /// Cancellation flags of runs started by this process
    active: Arc<Mutex<HashMap<RunId, Arc<AtomicBool>>>>,
}

impl SyncService {
    pub fn new(store: SyncStore, adapters: Arc<AdapterRegistry>, settings: RunSettings) -> Self {
        let orchestrator = Orchestrator::new(store.clone(), Arc::clone(&adapters), settings);
        Self {
            store,
            adapters,
            orchestrator,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Service wired with the production adapters, the file vault and a
    /// store-backed day quota.
    pub fn from_config(config: &EngineConfig, store: SyncStore) -> Result<Self> {
        let limiter = RateLimiter::new(config.rate_limit_max_wait).with_quota(Arc::new(store.clone()));
        let vault: Arc<dyn CredentialVault> =
            Arc::new(FileCredentialVault::new(config.credentials_path.clone()));
        let adapters = AdapterRegistry::with_defaults(config, Arc::new(limiter), vault)?;
        Ok(Self::new(store, Arc::new(adapters), config.run))
    }

    pub const fn store(&self) -> &SyncStore {
        &self.store
    }

    pub const fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    pub async fn trigger_full_sync(&self, connection_id: &ConnectionId) -> Result<RunId> {
        self.spawn_run(*connection_id, RunMode::Full, RunTrigger::Manual)
            .await
    }

    pub async fn trigger_delta_sync(&self, connection_id: &ConnectionId) -> Result<RunId> {
        self.spawn_run(*connection_id, RunMode::Delta, RunTrigger::Manual)
            .await
    }

    pub async fn trigger_single_record_sync(
        &self,
        connection_id: &ConnectionId,
        local_id: &ContactId,
    ) -> Result<RunId> {
        self.spawn_run(
            *connection_id,
            RunMode::SingleRecord(*local_id),
            RunTrigger::Manual,
        )
        .await
    }

    /// Run to completion on the current task and return the closed log
    pub async fn run_now(
        &self,
        connection_id: ConnectionId,
        mode: RunMode,
        trigger: RunTrigger,
    ) -> Result<SyncRun> {
        let request = RunRequest::new(connection_id, mode, trigger);
        let cancel = self.register(request.run_id).await;
        let result = self.orchestrator.run(request, cancel).await;
        self.unregister(&request.run_id).await;
        result
    }

    /// Validate the request, start the run in the background and return its id
    async fn spawn_run(
        &self,
        connection_id: ConnectionId,
        mode: RunMode,
        trigger: RunTrigger,
    ) -> Result<RunId> {
        let connection = self.store.require_connection(&connection_id).await?;
        if !connection.is_active() {
            return Err(Error::ConnectionInactive(connection_id.to_string()));
        }
        if let RunMode::SingleRecord(local_id) = mode {
            self.store
                .get_contact(&local_id)
                .await?
                .filter(|contact| contact.tenant_id == connection.tenant_id)
                .ok_or_else(|| Error::NotFound(format!("contact {local_id}")))?;
        }

        let request = RunRequest::new(connection_id, mode, trigger);
        let cancel = self.register(request.run_id).await;
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(error) = service.orchestrator.run(request, cancel).await {
                tracing::error!(
                    %error,
                    run_id = %request.run_id,
                    connection_id = %request.connection_id,
                    "Sync run could not start"
                );
            }
            service.unregister(&request.run_id).await;
        });

        tracing::info!(
            run_id = %request.run_id,
            connection_id = %connection_id,
            mode = mode.as_str(),
            "Sync run triggered"
        );
        Ok(request.run_id)
    }

    async fn register(&self, run_id: RunId) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.active.lock().await.insert(run_id, Arc::clone(&flag));
        flag
    }

    async fn unregister(&self, run_id: &RunId) {
        self.active.lock().await.remove(run_id);
    }

    /// Ask a run started by this process to stop after the current record.
    ///
    /// Returns false when no such run is in flight here.
    pub async fn cancel_run(&self, run_id: &RunId) -> bool {
        let active = self.active.lock().await;
        match active.get(run_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                tracing::info!(run_id = %run_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub async fn get_sync_status(&self, connection_id: &ConnectionId) -> Result<SyncStatus> {
        let connection = self.store.require_connection(connection_id).await?;
        let running_run_id = self
            .store
            .lock_holder(connection_id, unix_millis_now())
            .await?;
        let last_run = self
            .store
            .list_recent_runs(connection_id, 1)
            .await?
            .into_iter()
            .next();
        let last_completed_run = self
            .store
            .latest_run_with_status(connection_id, RunStatus::Completed)
            .await?;
        let open_conflicts = self.store.count_open_conflicts(connection_id).await?;
        let pending_failures = self
            .store
            .list_failures_for_connection(connection_id)
            .await?
            .iter()
            .filter(|failure| failure.status == FailedRecordStatus::Pending)
            .count();
        let linked_records = self.store.count_states(connection_id).await?;

        Ok(SyncStatus {
            connection,
            running_run_id,
            last_run,
            last_completed_run,
            open_conflicts,
            pending_failures,
            linked_records,
        })
    }

    pub async fn list_recent_runs(
        &self,
        connection_id: &ConnectionId,
        limit: usize,
    ) -> Result<Vec<SyncRun>> {
        self.store.require_connection(connection_id).await?;
        self.store.list_recent_runs(connection_id, limit).await
    }

    /// Settle an open conflict by operator decision.
    ///
    /// The chosen value is written locally and the baseline is moved to the
    /// remote value the conflict saw, so the follow-up single-record run pushes
    /// the choice out unless the remote side changed again.
    #[tracing::instrument(skip(self, choice), fields(conflict_id = %conflict_id))]
    pub async fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        choice: ConflictChoice,
    ) -> Result<ConflictResolution> {
        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        if !conflict.status.is_open() {
            return Err(Error::InvalidInput(format!(
                "conflict {conflict_id} is already {}",
                conflict.status.as_str()
            )));
        }
        let connection = self.store.require_connection(&conflict.connection_id).await?;

        let status = choice.status();
        let value = match choice {
            ConflictChoice::KeepLocal => conflict.local_value.clone(),
            ConflictChoice::KeepRemote => conflict.remote_value.clone(),
            ConflictChoice::Custom(value) => value,
        };

        let now = unix_millis_now();
        let contact = match self.store.get_contact(&conflict.local_id).await? {
            Some(mut contact) if !contact.is_deleted => {
                contact
                    .apply_field(&conflict.field_path, value)
                    .map_err(Error::InvalidInput)?;
                contact.updated_at = now;
                Some(contact)
            }
            _ => None,
        };
        let state = self
            .store
            .get_state(&conflict.connection_id, &conflict.local_id)
            .await?
            .map(|mut state| {
                state
                    .baseline
                    .set(conflict.field_path.clone(), conflict.remote_value.clone());
                state.open_conflict_id = None;
                state
            });

        if !self
            .store
            .settle_conflict(&conflict, status, contact.as_ref(), state.as_ref(), now)
            .await?
        {
            return Err(Error::InvalidInput(format!(
                "conflict {conflict_id} was resolved concurrently"
            )));
        }
        tracing::info!(
            connection_id = %conflict.connection_id,
            field = %conflict.field_path,
            status = status.as_str(),
            "Conflict resolved by operator"
        );

        let follow_up_run = if contact.is_some() && connection.is_active() {
            Some(
                self.trigger_single_record_sync(&connection.id, &conflict.local_id)
                    .await?,
            )
        } else {
            None
        };

        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        Ok(ConflictResolution {
            conflict,
            follow_up_run,
        })
    }

    /// Poll the run log until a run started by this process has finished
    pub async fn wait_for_run(&self, run_id: &RunId, poll: Duration) -> Result<SyncRun> {
        loop {
            let logged = self.store.get_run(run_id).await?;
            match logged {
                Some(run) if run.status != RunStatus::Running => return Ok(run),
                None if !self.active.lock().await.contains_key(run_id) => {
                    return Err(Error::NotFound(format!("run {run_id}")));
                }
                _ => tokio::time::sleep(poll).await,
            }
        }
    }

    /// Normalize a webhook delivery and queue its events for the next run.
    ///
    /// Returns the number of queued events.
    pub async fn ingest_webhook(&self, connection_id: &ConnectionId, payload: &Value) -> Result<usize> {
        let connection = self.store.require_connection(connection_id).await?;
        let events = normalize_webhook(connection.provider, payload)?;
        self.store
            .enqueue_events(connection_id, &events, unix_millis_now())
            .await?;
        tracing::debug!(
            connection_id = %connection_id,
            provider = %connection.provider,
            events = events.len(),
            "Queued webhook events"
        );
        Ok(events.len())
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("store", &self.store)
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}
