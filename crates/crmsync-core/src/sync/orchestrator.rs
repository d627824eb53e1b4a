//! One sync run for one connection.
//!
//! A run takes the connection's lease, pulls everything changed on either side
//! since the stored checkpoints, reconciles each record pair and writes the
//! outcome. Per-record failures are logged against the run and never stop it;
//! only an auth failure, a failed fetch or the error-rate ceiling abort.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tracing::instrument;

use super::resolver::{resolve, Resolution, Side};
use super::retry::RetryPolicy;
use crate::config::RunSettings;
use crate::error::{Error, Result};
use crate::mapping::{round_trip, to_canonical, to_remote, FieldError, FieldFlow, MappingSet, ProviderProfile};
use crate::models::{
    CanonicalContact, Checkpoint, Connection, ConnectionId, ConnectionStatus, Contact, ContactId,
    FieldValue, NaturalKey, RecordErrorKind, RemoteRecord, RunCounts, RunErrorEntry, RunId,
    RunMode, RunStatus, RunTrigger, SyncRun, SyncState,
};
use crate::providers::{
    later_checkpoint, AdapterRegistry, CrmAdapter, Credential, FetchRequest, ProviderError,
};
use crate::services::{LocalWrite, RecordCommit, SyncStore};
use crate::util::{normalize_email, normalize_phone, unix_millis_now};

/// Webhook events drained per run
const WEBHOOK_BATCH: usize = 500;

/// What to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest {
    pub run_id: RunId,
    pub connection_id: ConnectionId,
    pub mode: RunMode,
    pub trigger: RunTrigger,
}

impl RunRequest {
    pub fn new(connection_id: ConnectionId, mode: RunMode, trigger: RunTrigger) -> Self {
        Self {
            run_id: RunId::new(),
            connection_id,
            mode,
            trigger,
        }
    }
}

/// Runs sync passes; holds no per-run state between calls.
#[derive(Clone)]
pub struct Orchestrator {
    store: SyncStore,
    adapters: Arc<AdapterRegistry>,
    settings: RunSettings,
}

enum Stop {
    Cancelled,
    Abort(String),
}

impl From<Error> for Stop {
    fn from(error: Error) -> Self {
        Self::Abort(error.to_string())
    }
}

enum RecordError {
    Abort(Stop),
    Provider(ProviderError),
    Storage(Error),
}

impl From<Error> for RecordError {
    fn from(error: Error) -> Self {
        Self::Storage(error)
    }
}

struct Finish {
    /// Checkpoints to persist; `None` for single-record runs
    checkpoints: Option<(Option<Checkpoint>, Option<i64>)>,
    event_ids: Vec<i64>,
}

struct RunContext<'a> {
    connection: &'a Connection,
    adapter: Arc<dyn CrmAdapter>,
    credential: Credential,
    mappings: MappingSet,
    profile: ProviderProfile,
    flows: Vec<FieldFlow>,
    paths: Vec<String>,
    properties: Vec<String>,
    retry: RetryPolicy,
    cancel: &'a AtomicBool,
    run_id: RunId,
    lease_ttl_ms: i64,
    /// When this run last extended its lease (unix ms)
    lease_renewed_at: AtomicI64,
}

/// A local contact and its remote counterpart, either of which may be missing
struct Pair {
    contact: Option<Contact>,
    state: Option<SyncState>,
    remote: Option<RemoteRecord>,
    /// Reconcile as a first sync, ignoring the stored baseline
    fresh: bool,
}

impl Orchestrator {
    pub fn new(store: SyncStore, adapters: Arc<AdapterRegistry>, settings: RunSettings) -> Self {
        Self {
            store,
            adapters,
            settings,
        }
    }

    pub const fn store(&self) -> &SyncStore {
        &self.store
    }

    /// Execute one run to completion and return its closed log.
    ///
    /// Fails only when the run could not be started; everything after the
    /// lease is taken ends in a closed log row.
    #[instrument(skip(self, cancel), fields(run_id = %request.run_id, connection_id = %request.connection_id, mode = request.mode.as_str()))]
    pub async fn run(&self, request: RunRequest, cancel: Arc<AtomicBool>) -> Result<SyncRun> {
        let connection = self.store.require_connection(&request.connection_id).await?;
        if !connection.is_active() {
            return Err(Error::ConnectionInactive(connection.id.to_string()));
        }

        let started_at = unix_millis_now();
        let mut run = SyncRun {
            id: request.run_id,
            connection_id: connection.id,
            trigger: request.trigger,
            mode: request.mode,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            counts: RunCounts::default(),
            abort_reason: None,
            errors: Vec::new(),
        };

        let ttl_ms = self.lease_ttl_ms();
        if !self
            .store
            .try_acquire_lock(&connection.id, &run.id, started_at, ttl_ms)
            .await?
        {
            run.status = RunStatus::Skipped;
            run.finished_at = Some(started_at);
            run.abort_reason = Some("another run holds the connection lock".to_string());
            self.store.insert_run(&run).await?;
            tracing::info!("Skipped run; connection is locked by another run");
            return Ok(run);
        }

        if let Err(error) = self.store.insert_run(&run).await {
            self.release(&run).await;
            return Err(error);
        }
        tracing::info!(
            provider = %connection.provider,
            trigger = %run.trigger,
            "Sync run started"
        );

        match self.execute(&connection, &mut run, &cancel).await {
            Ok(finish) => self.complete(&mut run, finish).await,
            Err(Stop::Cancelled) => run.status = RunStatus::Cancelled,
            Err(Stop::Abort(reason)) => {
                tracing::warn!(%reason, "Sync run aborted");
                run.status = RunStatus::Aborted;
                run.abort_reason = Some(reason);
            }
        }

        run.finished_at = Some(unix_millis_now());
        match self.store.close_run(&run).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Run log was closed by someone else"),
            Err(error) => tracing::error!(%error, "Failed to close run log"),
        }
        self.release(&run).await;

        tracing::info!(
            status = %run.status,
            scanned = run.counts.scanned,
            upserted_local = run.counts.upserted_local,
            upserted_remote = run.counts.upserted_remote,
            skipped = run.counts.skipped,
            failed = run.counts.failed,
            conflicts = run.counts.conflicts,
            "Sync run finished"
        );
        Ok(run)
    }

    fn lease_ttl_ms(&self) -> i64 {
        i64::try_from(self.settings.run_lock_ttl.as_millis()).unwrap_or(i64::MAX)
    }

    /// Stop between records when cancelled or when the lease went to another run.
    ///
    /// The lease is extended once a third of its lifetime has passed.
    async fn heartbeat(&self, ctx: &RunContext<'_>) -> std::result::Result<(), Stop> {
        check_cancel(ctx.cancel)?;
        let now = unix_millis_now();
        let renewed_at = ctx.lease_renewed_at.load(Ordering::Relaxed);
        if now.saturating_sub(renewed_at) < ctx.lease_ttl_ms / 3 {
            return Ok(());
        }
        if !self
            .store
            .renew_lock(&ctx.connection.id, &ctx.run_id, now, ctx.lease_ttl_ms)
            .await?
        {
            tracing::warn!("Run lease was taken over by another run");
            return Err(Stop::Abort("run lease lost to another run".to_string()));
        }
        ctx.lease_renewed_at.store(now, Ordering::Relaxed);
        Ok(())
    }

    async fn release(&self, run: &SyncRun) {
        if let Err(error) = self.store.release_lock(&run.connection_id, &run.id).await {
            tracing::error!(%error, run_id = %run.id, "Failed to release run lock");
        }
    }

    async fn complete(&self, run: &mut SyncRun, finish: Finish) {
        if let Some((remote, local)) = finish.checkpoints {
            if let Err(error) = self
                .store
                .save_checkpoints(&run.connection_id, remote.as_ref(), local)
                .await
            {
                run.status = RunStatus::Aborted;
                run.abort_reason = Some(format!("failed to save checkpoints: {error}"));
                return;
            }
        }
        if let Err(error) = self
            .store
            .mark_events_processed(&finish.event_ids, unix_millis_now())
            .await
        {
            tracing::warn!(%error, "Failed to mark webhook events processed");
        }
        run.status = RunStatus::Completed;
    }

    async fn execute(
        &self,
        connection: &Connection,
        run: &mut SyncRun,
        cancel: &AtomicBool,
    ) -> std::result::Result<Finish, Stop> {
        let adapter = self.adapters.get(connection.provider)?;
        let retry = RetryPolicy::from_settings(&self.settings);

        let credential = match retry
            .run("authenticate", || adapter.authenticate(connection))
            .await
        {
            Ok(credential) => credential,
            Err(error) => return Err(self.provider_abort(connection, "authentication", error).await),
        };

        let mappings = self.store.load_mappings(&connection.id).await?;
        if mappings.is_empty() {
            return Err(Stop::Abort(
                "connection has no enabled field mappings".to_string(),
            ));
        }

        let ctx = RunContext {
            connection,
            adapter,
            credential,
            profile: ProviderProfile::for_provider(connection.provider),
            flows: mappings.field_flows(),
            paths: mappings.local_paths(),
            properties: mappings.remote_properties(),
            mappings,
            retry,
            cancel,
            run_id: run.id,
            lease_ttl_ms: self.lease_ttl_ms(),
            lease_renewed_at: AtomicI64::new(run.started_at),
        };

        match run.mode {
            RunMode::SingleRecord(local_id) => {
                self.sync_single(&ctx, run, local_id).await?;
                Ok(Finish {
                    checkpoints: None,
                    event_ids: Vec::new(),
                })
            }
            RunMode::Full | RunMode::Delta => self.sync_batch(&ctx, run).await,
        }
    }

    async fn sync_batch(
        &self,
        ctx: &RunContext<'_>,
        run: &mut SyncRun,
    ) -> std::result::Result<Finish, Stop> {
        let connection = ctx.connection;
        let delta = matches!(run.mode, RunMode::Delta);

        let mut request = FetchRequest {
            since: if delta {
                connection.remote_checkpoint.clone()
            } else {
                None
            },
            page_token: None,
            properties: ctx.properties.clone(),
        };
        let mut fetched = Vec::new();
        let mut checkpoint = None;
        loop {
            self.heartbeat(ctx).await?;
            let page = match ctx
                .retry
                .run("fetch_changed", || {
                    ctx.adapter
                        .fetch_changed(connection, &ctx.credential, &request)
                })
                .await
            {
                Ok(page) => page,
                Err(error) => return Err(self.provider_abort(connection, "fetch", error).await),
            };
            tracing::debug!(records = page.records.len(), "Fetched page");
            fetched.extend(page.records);
            checkpoint = later_checkpoint(checkpoint, page.checkpoint);
            match page.next_page_token {
                Some(token) => request.page_token = Some(token),
                None => break,
            }
        }

        let events = self
            .store
            .list_pending_events(&connection.id, WEBHOOK_BATCH)
            .await?;
        let mut event_ids = Vec::with_capacity(events.len());
        for stored in events {
            let record = match stored.event.record {
                Some(record) => Some(record),
                None => match ctx
                    .retry
                    .run("fetch_record", || {
                        ctx.adapter.fetch_record(
                            connection,
                            &ctx.credential,
                            &stored.event.external_id,
                            &ctx.properties,
                        )
                    })
                    .await
                {
                    Ok(record) => record,
                    Err(error @ ProviderError::Auth(_)) => {
                        return Err(self.provider_abort(connection, "fetch", error).await)
                    }
                    Err(error) => {
                        // Left pending for the next run
                        tracing::warn!(%error, external_id = %stored.event.external_id, "Failed to fetch webhook record");
                        continue;
                    }
                },
            };
            fetched.extend(record);
            event_ids.push(stored.id);
        }

        let local_since = if delta {
            connection.local_checkpoint
        } else {
            None
        };
        let local_changed = self
            .store
            .list_contacts_changed_since(&connection.tenant_id, local_since)
            .await?;
        // Reads are inclusive, so the newest contact seen is re-read next time
        let local_checkpoint = local_changed
            .iter()
            .map(|contact| contact.updated_at)
            .max()
            .or(connection.local_checkpoint);

        let remote_records = dedupe_latest(fetched);
        tracing::debug!(
            remote = remote_records.len(),
            local = local_changed.len(),
            "Reconciling changed records"
        );

        let mut handled = HashSet::new();
        for record in remote_records {
            self.heartbeat(ctx).await?;
            run.counts.scanned += 1;
            let external_id = record.external_id.clone();
            match self.pair_remote(ctx, record).await {
                Ok(pair) => {
                    if let Some(contact) = &pair.contact {
                        handled.insert(contact.id);
                    }
                    self.reconcile(ctx, run, pair).await?;
                }
                Err(error) => {
                    self.storage_failed(ctx, run, None, external_id.as_deref(), &error)
                        .await;
                }
            }
            self.check_error_rate(run)?;
        }

        for contact in local_changed {
            if handled.contains(&contact.id) {
                continue;
            }
            self.heartbeat(ctx).await?;
            run.counts.scanned += 1;
            let local_id = contact.id;
            match self.pair_local(ctx, run, contact).await {
                Ok(Some(pair)) => self.reconcile(ctx, run, pair).await?,
                Ok(None) => {}
                Err(error) => {
                    self.storage_failed(ctx, run, Some(local_id), None, &error)
                        .await;
                }
            }
            self.check_error_rate(run)?;
        }

        // Nothing fetched keeps the previous position
        let remote_checkpoint = checkpoint.or_else(|| connection.remote_checkpoint.clone());
        Ok(Finish {
            checkpoints: Some((remote_checkpoint, local_checkpoint)),
            event_ids,
        })
    }

    async fn sync_single(
        &self,
        ctx: &RunContext<'_>,
        run: &mut SyncRun,
        local_id: ContactId,
    ) -> std::result::Result<(), Stop> {
        let connection = ctx.connection;
        run.counts.scanned += 1;

        let contact = self
            .store
            .get_contact(&local_id)
            .await?
            .filter(|contact| contact.tenant_id == connection.tenant_id)
            .ok_or_else(|| Stop::Abort(format!("contact {local_id} not found for this tenant")))?;
        let state = self.store.get_state(&connection.id, &local_id).await?;

        let remote = match state.as_ref().and_then(|state| state.external_id.clone()) {
            Some(external_id) => match ctx
                .retry
                .run("fetch_record", || {
                    ctx.adapter.fetch_record(
                        connection,
                        &ctx.credential,
                        &external_id,
                        &ctx.properties,
                    )
                })
                .await
            {
                Ok(Some(record)) => Some(record),
                Ok(None) | Err(ProviderError::NotFound(_)) => {
                    self.unlink(ctx, run, local_id, &external_id, "remote record no longer exists")
                        .await?;
                    return Ok(());
                }
                Err(error @ ProviderError::Auth(_)) => {
                    return Err(self.provider_abort(connection, "fetch", error).await)
                }
                Err(error) => {
                    self.record_failed(ctx, run, Some(local_id), Some(&external_id), &error)
                        .await;
                    return Ok(());
                }
            },
            None => None,
        };

        // An unlinked record is re-created from scratch
        let fresh = state.as_ref().is_some_and(|state| !state.is_linked());
        let pair = Pair {
            contact: Some(contact),
            state,
            remote,
            fresh,
        };
        self.reconcile(ctx, run, pair).await
    }

    /// Find the local side of a fetched record: by pairing, then by natural key
    async fn pair_remote(&self, ctx: &RunContext<'_>, record: RemoteRecord) -> Result<Pair> {
        let connection = ctx.connection;
        let external_id = record.external_id.clone().unwrap_or_default();

        if let Some(state) = self
            .store
            .get_state_by_external(&connection.id, &external_id)
            .await?
        {
            let contact = self.store.get_contact(&state.local_id).await?;
            return Ok(Pair {
                contact,
                state: Some(state),
                remote: Some(record),
                fresh: false,
            });
        }

        let canonical = to_canonical(&record, &ctx.mappings, &ctx.profile).value;
        for key in remote_natural_keys(&canonical, connection.natural_key) {
            let candidates = self
                .store
                .find_contacts_by_natural_key(&connection.tenant_id, connection.natural_key, &key)
                .await?;
            for candidate in candidates {
                let state = self.store.get_state(&connection.id, &candidate.id).await?;
                if state.as_ref().is_some_and(SyncState::is_linked) {
                    continue;
                }
                tracing::debug!(
                    external_id = %external_id,
                    local_id = %candidate.id,
                    natural_key = connection.natural_key.as_str(),
                    "Matched remote record by natural key"
                );
                return Ok(Pair {
                    contact: Some(candidate),
                    state,
                    remote: Some(record),
                    fresh: true,
                });
            }
        }

        Ok(Pair {
            contact: None,
            state: None,
            remote: Some(record),
            fresh: true,
        })
    }

    /// Pair a locally changed contact that no fetched record covered
    async fn pair_local(
        &self,
        ctx: &RunContext<'_>,
        run: &mut SyncRun,
        contact: Contact,
    ) -> Result<Option<Pair>> {
        let connection = ctx.connection;
        let state = self.store.get_state(&connection.id, &contact.id).await?;

        if contact.is_deleted {
            if state.is_some() {
                self.store.delete_state(&connection.id, &contact.id).await?;
            }
            run.counts.skipped += 1;
            return Ok(None);
        }

        match state {
            Some(state) if state.unlinked_at.is_some() && !state.is_linked() => {
                tracing::debug!(local_id = %contact.id, "Skipping unlinked record");
                run.counts.skipped += 1;
                Ok(None)
            }
            state => Ok(Some(Pair {
                contact: Some(contact),
                state,
                remote: None,
                fresh: false,
            })),
        }
    }

    /// Reconcile one pair, turning per-record failures into log entries
    async fn reconcile(
        &self,
        ctx: &RunContext<'_>,
        run: &mut SyncRun,
        pair: Pair,
    ) -> std::result::Result<(), Stop> {
        let local_id = pair
            .contact
            .as_ref()
            .map(|contact| contact.id)
            .or_else(|| pair.state.as_ref().map(|state| state.local_id));
        let external_id = pair
            .remote
            .as_ref()
            .and_then(|record| record.external_id.clone())
            .or_else(|| pair.state.as_ref().and_then(|state| state.external_id.clone()));

        match self.reconcile_pair(ctx, run, pair).await {
            Ok(()) => Ok(()),
            Err(RecordError::Abort(stop)) => Err(stop),
            Err(RecordError::Provider(error)) => {
                self.record_failed(ctx, run, local_id, external_id.as_deref(), &error)
                    .await;
                Ok(())
            }
            Err(RecordError::Storage(error)) => {
                self.storage_failed(ctx, run, local_id, external_id.as_deref(), &error)
                    .await;
                Ok(())
            }
        }
    }

    async fn reconcile_pair(
        &self,
        ctx: &RunContext<'_>,
        run: &mut SyncRun,
        pair: Pair,
    ) -> std::result::Result<(), RecordError> {
        let connection = ctx.connection;
        let Pair {
            contact,
            state,
            remote,
            fresh,
        } = pair;

        // The local record is gone: forget the pairing
        let local_deleted = match &contact {
            Some(contact) => contact.is_deleted,
            None => state.is_some(),
        };
        if local_deleted {
            if let Some(state) = &state {
                self.store
                    .delete_state(&connection.id, &state.local_id)
                    .await?;
            }
            run.counts.skipped += 1;
            return Ok(());
        }

        let now = unix_millis_now();
        let last_state = if fresh { None } else { state.as_ref() };
        let mut local_id = contact.as_ref().map(|contact| contact.id);
        let mut external_id = match &remote {
            Some(record) => record.external_id.clone(),
            None if fresh => None,
            None => state.as_ref().and_then(|state| state.external_id.clone()),
        };

        let local_values = contact.as_ref().map(|contact| {
            let canonical = contact.to_canonical(ctx.paths.iter().map(String::as_str));
            round_trip(&canonical, &ctx.mappings, &ctx.profile)
        });
        let remote_mapped = remote
            .as_ref()
            .map(|record| to_canonical(record, &ctx.mappings, &ctx.profile));
        if let Some(mapped) = &remote_mapped {
            for error in &mapped.errors {
                field_error(run, local_id, external_id.as_deref(), error);
            }
        }

        let Resolution {
            mut merged,
            local_updates,
            remote_updates,
            conflicts,
            outcomes,
        } = resolve(
            &ctx.flows,
            local_values
                .as_ref()
                .zip(contact.as_ref())
                .map(|(values, contact)| Side::new(values, Some(contact.updated_at))),
            remote_mapped.as_ref().map(|mapped| {
                Side::new(
                    &mapped.value,
                    remote.as_ref().and_then(RemoteRecord::modified_at_millis),
                )
            }),
            last_state,
            connection.conflict_policy,
        );

        let mut remote_version = remote
            .as_ref()
            .and_then(RemoteRecord::modified_at_millis)
            .or_else(|| state.as_ref().and_then(|state| state.remote_version));
        let mut wrote_remote = false;
        let mut remote_failure = None;

        // Remote first: a local write is only recorded against a confirmed remote
        if !remote_updates.is_empty() && contact.is_some() {
            let mapped = to_remote(&remote_updates, &ctx.mappings, &ctx.profile);
            for error in &mapped.errors {
                field_error(run, local_id, external_id.as_deref(), error);
                keep_baseline(&mut merged, last_state, &error.field);
            }

            let mut record = mapped.value;
            if !record.properties.is_empty() {
                record.external_id = external_id.clone();
                if external_id.is_none() {
                    record.idempotency_key = local_id.map(|id| id.to_string());
                }

                match ctx
                    .retry
                    .run("upsert_remote", || {
                        ctx.adapter
                            .upsert_remote(connection, &ctx.credential, &record)
                    })
                    .await
                {
                    Ok(outcome) => {
                        external_id = Some(outcome.external_id);
                        remote_version = outcome.modified_at.or(remote_version);
                        wrote_remote = true;
                        run.counts.upserted_remote += 1;
                    }
                    Err(ProviderError::NotFound(message)) => {
                        if let (Some(local_id), Some(external_id)) = (local_id, external_id.as_deref()) {
                            if state.as_ref().is_some_and(SyncState::is_linked) {
                                self.unlink(ctx, run, local_id, external_id, &message).await?;
                                return Ok(());
                            }
                        }
                        remote_failure = Some(ProviderError::NotFound(message));
                    }
                    Err(error @ ProviderError::Auth(_)) => {
                        return Err(RecordError::Abort(
                            self.provider_abort(connection, "upsert", error).await,
                        ));
                    }
                    Err(error) => remote_failure = Some(error),
                }
            }

            if !wrote_remote {
                for (path, _) in remote_updates.iter() {
                    keep_baseline(&mut merged, last_state, path);
                }
            }
        }

        let mut local_version = contact.as_ref().map(|contact| contact.updated_at);
        let mut local_write = None;
        if !local_updates.is_empty() {
            let mut target = contact
                .clone()
                .unwrap_or_else(|| Contact::new(connection.tenant_id));
            for (path, value) in local_updates.iter() {
                if let Err(message) = target.apply_field(path, value.clone()) {
                    let error = FieldError {
                        field: path.clone(),
                        message,
                    };
                    field_error(run, local_id, external_id.as_deref(), &error);
                    keep_baseline(&mut merged, last_state, path);
                }
            }
            target.updated_at = now;
            local_id = Some(target.id);
            local_version = Some(now);
            local_write = Some(if contact.is_some() {
                LocalWrite::Update(target)
            } else {
                LocalWrite::Insert(target)
            });
        }

        let (Some(local_id), Some(external_id)) = (local_id, external_id) else {
            // Nothing paired: an empty remote record, or a creation that failed
            return match remote_failure {
                Some(error) => Err(RecordError::Provider(error)),
                None => {
                    run.counts.skipped += 1;
                    Ok(())
                }
            };
        };

        let mut resolved = Vec::new();
        if state
            .as_ref()
            .is_some_and(|state| state.open_conflict_id.is_some())
        {
            for conflict in self
                .store
                .list_open_conflicts_for_record(&connection.id, &local_id)
                .await?
            {
                if let Some(status) = outcomes
                    .get(&conflict.field_path)
                    .and_then(|outcome| outcome.closes_conflict_as())
                {
                    resolved.push((conflict.id, status));
                }
            }
        }

        let mut next_state = state
            .clone()
            .unwrap_or_else(|| SyncState::new(connection.id, local_id));
        next_state.external_id = Some(external_id.clone());
        next_state.unlinked_at = None;
        next_state.local_version = local_version.unwrap_or(now);
        next_state.remote_version = remote_version;
        next_state.last_synced_at = now;
        next_state.baseline = merged;

        let unchanged = local_write.is_none()
            && !wrote_remote
            && conflicts.is_empty()
            && resolved.is_empty()
            && last_state.is_some_and(|state| {
                state.baseline == next_state.baseline
                    && state.external_id == next_state.external_id
            });
        if unchanged {
            if let Some(error) = remote_failure {
                return Err(RecordError::Provider(error));
            }
            run.counts.skipped += 1;
            self.clear_failures(connection, local_id, &external_id).await?;
            return Ok(());
        }

        let wrote_local = local_write.is_some();
        let conflict_count = u32::try_from(conflicts.len()).unwrap_or(u32::MAX);
        let commit = RecordCommit {
            local: local_write,
            state: next_state.clone(),
            conflicts,
            resolved,
        };
        if let Err(error) = self.store.commit_record(commit, now).await {
            if wrote_remote {
                // The remote write is confirmed; its pairing must survive
                let mut fallback = next_state;
                fallback.local_version = contact.as_ref().map_or(now, |contact| contact.updated_at);
                fallback.open_conflict_id = state.as_ref().and_then(|state| state.open_conflict_id);
                for (path, _) in local_updates.iter() {
                    keep_baseline(&mut fallback.baseline, last_state, path);
                }
                if let Err(state_error) = self.store.save_state(&fallback).await {
                    tracing::error!(
                        error = %state_error,
                        local_id = %local_id,
                        external_id = %external_id,
                        "Failed to record confirmed remote write"
                    );
                }
            }
            return Err(RecordError::Storage(error));
        }

        if wrote_local {
            run.counts.upserted_local += 1;
        }
        run.counts.conflicts += conflict_count;
        if let Some(error) = remote_failure {
            return Err(RecordError::Provider(error));
        }

        self.clear_failures(connection, local_id, &external_id).await?;
        tracing::debug!(
            local_id = %local_id,
            external_id = %external_id,
            pushed = remote_updates.len(),
            pulled = local_updates.len(),
            "Reconciled record"
        );
        Ok(())
    }

    /// Drop retry entries for a record under both of its keys
    async fn clear_failures(
        &self,
        connection: &Connection,
        local_id: ContactId,
        external_id: &str,
    ) -> Result<()> {
        self.store
            .clear_failure(&connection.id, Some(local_id), None)
            .await?;
        self.store
            .clear_failure(&connection.id, None, Some(external_id))
            .await
    }

    async fn unlink(
        &self,
        ctx: &RunContext<'_>,
        run: &mut SyncRun,
        local_id: ContactId,
        external_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.store
            .mark_unlinked(&ctx.connection.id, &local_id, unix_millis_now())
            .await?;
        run.counts.skipped += 1;
        push_error(
            run,
            RecordErrorKind::NotFound,
            Some(local_id),
            Some(external_id),
            None,
            format!("unlinked: {reason}"),
        );
        tracing::warn!(local_id = %local_id, external_id, "Remote record disappeared; unlinked");
        Ok(())
    }

    /// Log a provider failure; retryable ones are queued for the retry sweep
    async fn record_failed(
        &self,
        ctx: &RunContext<'_>,
        run: &mut SyncRun,
        local_id: Option<ContactId>,
        external_id: Option<&str>,
        error: &ProviderError,
    ) {
        let kind = error.kind();
        run.counts.failed += 1;
        push_error(run, kind, local_id, external_id, None, error.to_string());
        tracing::warn!(
            %error,
            local_id = ?local_id,
            external_id = ?external_id,
            "Record failed"
        );

        if matches!(kind, RecordErrorKind::Transient | RecordErrorKind::RateLimited) {
            if let Err(store_error) = self
                .store
                .record_failure(
                    &ctx.connection.id,
                    local_id,
                    external_id,
                    &error.to_string(),
                    unix_millis_now(),
                )
                .await
            {
                tracing::error!(error = %store_error, "Failed to queue record for retry");
            }
        }
    }

    /// A host database write failed for one record; it is retried by the sweep
    async fn storage_failed(
        &self,
        ctx: &RunContext<'_>,
        run: &mut SyncRun,
        local_id: Option<ContactId>,
        external_id: Option<&str>,
        error: &Error,
    ) {
        run.counts.failed += 1;
        push_error(
            run,
            RecordErrorKind::Storage,
            local_id,
            external_id,
            None,
            error.to_string(),
        );
        tracing::error!(%error, local_id = ?local_id, external_id = ?external_id, "Failed to persist record");

        if let Err(store_error) = self
            .store
            .record_failure(
                &ctx.connection.id,
                local_id,
                external_id,
                &error.to_string(),
                unix_millis_now(),
            )
            .await
        {
            tracing::error!(error = %store_error, "Failed to queue record for retry");
        }
    }

    async fn provider_abort(&self, connection: &Connection, stage: &str, error: ProviderError) -> Stop {
        if let ProviderError::Auth(message) = &error {
            if let Err(store_error) = self
                .store
                .set_connection_status(&connection.id, ConnectionStatus::Error, Some(message))
                .await
            {
                tracing::error!(error = %store_error, "Failed to mark connection as errored");
            }
            tracing::warn!(
                connection_id = %connection.id,
                provider = %connection.provider,
                "Authentication failed; connection moved to error"
            );
        }
        Stop::Abort(format!("{stage} failed: {error}"))
    }

    fn check_error_rate(&self, run: &SyncRun) -> std::result::Result<(), Stop> {
        let processed = run.counts.scanned;
        if processed == 0 || processed < self.settings.error_rate_min_sample {
            return Ok(());
        }
        let rate = f64::from(run.counts.failed) / f64::from(processed);
        if rate > self.settings.error_rate_threshold {
            return Err(Stop::Abort(format!(
                "error rate {:.0}% exceeded the {:.0}% ceiling after {processed} records",
                rate * 100.0,
                self.settings.error_rate_threshold * 100.0
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .field("adapters", &self.adapters)
            .field("settings", &self.settings)
            .finish()
    }
}

fn check_cancel(cancel: &AtomicBool) -> std::result::Result<(), Stop> {
    if cancel.load(Ordering::Relaxed) {
        tracing::info!("Sync run cancelled");
        Err(Stop::Cancelled)
    } else {
        Ok(())
    }
}

/// Keep one record per external id, preferring the latest modification
fn dedupe_latest(records: Vec<RemoteRecord>) -> Vec<RemoteRecord> {
    let mut order = Vec::new();
    let mut latest: HashMap<String, RemoteRecord> = HashMap::new();
    for record in records {
        let Some(external_id) = record.external_id.clone() else {
            continue;
        };
        match latest.get(&external_id) {
            Some(existing) if existing.modified_at > record.modified_at => {}
            Some(_) => {
                latest.insert(external_id, record);
            }
            None => {
                order.push(external_id.clone());
                latest.insert(external_id, record);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|external_id| latest.remove(&external_id))
        .collect()
}

fn remote_natural_keys(canonical: &CanonicalContact, key: NaturalKey) -> Vec<String> {
    match key {
        NaturalKey::Email => canonical
            .get("email")
            .as_text()
            .and_then(normalize_email)
            .into_iter()
            .collect(),
        NaturalKey::Phone => match canonical.get("phones") {
            FieldValue::List(phones) => phones
                .iter()
                .filter_map(|phone| normalize_phone(phone))
                .collect(),
            FieldValue::Text(phone) => normalize_phone(&phone).into_iter().collect(),
            _ => Vec::new(),
        },
    }
}

/// Leave a field at its last agreed value
fn keep_baseline(merged: &mut CanonicalContact, last_state: Option<&SyncState>, path: &str) {
    match last_state.filter(|state| state.baseline.contains(path)) {
        Some(state) => merged.set(path, state.baseline.get(path)),
        None => {
            merged.remove(path);
        }
    }
}

fn push_error(
    run: &mut SyncRun,
    kind: RecordErrorKind,
    local_id: Option<ContactId>,
    external_id: Option<&str>,
    field: Option<&str>,
    message: String,
) {
    run.errors.push(RunErrorEntry {
        kind,
        local_id,
        external_id: external_id.map(str::to_string),
        field: field.map(str::to_string),
        message,
        at: unix_millis_now(),
    });
}

fn field_error(
    run: &mut SyncRun,
    local_id: Option<ContactId>,
    external_id: Option<&str>,
    error: &FieldError,
) {
    push_error(
        run,
        RecordErrorKind::Validation,
        local_id,
        external_id,
        Some(&error.field),
        error.message.clone(),
    );
}
