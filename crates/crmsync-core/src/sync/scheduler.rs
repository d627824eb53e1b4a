//! Recurring maintenance jobs.
//!
//! Every job can be run once through [`Scheduler::run_job`] or on its own
//! interval through [`Scheduler::run_forever`]. Jobs never share a failure:
//! an error in one tick is logged and the loop moves on.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::{EngineConfig, ScheduleConfig};
use crate::error::Result;
use crate::models::{
    ConflictPolicy, Connection, ConnectionId, ConnectionStatus, ContactId, RemoteChangeEvent,
    RunMode, RunStatus, RunTrigger,
};
use crate::providers::ProviderError;
use crate::services::SyncService;
use crate::util::unix_millis_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    DeltaSync,
    HealthCheck,
    ConflictSweep,
    RetrySweep,
    LogCleanup,
}

impl Job {
    pub const ALL: [Self; 5] = [
        Self::DeltaSync,
        Self::HealthCheck,
        Self::ConflictSweep,
        Self::RetrySweep,
        Self::LogCleanup,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeltaSync => "delta-sync",
            Self::HealthCheck => "health-check",
            Self::ConflictSweep => "conflict-sweep",
            Self::RetrySweep => "retry-sweep",
            Self::LogCleanup => "log-cleanup",
        }
    }

    pub const fn interval(self, schedule: &ScheduleConfig) -> Duration {
        match self {
            Self::DeltaSync => schedule.delta_sync,
            Self::HealthCheck => schedule.health_check,
            Self::ConflictSweep => schedule.conflict_sweep,
            Self::RetrySweep => schedule.retry_sweep,
            Self::LogCleanup => schedule.log_cleanup,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Job {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Self::ALL.iter().map(|job| job.as_str()).collect();
                format!("unknown job '{s}', expected one of: {}", names.join(", "))
            })
    }
}

/// Outcome of one job execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job: Option<Job>,
    /// Units of work handled (runs, probes, rows)
    pub processed: u64,
    /// Units that failed or ended unhealthy
    pub failed: u64,
}

impl JobReport {
    const fn for_job(job: Job) -> Self {
        Self {
            job: Some(job),
            processed: 0,
            failed: 0,
        }
    }
}

/// Pending failures of one connection, split by how they are retried
#[derive(Debug, Default)]
struct RetryBatch {
    local_ids: Vec<ContactId>,
    remote: Vec<RemoteChangeEvent>,
}

#[derive(Clone)]
pub struct Scheduler {
    service: SyncService,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(service: SyncService, config: EngineConfig) -> Self {
        Self { service, config }
    }

    /// Run one job once
    #[tracing::instrument(skip(self), fields(job = job.as_str()))]
    pub async fn run_job(&self, job: Job) -> Result<JobReport> {
        let report = match job {
            Job::DeltaSync => self.delta_sync().await?,
            Job::HealthCheck => self.health_check().await?,
            Job::ConflictSweep => self.conflict_sweep().await?,
            Job::RetrySweep => self.retry_sweep().await?,
            Job::LogCleanup => self.log_cleanup().await?,
        };
        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            "Job finished"
        );
        Ok(report)
    }

    /// Run every job on its interval until `shutdown` flips to true or its
    /// sender is dropped.
    pub async fn run_forever(&self, shutdown: watch::Receiver<bool>) {
        let mut loops = JoinSet::new();
        for job in Job::ALL {
            let scheduler = self.clone();
            let mut shutdown = shutdown.clone();
            let period = job.interval(&self.config.schedule);
            loops.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = ticker.tick() => {
                            if let Err(error) = scheduler.run_job(job).await {
                                tracing::error!(job = job.as_str(), %error, "Scheduled job failed");
                            }
                        }
                    }
                }
            });
        }

        tracing::info!(jobs = Job::ALL.len(), "Scheduler started");
        while let Some(joined) = loops.join_next().await {
            if let Err(error) = joined {
                tracing::error!(%error, "Scheduler loop panicked");
            }
        }
        tracing::info!("Scheduler stopped");
    }

    /// Run `task` for each connection concurrently.
    ///
    /// `Ok(true)` counts as processed, `Ok(false)` as failed; errors are
    /// logged per connection and counted as failed.
    async fn fan_out<F, Fut>(&self, job: Job, connections: Vec<Connection>, task: F) -> JobReport
    where
        F: Fn(Self, Connection) -> Fut,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for connection in connections {
            let connection_id = connection.id;
            let work = task(self.clone(), connection);
            tasks.spawn(async move { (connection_id, work.await) });
        }

        let mut report = JobReport::for_job(job);
        while let Some(joined) = tasks.join_next().await {
            report.processed += 1;
            match joined {
                Ok((_, Ok(true))) => {}
                Ok((_, Ok(false))) => report.failed += 1,
                Ok((connection_id, Err(error))) => {
                    report.failed += 1;
                    tracing::warn!(
                        job = job.as_str(),
                        connection_id = %connection_id,
                        %error,
                        "Job failed for connection"
                    );
                }
                Err(error) => {
                    report.failed += 1;
                    tracing::error!(job = job.as_str(), %error, "Job task panicked");
                }
            }
        }
        report
    }

    async fn delta_sync(&self) -> Result<JobReport> {
        let connections = self.service.store().list_active_connections().await?;
        Ok(self
            .fan_out(Job::DeltaSync, connections, |scheduler, connection| async move {
                let run = scheduler
                    .service
                    .run_now(connection.id, RunMode::Delta, RunTrigger::Scheduled)
                    .await?;
                Ok(run.status != RunStatus::Aborted)
            })
            .await)
    }

    /// Probe each active connection's credential
    async fn health_check(&self) -> Result<JobReport> {
        let connections = self.service.store().list_active_connections().await?;
        Ok(self
            .fan_out(Job::HealthCheck, connections, |scheduler, connection| async move {
                scheduler.probe(&connection).await
            })
            .await)
    }

    async fn probe(&self, connection: &Connection) -> Result<bool> {
        let store = self.service.store();
        let adapter = self.service.adapters().get(connection.provider)?;

        match adapter.authenticate(connection).await {
            Ok(_) => {
                if connection.health_failures > 0 {
                    store.set_connection_health(&connection.id, 0, None).await?;
                    tracing::info!(connection_id = %connection.id, "Connection healthy again");
                }
                Ok(true)
            }
            Err(ProviderError::Auth(message)) => {
                store
                    .set_connection_status(&connection.id, ConnectionStatus::Error, Some(&message))
                    .await?;
                tracing::warn!(
                    connection_id = %connection.id,
                    provider = %connection.provider,
                    %message,
                    "Credential rejected; connection moved to error"
                );
                Ok(false)
            }
            Err(error) => {
                let failures = connection.health_failures.saturating_add(1);
                let message = error.to_string();
                store
                    .set_connection_health(&connection.id, failures, Some(&message))
                    .await?;
                if failures >= self.config.health_failure_threshold {
                    store
                        .set_connection_status(
                            &connection.id,
                            ConnectionStatus::Error,
                            Some(&message),
                        )
                        .await?;
                    tracing::warn!(
                        connection_id = %connection.id,
                        failures,
                        "Health check failure threshold reached; connection moved to error"
                    );
                } else {
                    tracing::warn!(connection_id = %connection.id, failures, %message, "Health check failed");
                }
                Ok(false)
            }
        }
    }

    /// Re-run records whose conflicts sat open past the stale threshold,
    /// so a policy changed since then can settle them
    async fn conflict_sweep(&self) -> Result<JobReport> {
        let store = self.service.store();
        let cutoff = unix_millis_now() - millis(self.config.conflict_stale_after);
        let stale = store
            .list_stale_conflicts(cutoff, self.config.retry_sweep_limit)
            .await?;

        let mut seen = HashSet::new();
        let mut connections: HashMap<ConnectionId, Option<Connection>> = HashMap::new();
        let mut batches: HashMap<ConnectionId, Vec<ContactId>> = HashMap::new();
        for conflict in stale {
            if !seen.insert((conflict.connection_id, conflict.local_id)) {
                continue;
            }
            let connection = match connections.get(&conflict.connection_id) {
                Some(connection) => connection.clone(),
                None => {
                    let connection = store.get_connection(&conflict.connection_id).await?;
                    connections.insert(conflict.connection_id, connection.clone());
                    connection
                }
            };
            let Some(connection) = connection.filter(Connection::is_active) else {
                continue;
            };
            if connection.conflict_policy == ConflictPolicy::Manual {
                continue;
            }
            batches
                .entry(connection.id)
                .or_default()
                .push(conflict.local_id);
        }

        Ok(self
            .sweep(Job::ConflictSweep, batches, |scheduler, connection_id, local_ids| async move {
                let mut report = JobReport::for_job(Job::ConflictSweep);
                for local_id in local_ids {
                    report.processed += 1;
                    match scheduler
                        .service
                        .run_now(connection_id, RunMode::SingleRecord(local_id), RunTrigger::Scheduled)
                        .await
                    {
                        Ok(run) if run.status == RunStatus::Completed => {}
                        Ok(_) => report.failed += 1,
                        Err(error) => {
                            report.failed += 1;
                            tracing::warn!(local_id = %local_id, %error, "Conflict sweep run failed");
                        }
                    }
                }
                report
            })
            .await)
    }

    /// Re-attempt records that exhausted their in-run retries; give up on the
    /// ones older than the retry-age limit
    async fn retry_sweep(&self) -> Result<JobReport> {
        let store = self.service.store();
        let now = unix_millis_now();
        let expired = store
            .mark_failures_permanent_before(now - millis(self.config.retry_max_age))
            .await?;
        if expired > 0 {
            tracing::warn!(expired, "Failed records exceeded retry age; marked permanent");
        }

        let failures = store
            .list_pending_failures(self.config.retry_sweep_limit)
            .await?;
        let mut batches: HashMap<ConnectionId, RetryBatch> = HashMap::new();
        let mut inactive = HashSet::new();

        for failure in failures {
            if inactive.contains(&failure.connection_id) {
                continue;
            }
            if !batches.contains_key(&failure.connection_id)
                && !store
                    .get_connection(&failure.connection_id)
                    .await?
                    .is_some_and(|connection| connection.is_active())
            {
                inactive.insert(failure.connection_id);
                continue;
            }

            let batch = batches.entry(failure.connection_id).or_default();
            match (failure.local_id, failure.external_id) {
                (Some(local_id), _) => batch.local_ids.push(local_id),
                // Remote-only records come back through a queued change event
                (None, Some(external_id)) => batch.remote.push(RemoteChangeEvent {
                    external_id,
                    record: None,
                    occurred_at: None,
                }),
                (None, None) => {}
            }
        }

        Ok(self
            .sweep(Job::RetrySweep, batches, move |scheduler, connection_id, batch| async move {
                scheduler.retry_connection(connection_id, batch, now).await
            })
            .await)
    }

    /// Retry one connection's failures in order, one run at a time
    async fn retry_connection(&self, connection_id: ConnectionId, batch: RetryBatch, now: i64) -> JobReport {
        let mut report = JobReport::for_job(Job::RetrySweep);
        for local_id in batch.local_ids {
            report.processed += 1;
            match self
                .service
                .run_now(connection_id, RunMode::SingleRecord(local_id), RunTrigger::Retry)
                .await
            {
                Ok(run) if run.status == RunStatus::Completed && run.counts.failed == 0 => {}
                Ok(_) => report.failed += 1,
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(local_id = %local_id, %error, "Retry run failed");
                }
            }
        }

        if batch.remote.is_empty() {
            return report;
        }
        let count = u64::try_from(batch.remote.len()).unwrap_or(u64::MAX);
        report.processed += count;
        let store = self.service.store();
        if let Err(error) = store.enqueue_events(&connection_id, &batch.remote, now).await {
            report.failed += count;
            tracing::warn!(connection_id = %connection_id, %error, "Failed to requeue remote records");
            return report;
        }
        match self
            .service
            .run_now(connection_id, RunMode::Delta, RunTrigger::Retry)
            .await
        {
            Ok(run) if run.status == RunStatus::Completed => {}
            Ok(_) => report.failed += count,
            Err(error) => {
                report.failed += count;
                tracing::warn!(connection_id = %connection_id, %error, "Retry delta run failed");
            }
        }
        report
    }

    /// Work through per-connection batches, one task per connection.
    ///
    /// Batches for the same connection never overlap, so sweep runs do not
    /// skip each other on the run lock.
    async fn sweep<T, F, Fut>(&self, job: Job, batches: HashMap<ConnectionId, T>, work: F) -> JobReport
    where
        F: Fn(Self, ConnectionId, T) -> Fut,
        Fut: Future<Output = JobReport> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for (connection_id, batch) in batches {
            tasks.spawn(work(self.clone(), connection_id, batch));
        }

        let mut report = JobReport::for_job(job);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(part) => {
                    report.processed += part.processed;
                    report.failed += part.failed;
                }
                Err(error) => tracing::error!(job = job.as_str(), %error, "Sweep task panicked"),
            }
        }
        report
    }

    async fn log_cleanup(&self) -> Result<JobReport> {
        let store = self.service.store();
        let cutoff = unix_millis_now() - millis(self.config.log_retention);
        let runs = store.delete_runs_before(cutoff).await?;
        let events = store.delete_events_before(cutoff).await?;
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let quota_rows = store.prune_quota(&today).await?;
        tracing::debug!(runs, events, quota_rows, "Pruned old rows");

        Ok(JobReport {
            job: Some(Job::LogCleanup),
            processed: runs + events + quota_rows,
            failed: 0,
        })
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("service", &self.service)
            .field("schedule", &self.config.schedule)
            .finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
