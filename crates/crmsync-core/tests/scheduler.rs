mod common;

use std::time::Duration;

use common::{fast_settings, harness, harness_on, local_contact, person, Harness};
use crmsync_core::config::EngineConfig;
use crmsync_core::db::Database;
use crmsync_core::models::{
    ConflictPolicy, ConflictStatus, Connection, ConnectionStatus, FailedRecordStatus, Provider,
    RecordErrorKind, RunMode, RunStatus, RunTrigger, TenantId,
};
use crmsync_core::providers::ProviderError;
use crmsync_core::services::SyncStore;
use crmsync_core::sync::{Job, Scheduler};
use pretty_assertions::assert_eq;
use serde_json::json;

fn scheduler(h: &Harness, config: EngineConfig) -> Scheduler {
    Scheduler::new(
        h.service.clone(),
        EngineConfig {
            run: fast_settings(),
            ..config
        },
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn delta_job_runs_every_active_connection() {
    let h = harness(ConflictPolicy::NewestWins).await;
    h.crm.seed(person("Ada", "Lovelace", "ada@example.com"));

    let report = scheduler(&h, EngineConfig::default())
        .run_job(Job::DeltaSync)
        .await
        .unwrap();
    assert_eq!(report.job, Some(Job::DeltaSync));
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    let runs = h
        .service
        .list_recent_runs(&h.connection.id, 5)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger, RunTrigger::Scheduled);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].counts.upserted_local, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_health_failures_move_connection_to_error() {
    let h = harness(ConflictPolicy::NewestWins).await;
    h.crm
        .fail_auth_with(Some(ProviderError::Transient("connection reset".into())));
    let scheduler = scheduler(&h, EngineConfig::default());

    for expected in 1..=2 {
        let report = scheduler.run_job(Job::HealthCheck).await.unwrap();
        assert_eq!(report.failed, 1);
        let connection = h.store.require_connection(&h.connection.id).await.unwrap();
        assert_eq!(connection.health_failures, expected);
        assert_eq!(connection.status, ConnectionStatus::Active);
    }

    scheduler.run_job(Job::HealthCheck).await.unwrap();
    let connection = h.store.require_connection(&h.connection.id).await.unwrap();
    assert_eq!(connection.health_failures, 3);
    assert_eq!(connection.status, ConnectionStatus::Error);

    // Connections in error are no longer probed
    let report = scheduler.run_job(Job::HealthCheck).await.unwrap();
    assert_eq!(report.processed, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_probe_resets_failure_count() {
    let h = harness(ConflictPolicy::NewestWins).await;
    let scheduler = scheduler(&h, EngineConfig::default());
    h.crm
        .fail_auth_with(Some(ProviderError::Transient("timeout".into())));
    scheduler.run_job(Job::HealthCheck).await.unwrap();

    h.crm.fail_auth_with(None);
    let report = scheduler.run_job(Job::HealthCheck).await.unwrap();
    assert_eq!(report.failed, 0);
    let connection = h.store.require_connection(&h.connection.id).await.unwrap();
    assert_eq!(connection.health_failures, 0);
    assert_eq!(connection.status, ConnectionStatus::Active);
}

#[tokio::test(flavor = "multi_thread")]
async fn revoked_credential_fails_health_check_at_once() {
    let h = harness(ConflictPolicy::NewestWins).await;
    h.crm
        .fail_auth_with(Some(ProviderError::Auth("refresh token revoked".into())));

    scheduler(&h, EngineConfig::default())
        .run_job(Job::HealthCheck)
        .await
        .unwrap();
    let connection = h.store.require_connection(&h.connection.id).await.unwrap();
    assert_eq!(connection.status, ConnectionStatus::Error);
    assert!(connection
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("revoked")));
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_sweep_clears_recovered_failures() {
    let h = harness(ConflictPolicy::NewestWins).await;
    let contact = local_contact(h.connection.tenant_id, "Grace", "grace@example.com");
    h.store.insert_contact(&contact).await.unwrap();
    h.crm
        .fail_upserts_with(Some(ProviderError::Transient("502 bad gateway".into())));
    let run = h
        .service
        .run_now(h.connection.id, RunMode::Full, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(run.counts.failed, 1);

    h.crm.fail_upserts_with(None);
    let report = scheduler(&h, EngineConfig::default())
        .run_job(Job::RetrySweep)
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    assert!(h.store.list_pending_failures(10).await.unwrap().is_empty());
    let state = h
        .store
        .get_state(&h.connection.id, &contact.id)
        .await
        .unwrap()
        .unwrap();
    assert!(state.external_id.is_some());
    let runs = h
        .service
        .list_recent_runs(&h.connection.id, 1)
        .await
        .unwrap();
    assert_eq!(runs[0].trigger, RunTrigger::Retry);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_local_write_is_queued_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let store = SyncStore::open_path(&path).await.unwrap();
    let h = harness_on(store, ConflictPolicy::NewestWins, fast_settings()).await;
    let ada = h.crm.seed(person("Ada", "Lovelace", "ada@example.com"));

    // A second handle on the same file makes every contact insert fail
    let admin = Database::open(&path).await.unwrap();
    admin
        .connection()
        .execute_batch(
            "CREATE TRIGGER reject_contacts BEFORE INSERT ON contacts
             BEGIN SELECT RAISE(ABORT, 'disk quota exceeded'); END;",
        )
        .await
        .unwrap();

    let run = h
        .service
        .run_now(h.connection.id, RunMode::Delta, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counts.failed, 1);
    assert_eq!(run.errors[0].kind, RecordErrorKind::Storage);
    assert_eq!(run.errors[0].external_id.as_deref(), Some(ada.as_str()));

    let failures = h
        .store
        .list_failures_for_connection(&h.connection.id)
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].local_id, None);
    assert_eq!(failures[0].external_id.as_deref(), Some(ada.as_str()));
    assert_eq!(failures[0].status, FailedRecordStatus::Pending);
    assert!(failures[0].last_error.contains("disk quota exceeded"));

    admin
        .connection()
        .execute_batch("DROP TRIGGER reject_contacts;")
        .await
        .unwrap();
    let report = scheduler(&h, EngineConfig::default())
        .run_job(Job::RetrySweep)
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    assert!(h.store.list_pending_failures(10).await.unwrap().is_empty());
    assert!(h
        .store
        .get_state_by_external(&h.connection.id, &ada)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_sweep_works_connections_in_parallel() {
    let h = harness(ConflictPolicy::NewestWins).await;
    let other = Connection::new(TenantId::new(), Provider::HubSpot, "fake-eu");
    h.store.add_connection(&other).await.unwrap();
    for (index, connection) in [&h.connection, &other].into_iter().enumerate() {
        for name in ["grace", "alan"] {
            let contact = local_contact(
                connection.tenant_id,
                name,
                &format!("{name}{index}@example.com"),
            );
            h.store.insert_contact(&contact).await.unwrap();
        }
    }

    h.crm
        .fail_upserts_with(Some(ProviderError::Transient("502 bad gateway".into())));
    for connection in [&h.connection, &other] {
        let run = h
            .service
            .run_now(connection.id, RunMode::Full, RunTrigger::Manual)
            .await
            .unwrap();
        assert_eq!(run.counts.failed, 2);
    }
    h.crm.fail_upserts_with(None);
    h.crm.slow_upserts(Duration::from_millis(50));

    let report = scheduler(&h, EngineConfig::default())
        .run_job(Job::RetrySweep)
        .await
        .unwrap();
    assert_eq!(report.processed, 4);
    assert_eq!(report.failed, 0);
    assert!(h.store.list_pending_failures(10).await.unwrap().is_empty());

    // One run at a time per connection, both connections at once
    assert_eq!(h.crm.peak_concurrent_upserts(), 2);
    for connection in [&h.connection, &other] {
        let runs = h.service.list_recent_runs(&connection.id, 10).await.unwrap();
        assert!(runs
            .iter()
            .filter(|run| run.trigger == RunTrigger::Retry)
            .all(|run| run.status == RunStatus::Completed));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_failures_become_permanent() {
    let h = harness(ConflictPolicy::NewestWins).await;
    let contact = local_contact(h.connection.tenant_id, "Grace", "grace@example.com");
    h.store.insert_contact(&contact).await.unwrap();
    h.crm
        .fail_upserts_with(Some(ProviderError::Transient("502 bad gateway".into())));
    h.service
        .run_now(h.connection.id, RunMode::Full, RunTrigger::Manual)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = scheduler(
        &h,
        EngineConfig {
            retry_max_age: Duration::ZERO,
            ..EngineConfig::default()
        },
    )
    .run_job(Job::RetrySweep)
    .await
    .unwrap();
    assert_eq!(report.processed, 0);

    let failures = h
        .store
        .list_failures_for_connection(&h.connection.id)
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].status, FailedRecordStatus::Permanent);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_sweep_settles_under_a_new_policy() {
    let h = harness(ConflictPolicy::Manual).await;
    let ada = h.crm.seed(person("Ada", "Lovelace", "ada@example.com"));
    h.service
        .run_now(h.connection.id, RunMode::Delta, RunTrigger::Manual)
        .await
        .unwrap();
    let state = h
        .store
        .get_state_by_external(&h.connection.id, &ada)
        .await
        .unwrap()
        .unwrap();
    let mut contact = h.store.get_contact(&state.local_id).await.unwrap().unwrap();
    contact.first_name = Some("Augusta".into());
    contact.updated_at = crmsync_core::util::unix_millis_now();
    h.store.update_contact(&contact).await.unwrap();
    h.crm.edit(&ada, "firstname", json!("Countess"));
    let run = h
        .service
        .run_now(h.connection.id, RunMode::Delta, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(run.counts.conflicts, 1);

    let mut connection = h.store.require_connection(&h.connection.id).await.unwrap();
    connection.conflict_policy = ConflictPolicy::RemoteWins;
    h.store.update_connection(&connection).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = scheduler(
        &h,
        EngineConfig {
            conflict_stale_after: Duration::ZERO,
            ..EngineConfig::default()
        },
    )
    .run_job(Job::ConflictSweep)
    .await
    .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    let conflicts = h
        .store
        .list_open_conflicts_for_record(&h.connection.id, &contact.id)
        .await
        .unwrap();
    assert!(conflicts.is_empty());
    let contact = h.store.get_contact(&contact.id).await.unwrap().unwrap();
    assert_eq!(contact.first_name.as_deref(), Some("Countess"));
    let settled = h
        .store
        .list_conflicts(&h.connection.id, None, 10)
        .await
        .unwrap();
    assert_eq!(settled[0].status, ConflictStatus::ResolvedRemote);
}

#[tokio::test(flavor = "multi_thread")]
async fn log_cleanup_prunes_finished_runs() {
    let h = harness(ConflictPolicy::NewestWins).await;
    h.service
        .run_now(h.connection.id, RunMode::Delta, RunTrigger::Manual)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = scheduler(
        &h,
        EngineConfig {
            log_retention: Duration::ZERO,
            ..EngineConfig::default()
        },
    )
    .run_job(Job::LogCleanup)
    .await
    .unwrap();
    assert!(report.processed >= 1);
    assert!(h
        .service
        .list_recent_runs(&h.connection.id, 5)
        .await
        .unwrap()
        .is_empty());
}
