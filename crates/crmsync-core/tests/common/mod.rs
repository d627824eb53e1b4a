//! In-process CRM used by the engine tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmsync_core::config::RunSettings;
use crmsync_core::models::{
    Checkpoint, ConflictPolicy, Connection, Contact, Provider, RemoteRecord, TenantId,
};
use crmsync_core::providers::{
    AdapterRegistry, CrmAdapter, Credential, FetchPage, FetchRequest, ProviderError, UpsertOutcome,
};
use crmsync_core::services::{SyncService, SyncStore};
use serde_json::{json, Value};

const PAGE_SIZE: usize = 2;

#[derive(Default)]
struct FakeState {
    records: BTreeMap<String, RemoteRecord>,
    next_id: u64,
    upserts: Vec<RemoteRecord>,
    rejected_email: Option<String>,
    upsert_failure: Option<ProviderError>,
    auth_failure: Option<ProviderError>,
    upsert_delay: Duration,
    in_flight: usize,
    peak_in_flight: usize,
}

/// HubSpot-shaped CRM kept in memory
#[derive(Default)]
pub struct FakeCrm {
    state: Mutex<FakeState>,
}

impl FakeCrm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a remote contact modified now; returns its id
    pub fn seed(&self, properties: Value) -> String {
        self.seed_at(properties, Utc::now())
    }

    pub fn seed_at(&self, properties: Value, modified_at: DateTime<Utc>) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("hs-{}", state.next_id);
        let Value::Object(properties) = properties else {
            panic!("properties must be an object");
        };
        state.records.insert(
            id.clone(),
            RemoteRecord {
                external_id: Some(id.clone()),
                properties,
                modified_at: Some(modified_at),
                idempotency_key: None,
            },
        );
        id
    }

    pub fn edit(&self, id: &str, key: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        let record = state.records.get_mut(id).expect("unknown record");
        record.properties.insert(key.to_string(), value);
        record.modified_at = Some(Utc::now());
    }

    pub fn remove(&self, id: &str) {
        self.state.lock().unwrap().records.remove(id);
    }

    pub fn record(&self, id: &str) -> Option<RemoteRecord> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    pub fn records(&self) -> Vec<RemoteRecord> {
        self.state.lock().unwrap().records.values().cloned().collect()
    }

    pub fn upserts(&self) -> Vec<RemoteRecord> {
        self.state.lock().unwrap().upserts.clone()
    }

    /// Reject creations and updates whose email contains `needle`
    pub fn reject_email(&self, needle: &str) {
        self.state.lock().unwrap().rejected_email = Some(needle.to_string());
    }

    pub fn fail_upserts_with(&self, error: Option<ProviderError>) {
        self.state.lock().unwrap().upsert_failure = error;
    }

    /// Hold every upsert for `delay` before it is applied
    pub fn slow_upserts(&self, delay: Duration) {
        self.state.lock().unwrap().upsert_delay = delay;
    }

    /// Most upserts that were ever waiting out the delay at once
    pub fn peak_concurrent_upserts(&self) -> usize {
        self.state.lock().unwrap().peak_in_flight
    }

    pub fn fail_auth_with(&self, error: Option<ProviderError>) {
        self.state.lock().unwrap().auth_failure = error;
    }
}

#[async_trait]
impl CrmAdapter for FakeCrm {
    fn provider(&self) -> Provider {
        Provider::HubSpot
    }

    async fn authenticate(&self, _connection: &Connection) -> Result<Credential, ProviderError> {
        match self.state.lock().unwrap().auth_failure.clone() {
            Some(error) => Err(error),
            None => Ok(Credential::api_token("fake-token")),
        }
    }

    async fn fetch_changed(
        &self,
        _connection: &Connection,
        _credential: &Credential,
        request: &FetchRequest,
    ) -> Result<FetchPage, ProviderError> {
        let state = self.state.lock().unwrap();
        let since = request.since.as_ref().and_then(Checkpoint::as_datetime);
        let mut changed: Vec<RemoteRecord> = state
            .records
            .values()
            .filter(|record| match (since, record.modified_at) {
                (Some(since), Some(modified_at)) => modified_at >= since,
                _ => true,
            })
            .cloned()
            .collect();
        changed.sort_by_key(|record| record.modified_at);

        let offset: usize = request
            .page_token
            .as_deref()
            .map_or(0, |token| token.parse().unwrap());
        let records: Vec<RemoteRecord> = changed.iter().skip(offset).take(PAGE_SIZE).cloned().collect();
        let next_page_token =
            (offset + PAGE_SIZE < changed.len()).then(|| (offset + PAGE_SIZE).to_string());
        let checkpoint = records
            .iter()
            .filter_map(|record| record.modified_at)
            .max()
            .map(Checkpoint::from_datetime)
            .or_else(|| request.since.clone());

        Ok(FetchPage {
            records,
            next_page_token,
            checkpoint,
        })
    }

    async fn fetch_record(
        &self,
        _connection: &Connection,
        _credential: &Credential,
        external_id: &str,
        _properties: &[String],
    ) -> Result<Option<RemoteRecord>, ProviderError> {
        Ok(self.record(external_id))
    }

    async fn upsert_remote(
        &self,
        _connection: &Connection,
        _credential: &Credential,
        record: &RemoteRecord,
    ) -> Result<UpsertOutcome, ProviderError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            state.upsert_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().unwrap().in_flight -= 1;
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.upsert_failure.clone() {
            return Err(error);
        }
        if let (Some(needle), Some(email)) = (
            state.rejected_email.as_deref(),
            record.properties.get("email").and_then(Value::as_str),
        ) {
            if email.contains(needle) {
                return Err(ProviderError::Validation(format!("invalid email {email}")));
            }
        }
        state.upserts.push(record.clone());

        let now = Utc::now();
        let id = match &record.external_id {
            Some(id) => {
                let existing = state
                    .records
                    .get_mut(id)
                    .ok_or_else(|| ProviderError::NotFound(format!("contact {id}")))?;
                existing.properties.extend(record.properties.clone());
                existing.modified_at = Some(now);
                id.clone()
            }
            None => {
                state.next_id += 1;
                let id = format!("hs-{}", state.next_id);
                state.records.insert(
                    id.clone(),
                    RemoteRecord {
                        external_id: Some(id.clone()),
                        properties: record.properties.clone(),
                        modified_at: Some(now),
                        idempotency_key: None,
                    },
                );
                id
            }
        };

        Ok(UpsertOutcome {
            external_id: id,
            modified_at: Some(now.timestamp_millis()),
        })
    }
}

pub struct Harness {
    pub store: SyncStore,
    pub crm: Arc<FakeCrm>,
    pub service: SyncService,
    pub connection: Connection,
}

pub fn fast_settings() -> RunSettings {
    RunSettings {
        retry_base_delay: Duration::from_millis(1),
        rate_limit_wait_budget: Duration::from_millis(50),
        ..RunSettings::default()
    }
}

pub async fn harness(policy: ConflictPolicy) -> Harness {
    let store = SyncStore::open_in_memory().await.unwrap();
    harness_on(store, policy, fast_settings()).await
}

pub async fn harness_on(store: SyncStore, policy: ConflictPolicy, settings: RunSettings) -> Harness {
    let crm = FakeCrm::new();

    let mut registry = AdapterRegistry::new();
    registry.register(crm.clone());
    let service = SyncService::new(store.clone(), Arc::new(registry), settings);

    let mut connection = Connection::new(TenantId::new(), Provider::HubSpot, "fake");
    connection.conflict_policy = policy;
    store.add_connection(&connection).await.unwrap();

    Harness {
        store,
        crm,
        service,
        connection,
    }
}

pub fn person(first: &str, last: &str, email: &str) -> Value {
    json!({"firstname": first, "lastname": last, "email": email})
}

pub fn local_contact(tenant_id: TenantId, first: &str, email: &str) -> Contact {
    let mut contact = Contact::new(tenant_id);
    contact.first_name = Some(first.to_string());
    contact.email = Some(email.to_string());
    contact
}
