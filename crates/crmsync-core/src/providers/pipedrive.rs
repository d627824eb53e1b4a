//! Pipedrive v1 persons adapter (API token auth)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::instrument;

use super::credentials::load_credential;
use super::{
    page_checkpoint, CrmAdapter, Credential, CredentialVault, FetchPage, FetchRequest,
    ProviderError, ProviderHttp, UpsertOutcome,
};
use crate::models::{Connection, Provider, RemoteRecord};

const DEFAULT_API_BASE: &str = "https://api.pipedrive.com";
const PAGE_SIZE: u32 = 100;
const MODIFIED_FIELD: &str = "update_time";

type ProviderResult<T> = std::result::Result<T, ProviderError>;

pub struct PipedriveAdapter {
    http: ProviderHttp,
    vault: Arc<dyn CredentialVault>,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    data: Option<Vec<Value>>,
    additional_data: Option<AdditionalData>,
}

#[derive(Debug, Deserialize)]
struct AdditionalData {
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    more_items_in_collection: bool,
    next_start: Option<u64>,
}

impl PipedriveAdapter {
    pub fn new(http: ProviderHttp, vault: Arc<dyn CredentialVault>) -> Self {
        Self {
            http,
            vault,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.api_base)
    }
}

#[async_trait]
impl CrmAdapter for PipedriveAdapter {
    fn provider(&self) -> Provider {
        Provider::Pipedrive
    }

    /// Pipedrive tokens do not expire; validate the stored one instead
    #[instrument(level = "debug", skip(self, connection), fields(connection_id = %connection.id))]
    async fn authenticate(&self, connection: &Connection) -> ProviderResult<Credential> {
        let credential = load_credential(self.vault.as_ref(), connection).await?;
        let request = self
            .http
            .client()
            .get(self.url("users/me"))
            .query(&[("api_token", credential.access_token.as_str())]);
        self.http.send_json(connection, request).await?;
        Ok(credential)
    }

    #[instrument(level = "debug", skip_all, fields(connection_id = %connection.id))]
    async fn fetch_changed(
        &self,
        connection: &Connection,
        credential: &Credential,
        request: &FetchRequest,
    ) -> ProviderResult<FetchPage> {
        let start = request.page_token.clone().unwrap_or_else(|| "0".to_string());
        let mut query = vec![
            ("api_token", credential.access_token.clone()),
            ("start", start),
            ("limit", PAGE_SIZE.to_string()),
        ];
        let path = match &request.since {
            Some(since) => {
                let since = since.as_datetime().ok_or_else(|| {
                    ProviderError::Validation(format!(
                        "checkpoint '{}' is not a timestamp",
                        since.as_str()
                    ))
                })?;
                query.push(("items", "person".to_string()));
                query.push((
                    "since_timestamp",
                    since.format("%Y-%m-%d %H:%M:%S").to_string(),
                ));
                "recents"
            }
            None => "persons",
        };

        let http_request = self.http.client().get(self.url(path)).query(&query);
        let body = self.http.send_json(connection, http_request).await?;
        let response: ListResponse = serde_json::from_value(body).map_err(|error| {
            ProviderError::Transient(format!("unexpected Pipedrive list shape: {error}"))
        })?;

        let records: Vec<RemoteRecord> = response
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| person_from_item(item, request.since.is_some()))
            .map(to_record)
            .collect();
        let next_page_token = response
            .additional_data
            .and_then(|data| data.pagination)
            .filter(|pagination| pagination.more_items_in_collection)
            .and_then(|pagination| pagination.next_start)
            .map(|start| start.to_string());
        let checkpoint = page_checkpoint(&records, request.since.as_ref());
        Ok(FetchPage {
            records,
            next_page_token,
            checkpoint,
        })
    }

    #[instrument(level = "debug", skip(self, connection, credential, _properties), fields(connection_id = %connection.id))]
    async fn fetch_record(
        &self,
        connection: &Connection,
        credential: &Credential,
        external_id: &str,
        _properties: &[String],
    ) -> ProviderResult<Option<RemoteRecord>> {
        let request = self
            .http
            .client()
            .get(self.url(&format!("persons/{external_id}")))
            .query(&[("api_token", credential.access_token.as_str())]);
        match self.http.send_json(connection, request).await {
            Ok(body) => Ok(data_object(body).map(to_record)),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    #[instrument(level = "debug", skip_all, fields(connection_id = %connection.id, external_id = ?record.external_id))]
    async fn upsert_remote(
        &self,
        connection: &Connection,
        credential: &Credential,
        record: &RemoteRecord,
    ) -> ProviderResult<UpsertOutcome> {
        let client = self.http.client();
        let request = match &record.external_id {
            Some(external_id) => client.put(self.url(&format!("persons/{external_id}"))),
            None => client.post(self.url("persons")),
        };
        let request = request
            .query(&[("api_token", credential.access_token.as_str())])
            .json(&Value::Object(record.properties.clone()));

        let body = self.http.send_json(connection, request).await?;
        let person = data_object(body).ok_or_else(|| {
            ProviderError::Transient("Pipedrive response carried no person".into())
        })?;
        let record = to_record(person);
        let external_id = record
            .external_id
            .ok_or_else(|| ProviderError::Transient("Pipedrive response carried no id".into()))?;
        Ok(UpsertOutcome {
            external_id,
            modified_at: record.modified_at.map(|at| at.timestamp_millis()),
        })
    }
}

/// `/recents` wraps each person as `{item, id, data}`; `/persons` returns it bare
fn person_from_item(item: Value, from_recents: bool) -> Option<Map<String, Value>> {
    let Value::Object(mut item) = item else {
        return None;
    };
    if !from_recents {
        return Some(item);
    }
    if item.get("item").and_then(Value::as_str) != Some("person") {
        return None;
    }
    match item.remove("data") {
        Some(Value::Object(person)) => Some(person),
        _ => None,
    }
}

fn data_object(body: Value) -> Option<Map<String, Value>> {
    match body {
        Value::Object(mut body) => match body.remove("data") {
            Some(Value::Object(person)) => Some(person),
            _ => None,
        },
        _ => None,
    }
}

fn person_id(properties: &Map<String, Value>) -> Option<String> {
    properties.get("id").map(|id| match id {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    })
}

pub(crate) fn to_record(person: Map<String, Value>) -> RemoteRecord {
    let external_id = person_id(&person);
    let modified_at = person
        .get(MODIFIED_FIELD)
        .and_then(Value::as_str)
        .and_then(parse_instant);
    RemoteRecord {
        external_id,
        properties: person,
        modified_at,
        idempotency_key: None,
    }
}

/// Pipedrive timestamps are UTC `YYYY-MM-DD HH:MM:SS`
fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|at| at.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn recents_items_unwrap_to_persons() {
        let person = person_from_item(
            json!({"item": "person", "id": 7, "data": {"id": 7, "first_name": "Ada", "update_time": "2024-05-01 12:30:00"}}),
            true,
        )
        .unwrap();
        let record = to_record(person);
        assert_eq!(record.external_id.as_deref(), Some("7"));
        assert_eq!(record.properties["first_name"], json!("Ada"));
        assert_eq!(
            record.modified_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap())
        );

        assert!(person_from_item(json!({"item": "deal", "id": 3, "data": {}}), true).is_none());
    }

    #[test]
    fn list_response_paginates_with_start() {
        let response: ListResponse = serde_json::from_value(json!({
            "success": true,
            "data": null,
            "additional_data": {"pagination": {"start": 0, "limit": 100, "more_items_in_collection": true, "next_start": 100}}
        }))
        .unwrap();
        assert!(response.data.is_none());
        let pagination = response.additional_data.unwrap().pagination.unwrap();
        assert!(pagination.more_items_in_collection);
        assert_eq!(pagination.next_start, Some(100));
    }

    #[test]
    fn data_envelope_is_unwrapped() {
        let person = data_object(json!({"success": true, "data": {"id": 12, "name": "Ada"}})).unwrap();
        assert_eq!(person_id(&person), Some("12".to_string()));
        assert!(data_object(json!({"success": false, "data": null})).is_none());
    }
}
