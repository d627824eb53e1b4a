//! HubSpot CRM v3 contacts adapter.
//!
//! Delta fetches use the search API filtered on `lastmodifieddate`; full
//! fetches page through the contacts list. Creations that collide with an
//! existing contact (409 "Existing ID") are turned into updates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::instrument;

use super::credentials::authenticate_oauth;
use super::http::RawResponse;
use super::{
    page_checkpoint, CrmAdapter, Credential, CredentialVault, FetchPage, FetchRequest,
    ProviderError, ProviderHttp, UpsertOutcome,
};
use crate::config::OAuthClient;
use crate::models::{Connection, Provider, RemoteRecord};

const DEFAULT_API_BASE: &str = "https://api.hubapi.com";
const PAGE_SIZE: u32 = 100;
const MODIFIED_PROPERTY: &str = "lastmodifieddate";

type ProviderResult<T> = std::result::Result<T, ProviderError>;

pub struct HubSpotAdapter {
    http: ProviderHttp,
    vault: Arc<dyn CredentialVault>,
    oauth: Option<OAuthClient>,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct HubSpotObject {
    id: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(rename = "updatedAt")]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubSpotPage {
    #[serde(default)]
    results: Vec<HubSpotObject>,
    paging: Option<HubSpotPaging>,
}

#[derive(Debug, Deserialize)]
struct HubSpotPaging {
    next: Option<HubSpotNext>,
}

#[derive(Debug, Deserialize)]
struct HubSpotNext {
    after: String,
}

#[derive(Debug, Serialize)]
struct HubSpotSearchRequest {
    #[serde(rename = "filterGroups")]
    filter_groups: Vec<HubSpotFilterGroup>,
    sorts: Vec<HubSpotSort>,
    properties: Vec<String>,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<String>,
}

#[derive(Debug, Serialize)]
struct HubSpotFilterGroup {
    filters: Vec<HubSpotFilter>,
}

#[derive(Debug, Serialize)]
struct HubSpotFilter {
    #[serde(rename = "propertyName")]
    property_name: String,
    operator: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct HubSpotSort {
    #[serde(rename = "propertyName")]
    property_name: String,
    direction: String,
}

impl HubSpotAdapter {
    pub fn new(
        http: ProviderHttp,
        vault: Arc<dyn CredentialVault>,
        oauth: Option<OAuthClient>,
    ) -> Self {
        Self {
            http,
            vault,
            oauth,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn contacts_url(&self) -> String {
        format!("{}/crm/v3/objects/contacts", self.api_base)
    }

    async fn patch_contact(
        &self,
        connection: &Connection,
        credential: &Credential,
        external_id: &str,
        properties: &Map<String, Value>,
    ) -> ProviderResult<UpsertOutcome> {
        let request = self
            .http
            .client()
            .patch(format!("{}/{external_id}", self.contacts_url()))
            .bearer_auth(&credential.access_token)
            .json(&json!({ "properties": properties }));
        let body = self.http.send_json(connection, request).await?;
        outcome_from(&body, Some(external_id))
    }
}

#[async_trait]
impl CrmAdapter for HubSpotAdapter {
    fn provider(&self) -> Provider {
        Provider::HubSpot
    }

    #[instrument(level = "debug", skip(self, connection), fields(connection_id = %connection.id))]
    async fn authenticate(&self, connection: &Connection) -> ProviderResult<Credential> {
        let token_url = format!("{}/oauth/v1/token", self.api_base);
        authenticate_oauth(
            &self.http,
            self.vault.as_ref(),
            connection,
            self.oauth.as_ref(),
            &token_url,
        )
        .await
    }

    #[instrument(level = "debug", skip_all, fields(connection_id = %connection.id))]
    async fn fetch_changed(
        &self,
        connection: &Connection,
        credential: &Credential,
        request: &FetchRequest,
    ) -> ProviderResult<FetchPage> {
        let properties = with_modified_property(&request.properties);

        let http_request = match &request.since {
            Some(since) => {
                let since_ms = since
                    .as_datetime()
                    .map(|at| at.timestamp_millis())
                    .ok_or_else(|| {
                        ProviderError::Validation(format!(
                            "checkpoint '{}' is not a timestamp",
                            since.as_str()
                        ))
                    })?;
                let body = search_request(since_ms, properties, request.page_token.clone());
                self.http
                    .client()
                    .post(format!("{}/search", self.contacts_url()))
                    .bearer_auth(&credential.access_token)
                    .json(&body)
            }
            None => {
                let mut query = vec![
                    ("limit", PAGE_SIZE.to_string()),
                    ("properties", properties.join(",")),
                ];
                if let Some(after) = &request.page_token {
                    query.push(("after", after.clone()));
                }
                self.http
                    .client()
                    .get(self.contacts_url())
                    .bearer_auth(&credential.access_token)
                    .query(&query)
            }
        };

        let body = self.http.send_json(connection, http_request).await?;
        let page: HubSpotPage = serde_json::from_value(body).map_err(|error| {
            ProviderError::Transient(format!("unexpected HubSpot page shape: {error}"))
        })?;

        let records: Vec<RemoteRecord> = page.results.into_iter().map(to_record).collect();
        let checkpoint = page_checkpoint(&records, request.since.as_ref());
        Ok(FetchPage {
            records,
            next_page_token: page.paging.and_then(|paging| paging.next).map(|next| next.after),
            checkpoint,
        })
    }

    #[instrument(level = "debug", skip(self, connection, credential, properties), fields(connection_id = %connection.id))]
    async fn fetch_record(
        &self,
        connection: &Connection,
        credential: &Credential,
        external_id: &str,
        properties: &[String],
    ) -> ProviderResult<Option<RemoteRecord>> {
        let request = self
            .http
            .client()
            .get(format!("{}/{external_id}", self.contacts_url()))
            .bearer_auth(&credential.access_token)
            .query(&[("properties", with_modified_property(properties).join(","))]);

        match self.http.send_json(connection, request).await {
            Ok(body) => {
                let object: HubSpotObject = serde_json::from_value(body).map_err(|error| {
                    ProviderError::Transient(format!("unexpected HubSpot contact shape: {error}"))
                })?;
                Ok(Some(to_record(object)))
            }
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
        if let Some(external_id) = &record.external_id {
            return self
                .patch_contact(connection, credential, external_id, &record.properties)
                .await;
        }

        let request = self
            .http
            .client()
            .post(self.contacts_url())
            .bearer_auth(&credential.access_token)
            .json(&json!({ "properties": record.properties }));
        let raw = self.http.send_raw(connection, request).await?;
        if raw.status.is_success() {
            return outcome_from(&raw.json()?, None);
        }

        if let Some(existing_id) = existing_contact_id(&raw) {
            tracing::info!(
                connection_id = %connection.id,
                external_id = %existing_id,
                "HubSpot contact already exists; updating it instead"
            );
            return self
                .patch_contact(connection, credential, &existing_id, &record.properties)
                .await;
        }
        Err(raw.into_error())
    }
}

fn with_modified_property(properties: &[String]) -> Vec<String> {
    let mut properties = properties.to_vec();
    if !properties.iter().any(|property| property == MODIFIED_PROPERTY) {
        properties.push(MODIFIED_PROPERTY.to_string());
    }
    properties
}

fn search_request(since_ms: i64, properties: Vec<String>, after: Option<String>) -> HubSpotSearchRequest {
    HubSpotSearchRequest {
        filter_groups: vec![HubSpotFilterGroup {
            filters: vec![HubSpotFilter {
                property_name: MODIFIED_PROPERTY.to_string(),
                operator: "GTE".to_string(),
                value: since_ms.to_string(),
            }],
        }],
        sorts: vec![HubSpotSort {
            property_name: MODIFIED_PROPERTY.to_string(),
            direction: "ASCENDING".to_string(),
        }],
        properties,
        limit: PAGE_SIZE,
        after,
    }
}

fn to_record(object: HubSpotObject) -> RemoteRecord {
    let modified_at = object
        .updated_at
        .as_deref()
        .and_then(parse_instant)
        .or_else(|| {
            object
                .properties
                .get(MODIFIED_PROPERTY)
                .and_then(Value::as_str)
                .and_then(parse_instant)
        });
    RemoteRecord {
        external_id: Some(object.id),
        properties: object.properties,
        modified_at,
        idempotency_key: None,
    }
}

/// HubSpot timestamps come as RFC 3339 or as epoch-millisecond strings
fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .ok()
        .or_else(|| value.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis))
}

fn outcome_from(body: &Value, fallback_id: Option<&str>) -> ProviderResult<UpsertOutcome> {
    let external_id = body
        .get("id")
        .and_then(|id| match id {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        })
        .or_else(|| fallback_id.map(str::to_string))
        .ok_or_else(|| ProviderError::Transient("HubSpot response carried no contact id".into()))?;
    let modified_at = body
        .get("updatedAt")
        .and_then(Value::as_str)
        .and_then(parse_instant)
        .map(|at| at.timestamp_millis());
    Ok(UpsertOutcome {
        external_id,
        modified_at,
    })
}

/// Id of the contact a 409 creation collided with
fn existing_contact_id(raw: &RawResponse) -> Option<String> {
    if raw.status.as_u16() != 409 {
        return None;
    }
    let pattern = Regex::new(r"Existing ID:\s*(\d+)").ok()?;
    pattern
        .captures(&raw.body)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}
