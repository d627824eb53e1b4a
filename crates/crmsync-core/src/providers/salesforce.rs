//! Salesforce REST adapter for the `Contact` object.
//!
//! Changes are read with SOQL on `SystemModstamp`; creations upsert on the
//! `Platform_Contact_Id__c` external-id field so a retried create never
//! produces a duplicate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::instrument;

use super::credentials::authenticate_oauth;
use super::{
    page_checkpoint, CrmAdapter, Credential, CredentialVault, FetchPage, FetchRequest,
    ProviderError, ProviderHttp, UpsertOutcome,
};
use crate::config::OAuthClient;
use crate::models::{Connection, Provider, RemoteRecord};

const API_VERSION: &str = "v59.0";
const MODIFIED_FIELD: &str = "SystemModstamp";
const IDEMPOTENCY_FIELD: &str = "Platform_Contact_Id__c";

type ProviderResult<T> = std::result::Result<T, ProviderError>;

pub struct SalesforceAdapter {
    http: ProviderHttp,
    vault: Arc<dyn CredentialVault>,
    oauth: Option<OAuthClient>,
    login_url: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    records: Vec<Map<String, Value>>,
    #[serde(rename = "nextRecordsUrl")]
    next_records_url: Option<String>,
}

impl SalesforceAdapter {
    pub fn new(
        http: ProviderHttp,
        vault: Arc<dyn CredentialVault>,
        oauth: Option<OAuthClient>,
        login_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            vault,
            oauth,
            login_url: login_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CrmAdapter for SalesforceAdapter {
    fn provider(&self) -> Provider {
        Provider::Salesforce
    }

    #[instrument(level = "debug", skip(self, connection), fields(connection_id = %connection.id))]
    async fn authenticate(&self, connection: &Connection) -> ProviderResult<Credential> {
        let token_url = format!("{}/services/oauth2/token", self.login_url);
        let credential = authenticate_oauth(
            &self.http,
            self.vault.as_ref(),
            connection,
            self.oauth.as_ref(),
            &token_url,
        )
        .await?;
        instance_url(&credential)?;
        Ok(credential)
    }

    #[instrument(level = "debug", skip_all, fields(connection_id = %connection.id))]
    async fn fetch_changed(
        &self,
        connection: &Connection,
        credential: &Credential,
        request: &FetchRequest,
    ) -> ProviderResult<FetchPage> {
        let instance = instance_url(credential)?;
        let url = match &request.page_token {
            Some(next) => format!("{instance}{next}"),
            None => {
                let since = request
                    .since
                    .as_ref()
                    .map(|since| {
                        since.as_datetime().ok_or_else(|| {
                            ProviderError::Validation(format!(
                                "checkpoint '{}' is not a timestamp",
                                since.as_str()
                            ))
                        })
                    })
                    .transpose()?;
                let soql = changed_since_query(&request.properties, since)?;
                let mut url = reqwest::Url::parse(&format!(
                    "{instance}/services/data/{API_VERSION}/query"
                ))
                .map_err(|error| ProviderError::Auth(format!("invalid instance url: {error}")))?;
                url.query_pairs_mut().append_pair("q", &soql);
                url.to_string()
            }
        };

        let request_builder = self
            .http
            .client()
            .get(url)
            .bearer_auth(&credential.access_token);
        let body = self.http.send_json(connection, request_builder).await?;
        let response: QueryResponse = serde_json::from_value(body).map_err(|error| {
            ProviderError::Transient(format!("unexpected Salesforce query shape: {error}"))
        })?;

        let records: Vec<RemoteRecord> = response.records.into_iter().map(to_record).collect();
        let checkpoint = page_checkpoint(&records, request.since.as_ref());
        Ok(FetchPage {
            records,
            next_page_token: response.next_records_url,
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
        let instance = instance_url(credential)?;
        let fields = select_fields(properties)?;
        let request = self
            .http
            .client()
            .get(format!(
                "{instance}/services/data/{API_VERSION}/sobjects/Contact/{external_id}"
            ))
            .bearer_auth(&credential.access_token)
            .query(&[("fields", fields.join(","))]);

        match self.http.send_json(connection, request).await {
            Ok(Value::Object(fields)) => Ok(Some(to_record(fields))),
            Ok(other) => Err(ProviderError::Transient(format!(
                "unexpected Salesforce record shape: {other}"
            ))),
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
        let instance = instance_url(credential)?;
        let sobject = format!("{instance}/services/data/{API_VERSION}/sobjects/Contact");
        let mut fields = record.properties.clone();
        fields.remove("Id");
        fields.remove(MODIFIED_FIELD);
        fields.remove(IDEMPOTENCY_FIELD);

        let (request, known_id) = match (&record.external_id, &record.idempotency_key) {
            (Some(external_id), _) => (
                self.http.client().patch(format!("{sobject}/{external_id}")),
                Some(external_id.clone()),
            ),
            (None, Some(key)) => (
                self.http
                    .client()
                    .patch(format!("{sobject}/{IDEMPOTENCY_FIELD}/{key}")),
                None,
            ),
            (None, None) => (self.http.client().post(sobject), None),
        };

        let body = self
            .http
            .send_json(
                connection,
                request
                    .bearer_auth(&credential.access_token)
                    .json(&Value::Object(fields)),
            )
            .await?;

        let external_id = body
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(known_id)
            .ok_or_else(|| {
                ProviderError::Transient("Salesforce response carried no record id".into())
            })?;
        // Salesforce write responses carry no modification stamp
        Ok(UpsertOutcome {
            external_id,
            modified_at: None,
        })
    }
}

fn instance_url(credential: &Credential) -> ProviderResult<String> {
    credential
        .instance_url
        .as_deref()
        .map(|url| url.trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ProviderError::Auth("Salesforce credential has no instance url".into()))
}

/// Field list for a SOQL select; names are validated since they end up in the query
fn select_fields(properties: &[String]) -> ProviderResult<Vec<String>> {
    let identifier = Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$")
        .map_err(|error| ProviderError::Validation(error.to_string()))?;

    let mut fields = vec!["Id".to_string(), MODIFIED_FIELD.to_string()];
    for property in properties {
        if !identifier.is_match(property) {
            return Err(ProviderError::Validation(format!(
                "'{property}' is not a valid Salesforce field name"
            )));
        }
        if !fields.contains(property) {
            fields.push(property.clone());
        }
    }
    Ok(fields)
}

fn changed_since_query(properties: &[String], since: Option<DateTime<Utc>>) -> ProviderResult<String> {
    let fields = select_fields(properties)?.join(", ");
    let filter = since.map_or_else(String::new, |since| {
        format!(
            " WHERE {MODIFIED_FIELD} >= {}",
            since.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    });
    Ok(format!(
        "SELECT {fields} FROM Contact{filter} ORDER BY {MODIFIED_FIELD} ASC"
    ))
}

fn to_record(mut fields: Map<String, Value>) -> RemoteRecord {
    fields.remove("attributes");
    let external_id = fields.get("Id").and_then(Value::as_str).map(str::to_string);
    let modified_at = fields
        .get(MODIFIED_FIELD)
        .and_then(Value::as_str)
        .and_then(parse_instant);
    RemoteRecord {
        external_id,
        properties: fields,
        modified_at,
        idempotency_key: None,
    }
}

/// Salesforce writes `2024-05-01T12:30:00.000+0000`
fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|at| at.with_timezone(&Utc))
        .ok()
}
