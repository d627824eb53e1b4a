//! Provider webhook payloads normalized into change events.
//!
//! Signature verification is the caller's job; this only parses.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{Provider, RemoteChangeEvent};
use crate::providers::pipedrive_record;

/// HubSpot subscription types that mean "this contact changed"
const HUBSPOT_CONTACT_EVENTS: [&str; 2] = ["contact.propertyChange", "contact.creation"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HubSpotEvent {
    subscription_type: String,
    object_id: Value,
    #[serde(default)]
    occurred_at: Option<i64>,
}

/// Turn one webhook delivery into change events, one per changed record.
///
/// Unrelated events in the payload are dropped. An event carries the full
/// record only when the provider sent one.
pub fn normalize_webhook(provider: Provider, payload: &Value) -> Result<Vec<RemoteChangeEvent>> {
    match provider {
        Provider::HubSpot => normalize_hubspot(payload),
        Provider::Pipedrive => normalize_pipedrive(payload),
        Provider::Salesforce => Err(Error::InvalidInput(
            "Salesforce outbound messages are not supported".to_string(),
        )),
    }
}

fn normalize_hubspot(payload: &Value) -> Result<Vec<RemoteChangeEvent>> {
    let events: Vec<HubSpotEvent> = match payload {
        Value::Array(_) => serde_json::from_value(payload.clone())?,
        Value::Object(_) => vec![serde_json::from_value(payload.clone())?],
        _ => {
            return Err(Error::InvalidInput(
                "HubSpot webhook payload must be an event or an array of events".to_string(),
            ))
        }
    };

    // A batch often reports several properties of the same contact
    let mut latest: BTreeMap<String, Option<DateTime<Utc>>> = BTreeMap::new();
    for event in events {
        if !HUBSPOT_CONTACT_EVENTS.contains(&event.subscription_type.as_str()) {
            continue;
        }
        let Some(external_id) = id_text(&event.object_id) else {
            continue;
        };
        let occurred_at = event
            .occurred_at
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());
        let entry = latest.entry(external_id).or_insert(occurred_at);
        if occurred_at > *entry {
            *entry = occurred_at;
        }
    }

    Ok(latest
        .into_iter()
        .map(|(external_id, occurred_at)| RemoteChangeEvent {
            external_id,
            record: None,
            occurred_at,
        })
        .collect())
}

fn normalize_pipedrive(payload: &Value) -> Result<Vec<RemoteChangeEvent>> {
    let meta = payload.get("meta");
    let object = meta
        .and_then(|meta| meta.get("object"))
        .and_then(Value::as_str);
    if object.is_some_and(|object| object != "person") {
        return Ok(Vec::new());
    }

    let occurred_at = meta
        .and_then(|meta| meta.get("timestamp"))
        .and_then(Value::as_i64)
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single());

    match payload.get("current") {
        Some(Value::Object(person)) => {
            let record = pipedrive_record(person.clone());
            let Some(external_id) = record.external_id.clone() else {
                return Err(Error::InvalidInput(
                    "Pipedrive person payload has no id".to_string(),
                ));
            };
            Ok(vec![RemoteChangeEvent {
                external_id,
                record: Some(record),
                occurred_at,
            }])
        }
        // Deletions carry no current person; nothing to pull
        _ => Ok(meta
            .and_then(|meta| meta.get("id"))
            .and_then(id_text)
            .filter(|_| meta.and_then(|meta| meta.get("action")).and_then(Value::as_str) != Some("deleted"))
            .map(|external_id| RemoteChangeEvent {
                external_id,
                record: None,
                occurred_at,
            })
            .into_iter()
            .collect()),
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
