//! Conversion between provider JSON values and typed canonical values

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::{json, Value};

use super::DateStyle;
use crate::models::{FieldKind, FieldValue};

/// Decode a provider value into the shape of a canonical field.
///
/// Enum membership is checked separately by [`check`] so that transforms can
/// run on provider-specific spellings first.
pub fn decode(value: &Value, kind: FieldKind) -> Result<FieldValue, String> {
    let decoded = match kind {
        FieldKind::Text => scalar_text(value)?.map_or(FieldValue::Null, FieldValue::Text),
        FieldKind::Enum(_) => scalar_text(value)?.map_or(FieldValue::Null, |text| {
            FieldValue::Enum(text.trim().to_lowercase())
        }),
        FieldKind::List => FieldValue::List(list_items(value)?),
        FieldKind::Date => match value {
            Value::Null => FieldValue::Null,
            Value::Number(number) => {
                let millis = number
                    .as_i64()
                    .ok_or_else(|| format!("'{number}' is not an epoch timestamp"))?;
                FieldValue::Date(date_from_millis(millis)?)
            }
            Value::String(text) if text.trim().is_empty() => FieldValue::Null,
            Value::String(text) => FieldValue::Date(
                parse_date(text).ok_or_else(|| format!("'{text}' is not a recognized date"))?,
            ),
            other => return Err(format!("expected a date, got {other}")),
        },
    };
    Ok(decoded.normalized())
}

/// Verify a (transformed) value against its canonical kind.
pub fn check(value: FieldValue, kind: FieldKind) -> Result<FieldValue, String> {
    match (kind, value) {
        (FieldKind::Enum(allowed), FieldValue::Enum(text) | FieldValue::Text(text)) => {
            let text = text.trim().to_lowercase();
            if allowed.contains(&text.as_str()) {
                Ok(FieldValue::Enum(text))
            } else {
                Err(format!("'{text}' is not one of {}", allowed.join(", ")))
            }
        }
        (_, value) => Ok(value.normalized()),
    }
}

/// Encode a canonical value for a provider field.
pub fn encode(value: &FieldValue, multi_valued: bool, date_style: DateStyle) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Text(text) | FieldValue::Enum(text) => {
            if multi_valued {
                json!([{ "value": text, "primary": true }])
            } else {
                Value::String(text.clone())
            }
        }
        FieldValue::List(items) => {
            if multi_valued {
                Value::Array(
                    items
                        .iter()
                        .enumerate()
                        .map(|(index, item)| json!({ "value": item, "primary": index == 0 }))
                        .collect(),
                )
            } else {
                items
                    .first()
                    .map_or(Value::Null, |first| Value::String(first.clone()))
            }
        }
        FieldValue::Date(date) => match date_style {
            DateStyle::EpochMillis => json!(date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()),
            DateStyle::IsoDate => Value::String(date.format("%Y-%m-%d").to_string()),
        },
    }
}

/// Parse the date spellings providers use.
///
/// Accepts `YYYY-MM-DD`, RFC 3339, Salesforce `+0000` offsets, `MM/DD/YYYY`
/// and epoch milliseconds. Instants are reduced to their UTC calendar date.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc).date_naive());
    }
    if let Ok(at) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(at.with_timezone(&Utc).date_naive());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%m/%d/%Y") {
        return Some(date);
    }
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return text
            .parse::<i64>()
            .ok()
            .and_then(|millis| date_from_millis(millis).ok());
    }
    None
}

fn date_from_millis(millis: i64) -> Result<NaiveDate, String> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|at| at.date_naive())
        .ok_or_else(|| format!("'{millis}' is out of range for a date"))
}

/// Scalar text for a provider value; arrays degrade to their primary element
fn scalar_text(value: &Value) -> Result<Option<String>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text.clone())),
        Value::Number(number) => Ok(Some(number.to_string())),
        Value::Bool(flag) => Ok(Some(flag.to_string())),
        Value::Array(_) => Ok(list_items(value)?.into_iter().next()),
        Value::Object(object) => object
            .get("value")
            .map_or(Ok(None), scalar_text),
    }
}

/// List items, primary entry first
fn list_items(value: &Value) -> Result<Vec<String>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => {
            let mut primary = Vec::new();
            let mut rest = Vec::new();
            for item in items {
                let is_primary = item
                    .get("primary")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let text = match item {
                    Value::Object(object) => match object.get("value") {
                        Some(inner) => scalar_text(inner)?,
                        None => None,
                    },
                    Value::Array(_) => return Err("nested arrays are not supported".to_string()),
                    scalar => scalar_text(scalar)?,
                };
                if let Some(text) = text {
                    if is_primary {
                        primary.push(text);
                    } else {
                        rest.push(text);
                    }
                }
            }
            primary.extend(rest);
            Ok(primary)
        }
        scalar => Ok(scalar_text(scalar)?.into_iter().collect()),
    }
}
