//! Value transforms applied while mapping a field

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::MappingError;
use crate::models::FieldValue;

/// HubSpot internal lifecycle stage values paired with their canonical names
const HUBSPOT_LIFECYCLE_STAGES: [(&str, &str); 8] = [
    ("subscriber", "subscriber"),
    ("lead", "lead"),
    ("marketingqualifiedlead", "mql"),
    ("salesqualifiedlead", "sql"),
    ("opportunity", "opportunity"),
    ("customer", "customer"),
    ("evangelist", "evangelist"),
    ("other", "other"),
];

/// Which way a value is flowing through a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Remote value on its way into the canonical contact
    Pull,
    /// Canonical value on its way to the provider
    Push,
}

/// Transformation applied to a mapped value.
///
/// Stored and configured by identifier (`"phone_e164"`); unknown identifiers
/// are rejected when a mapping set is saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Transform {
    Lowercase,
    Uppercase,
    Trim,
    /// Normalize phone numbers to `+<country><number>`
    PhoneE164,
    /// Translate between HubSpot's internal stage values and canonical stages
    HubSpotLifecycleStage,
}

impl Transform {
    pub const ALL: [Self; 5] = [
        Self::Lowercase,
        Self::Uppercase,
        Self::Trim,
        Self::PhoneE164,
        Self::HubSpotLifecycleStage,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lowercase => "lowercase",
            Self::Uppercase => "uppercase",
            Self::Trim => "trim",
            Self::PhoneE164 => "phone_e164",
            Self::HubSpotLifecycleStage => "hubspot_lifecycle_stage",
        }
    }

    /// Apply the transform; a failure skips only the affected field.
    pub fn apply(self, value: FieldValue, flow: Flow) -> Result<FieldValue, String> {
        match self {
            Self::Lowercase => map_text(value, |text| Ok(text.to_lowercase())),
            Self::Uppercase => map_text(value, |text| Ok(text.to_uppercase())),
            Self::Trim => map_text(value, |text| Ok(text.trim().to_string())),
            Self::PhoneE164 => map_text(value, phone_e164),
            Self::HubSpotLifecycleStage => map_text(value, |stage| lifecycle_stage(&stage, flow)),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transform {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let identifier = s.trim();
        Self::ALL
            .into_iter()
            .find(|transform| transform.as_str().eq_ignore_ascii_case(identifier))
            .ok_or_else(|| MappingError::UnknownTransform(identifier.to_string()))
    }
}

impl TryFrom<String> for Transform {
    type Error = MappingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Transform> for String {
    fn from(value: Transform) -> Self {
        value.as_str().to_string()
    }
}

/// Apply a text operation to scalar text values and to each list item
fn map_text<F>(value: FieldValue, op: F) -> Result<FieldValue, String>
where
    F: Fn(String) -> Result<String, String>,
{
    let mapped = match value {
        FieldValue::Text(text) => FieldValue::Text(op(text)?),
        FieldValue::Enum(text) => FieldValue::Enum(op(text)?),
        FieldValue::List(items) => FieldValue::List(
            items
                .into_iter()
                .map(&op)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        other @ (FieldValue::Null | FieldValue::Date(_)) => other,
    };
    Ok(mapped.normalized())
}

fn phone_e164(raw: String) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }

    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    let digits = if trimmed.starts_with('+') {
        digits
    } else if let Some(international) = digits.strip_prefix("00") {
        international.to_string()
    } else {
        digits
    };

    if (8..=15).contains(&digits.len()) && !digits.starts_with('0') {
        Ok(format!("+{digits}"))
    } else {
        Err(format!("'{raw}' is not a valid international phone number"))
    }
}

fn lifecycle_stage(stage: &str, flow: Flow) -> Result<String, String> {
    let stage = stage.trim().to_ascii_lowercase();
    if stage.is_empty() {
        return Ok(stage);
    }
    HUBSPOT_LIFECYCLE_STAGES
        .iter()
        .find_map(|(hubspot, canonical)| match flow {
            Flow::Pull if *hubspot == stage => Some((*canonical).to_string()),
            Flow::Push if *canonical == stage => Some((*hubspot).to_string()),
            _ => None,
        })
        .ok_or_else(|| format!("unknown lifecycle stage '{stage}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_parse_and_reject_unknown() {
        for transform in Transform::ALL {
            assert_eq!(transform.as_str().parse::<Transform>().unwrap(), transform);
        }
        assert_eq!(
            "reverse".parse::<Transform>(),
            Err(MappingError::UnknownTransform("reverse".into()))
        );
    }

    #[test]
    fn serde_uses_identifiers() {
        let json = serde_json::to_string(&Transform::PhoneE164).unwrap();
        assert_eq!(json, "\"phone_e164\"");
        assert!(serde_json::from_str::<Transform>("\"shout\"").is_err());
    }

    #[test]
    fn text_transforms_apply_to_lists() {
        let value = FieldValue::List(vec![" A ".into(), "b".into()]);
        assert_eq!(
            Transform::Uppercase.apply(value.clone(), Flow::Pull).unwrap(),
            FieldValue::List(vec![" A ".into(), "B".into()])
        );
        assert_eq!(
            Transform::Trim.apply(value, Flow::Push).unwrap(),
            FieldValue::List(vec!["A".into(), "b".into()])
        );
    }

    #[test]
    fn phone_e164_normalizes_and_rejects() {
        let apply = |raw: &str| Transform::PhoneE164.apply(FieldValue::Text(raw.into()), Flow::Pull);
        assert_eq!(apply("+44 20 7946 0958").unwrap(), FieldValue::Text("+442079460958".into()));
        assert_eq!(apply("0044 20 7946 0958").unwrap(), FieldValue::Text("+442079460958".into()));
        assert!(apply("555-01").is_err());
    }

    #[test]
    fn hubspot_lifecycle_stage_maps_both_ways() {
        let pulled = Transform::HubSpotLifecycleStage
            .apply(FieldValue::Enum("marketingqualifiedlead".into()), Flow::Pull)
            .unwrap();
        assert_eq!(pulled, FieldValue::Enum("mql".into()));

        let pushed = Transform::HubSpotLifecycleStage
            .apply(FieldValue::Enum("sql".into()), Flow::Push)
            .unwrap();
        assert_eq!(pushed, FieldValue::Enum("salesqualifiedlead".into()));

        assert!(Transform::HubSpotLifecycleStage
            .apply(FieldValue::Enum("prospect".into()), Flow::Pull)
            .is_err());
    }
}
