//! Local contact model and the canonical, provider-independent representation

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::connection::NaturalKey;
use super::ids::{ContactId, TenantId};
use crate::util::{normalize_email, normalize_phone};

/// Prefix for tenant-defined custom fields in canonical paths
pub const CUSTOM_FIELD_PREFIX: &str = "custom.";

/// Allowed canonical lifecycle stages
pub const LIFECYCLE_STAGES: [&str; 8] = [
    "subscriber",
    "lead",
    "mql",
    "sql",
    "opportunity",
    "customer",
    "evangelist",
    "other",
];

/// Type of a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Date,
    List,
    Enum(&'static [&'static str]),
}

/// Resolve the kind of a canonical field path, or `None` for unknown paths.
pub fn canonical_kind(path: &str) -> Option<FieldKind> {
    match path {
        "first_name" | "last_name" | "email" | "company" | "job_title" => Some(FieldKind::Text),
        "phones" => Some(FieldKind::List),
        "birthday" => Some(FieldKind::Date),
        "lifecycle_stage" => Some(FieldKind::Enum(&LIFECYCLE_STAGES)),
        _ => path
            .strip_prefix(CUSTOM_FIELD_PREFIX)
            .filter(|key| !key.is_empty())
            .map(|_| FieldKind::Text),
    }
}

/// A typed canonical field value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Date(NaiveDate),
    List(Vec<String>),
    Enum(String),
}

impl FieldValue {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Collapse empty text and empty lists to `Null` so both sides compare equal.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Text(text) | Self::Enum(text) if text.is_empty() => Self::Null,
            Self::List(items) => {
                let items: Vec<String> = items.into_iter().filter(|item| !item.is_empty()).collect();
                if items.is_empty() {
                    Self::Null
                } else {
                    Self::List(items)
                }
            }
            other => other,
        }
    }

    pub fn from_text_option(value: Option<&str>) -> Self {
        value.map_or(Self::Null, |text| Self::Text(text.to_string()).normalized())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) | Self::Enum(text) => Some(text),
            _ => None,
        }
    }
}

/// Provider-independent contact: canonical field path → value.
///
/// Missing paths are equivalent to `Null`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalContact(BTreeMap<String, FieldValue>);

impl CanonicalContact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> FieldValue {
        self.0.get(path).cloned().unwrap_or(FieldValue::Null)
    }

    pub fn set(&mut self, path: impl Into<String>, value: FieldValue) {
        self.0.insert(path.into(), value.normalized());
    }

    #[must_use]
    pub fn with(mut self, path: impl Into<String>, value: FieldValue) -> Self {
        self.set(path, value);
        self
    }

    pub fn remove(&mut self, path: &str) -> Option<FieldValue> {
        self.0.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A contact row in the host platform database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub tenant_id: TenantId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phones: Vec<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub lifecycle_stage: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub custom_fields: BTreeMap<String, String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms), also the local version marker
    pub updated_at: i64,
    pub is_deleted: bool,
}

impl Contact {
    /// Create an empty contact for a tenant
    #[must_use]
    pub fn new(tenant_id: TenantId) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: ContactId::new(),
            tenant_id,
            first_name: None,
            last_name: None,
            email: None,
            phones: Vec::new(),
            company: None,
            job_title: None,
            lifecycle_stage: None,
            birthday: None,
            custom_fields: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            is_deleted: false,
        }
    }

    /// Read one canonical field
    pub fn field(&self, path: &str) -> FieldValue {
        match path {
            "first_name" => FieldValue::from_text_option(self.first_name.as_deref()),
            "last_name" => FieldValue::from_text_option(self.last_name.as_deref()),
            "email" => FieldValue::from_text_option(self.email.as_deref()),
            "company" => FieldValue::from_text_option(self.company.as_deref()),
            "job_title" => FieldValue::from_text_option(self.job_title.as_deref()),
            "phones" => FieldValue::List(self.phones.clone()).normalized(),
            "lifecycle_stage" => self
                .lifecycle_stage
                .clone()
                .map_or(FieldValue::Null, |stage| FieldValue::Enum(stage).normalized()),
            "birthday" => self.birthday.map_or(FieldValue::Null, FieldValue::Date),
            _ => path
                .strip_prefix(CUSTOM_FIELD_PREFIX)
                .and_then(|key| self.custom_fields.get(key))
                .map_or(FieldValue::Null, |value| {
                    FieldValue::Text(value.clone()).normalized()
                }),
        }
    }

    /// Canonical view restricted to the given paths
    pub fn to_canonical<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> CanonicalContact {
        let mut canonical = CanonicalContact::new();
        for path in paths {
            canonical.set(path, self.field(path));
        }
        canonical
    }

    /// Write one canonical field, rejecting values of the wrong kind.
    pub fn apply_field(&mut self, path: &str, value: FieldValue) -> Result<(), String> {
        let value = value.normalized();
        let text = |value: FieldValue| match value {
            FieldValue::Null => Ok(None),
            FieldValue::Text(text) => Ok(Some(text)),
            other => Err(format!("field '{path}' expects text, got {other:?}")),
        };

        match path {
            "first_name" => self.first_name = text(value)?,
            "last_name" => self.last_name = text(value)?,
            "email" => self.email = text(value)?,
            "company" => self.company = text(value)?,
            "job_title" => self.job_title = text(value)?,
            "phones" => {
                self.phones = match value {
                    FieldValue::Null => Vec::new(),
                    FieldValue::List(items) => items,
                    FieldValue::Text(single) => vec![single],
                    other => return Err(format!("field 'phones' expects a list, got {other:?}")),
                }
            }
            "lifecycle_stage" => {
                self.lifecycle_stage = match value {
                    FieldValue::Null => None,
                    FieldValue::Enum(stage) | FieldValue::Text(stage) => Some(stage),
                    other => {
                        return Err(format!(
                            "field 'lifecycle_stage' expects an enum, got {other:?}"
                        ))
                    }
                }
            }
            "birthday" => {
                self.birthday = match value {
                    FieldValue::Null => None,
                    FieldValue::Date(date) => Some(date),
                    other => return Err(format!("field 'birthday' expects a date, got {other:?}")),
                }
            }
            _ => {
                let key = path
                    .strip_prefix(CUSTOM_FIELD_PREFIX)
                    .filter(|key| !key.is_empty())
                    .ok_or_else(|| format!("unknown canonical field '{path}'"))?;
                match text(value)? {
                    Some(text) => {
                        self.custom_fields.insert(key.to_string(), text);
                    }
                    None => {
                        self.custom_fields.remove(key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Normalized values usable to pair this contact with a remote record
    pub fn natural_keys(&self, key: NaturalKey) -> Vec<String> {
        match key {
            NaturalKey::Email => self.email.as_deref().and_then(normalize_email).into_iter().collect(),
            NaturalKey::Phone => self.phones.iter().filter_map(|phone| normalize_phone(phone)).collect(),
        }
    }

    /// Display name for logs and CLI output
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() {
            self.email.clone().unwrap_or_else(|| self.id.to_string())
        } else {
            name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_kind_covers_builtins_and_custom_fields() {
        assert_eq!(canonical_kind("email"), Some(FieldKind::Text));
        assert_eq!(canonical_kind("phones"), Some(FieldKind::List));
        assert_eq!(canonical_kind("birthday"), Some(FieldKind::Date));
        assert_eq!(canonical_kind("custom.tier"), Some(FieldKind::Text));
        assert_eq!(canonical_kind("custom."), None);
        assert_eq!(canonical_kind("nickname"), None);
    }

    #[test]
    fn empty_values_normalize_to_null() {
        assert_eq!(FieldValue::Text(String::new()).normalized(), FieldValue::Null);
        assert_eq!(FieldValue::List(vec![String::new()]).normalized(), FieldValue::Null);
        assert_eq!(
            FieldValue::List(vec!["1".into(), String::new()]).normalized(),
            FieldValue::List(vec!["1".into()])
        );
    }

    #[test]
    fn apply_field_roundtrips_through_field() {
        let mut contact = Contact::new(TenantId::new());
        contact
            .apply_field("first_name", FieldValue::Text("Ada".into()))
            .unwrap();
        contact
            .apply_field(
                "birthday",
                FieldValue::Date(NaiveDate::from_ymd_opt(1815, 12, 10).unwrap()),
            )
            .unwrap();
        contact
            .apply_field("custom.tier", FieldValue::Text("gold".into()))
            .unwrap();

        assert_eq!(contact.field("first_name"), FieldValue::Text("Ada".into()));
        assert_eq!(contact.field("custom.tier"), FieldValue::Text("gold".into()));
        assert!(contact.field("last_name").is_null());

        contact.apply_field("custom.tier", FieldValue::Null).unwrap();
        assert!(contact.custom_fields.is_empty());
    }

    #[test]
    fn apply_field_rejects_wrong_kind() {
        let mut contact = Contact::new(TenantId::new());
        assert!(contact
            .apply_field("birthday", FieldValue::Text("soon".into()))
            .is_err());
        assert!(contact
            .apply_field("nickname", FieldValue::Text("x".into()))
            .is_err());
    }

    #[test]
    fn natural_keys_use_normalized_values() {
        let mut contact = Contact::new(TenantId::new());
        contact.email = Some(" Ada@Example.com".into());
        contact.phones = vec!["+44 20 7946 0958".into(), "12".into()];

        assert_eq!(contact.natural_keys(NaturalKey::Email), vec!["ada@example.com"]);
        assert_eq!(contact.natural_keys(NaturalKey::Phone), vec!["442079460958"]);
    }
}
