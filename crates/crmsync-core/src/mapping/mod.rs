//! Field mapping between canonical contacts and provider records
//!
//! A connection's mapping set is a list of [`FieldMapping`] rows made of
//! platform defaults plus tenant overrides. The set is validated once, when it
//! is saved; at sync time [`to_canonical`] and [`to_remote`] only report
//! per-field errors and never reject a record.

pub mod coerce;
mod transform;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{canonical_kind, CanonicalContact, Provider, RemoteRecord};

pub use transform::{Flow, Transform};

/// Rejected mapping configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("unknown local field path '{0}'")]
    UnknownLocalField(String),

    #[error("unknown transform '{0}'")]
    UnknownTransform(String),

    #[error("remote field key must not be empty (local field '{0}')")]
    EmptyRemoteKey(String),

    #[error("local field '{local_path}' is pulled from several remote fields: {}", remote_keys.join(", "))]
    DuplicatePullTarget {
        local_path: String,
        remote_keys: Vec<String>,
    },

    #[error("remote field '{remote_key}' is pushed from several local fields: {}", local_paths.join(", "))]
    DuplicatePushTarget {
        remote_key: String,
        local_paths: Vec<String>,
    },
}

/// Direction a mapping participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Push,
    Pull,
    Bidirectional,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Bidirectional => "bidirectional",
        }
    }

    pub const fn pulls(self) -> bool {
        matches!(self, Self::Pull | Self::Bidirectional)
    }

    pub const fn pushes(self) -> bool {
        matches!(self, Self::Push | Self::Bidirectional)
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            "bidirectional" | "both" => Ok(Self::Bidirectional),
            other => Err(format!("unknown mapping direction: {other}")),
        }
    }
}

/// Where a mapping row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingOrigin {
    PlatformDefault,
    #[default]
    TenantOverride,
}

impl MappingOrigin {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlatformDefault => "platform_default",
            Self::TenantOverride => "tenant_override",
        }
    }
}

impl FromStr for MappingOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform_default" => Ok(Self::PlatformDefault),
            "tenant_override" => Ok(Self::TenantOverride),
            other => Err(format!("unknown mapping origin: {other}")),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

/// One field mapping row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Canonical field path (`email`, `custom.tier`)
    pub local_path: String,
    /// Provider property name
    pub remote_key: String,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(default)]
    pub origin: MappingOrigin,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl FieldMapping {
    pub fn new(
        local_path: impl Into<String>,
        remote_key: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            remote_key: remote_key.into(),
            direction,
            transform: None,
            origin: MappingOrigin::TenantOverride,
            enabled: true,
        }
    }

    #[must_use]
    pub const fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    #[must_use]
    pub const fn platform_default(mut self) -> Self {
        self.origin = MappingOrigin::PlatformDefault;
        self
    }

    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// How a provider spells dates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateStyle {
    /// Epoch milliseconds at UTC midnight
    EpochMillis,
    /// `YYYY-MM-DD`
    IsoDate,
}

/// Provider value conventions used while coercing fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderProfile {
    pub date_style: DateStyle,
    /// Provider fields that hold arrays of `{value, primary}` entries
    pub multi_valued: &'static [&'static str],
}

impl ProviderProfile {
    pub const fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::HubSpot => Self {
                date_style: DateStyle::EpochMillis,
                multi_valued: &[],
            },
            Provider::Salesforce => Self {
                date_style: DateStyle::IsoDate,
                multi_valued: &[],
            },
            Provider::Pipedrive => Self {
                date_style: DateStyle::IsoDate,
                multi_valued: &["email", "phone"],
            },
        }
    }

    pub fn is_multi_valued(&self, remote_key: &str) -> bool {
        self.multi_valued.contains(&remote_key)
    }
}

/// Per-field problem found while mapping one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A mapped value together with the fields that had to be skipped
#[derive(Debug, Clone, PartialEq)]
pub struct Mapped<T> {
    pub value: T,
    pub errors: Vec<FieldError>,
}

/// Whether a canonical field can flow in each direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFlow {
    pub path: String,
    pub pull: bool,
    pub push: bool,
}

/// A connection's mapping rows with override precedence applied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingSet {
    rows: Vec<FieldMapping>,
    effective: Vec<FieldMapping>,
}

impl MappingSet {
    /// Validate a mapping set before it is saved
    pub fn validate(rows: Vec<FieldMapping>) -> Result<Self, MappingError> {
        for row in &rows {
            if canonical_kind(&row.local_path).is_none() {
                return Err(MappingError::UnknownLocalField(row.local_path.clone()));
            }
            if row.remote_key.trim().is_empty() {
                return Err(MappingError::EmptyRemoteKey(row.local_path.clone()));
            }
        }

        let set = Self::from_stored(rows);

        let mut pull_sources: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut push_sources: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for mapping in &set.effective {
            if mapping.direction.pulls() {
                pull_sources
                    .entry(mapping.local_path.as_str())
                    .or_default()
                    .insert(mapping.remote_key.as_str());
            }
            if mapping.direction.pushes() {
                push_sources
                    .entry(mapping.remote_key.as_str())
                    .or_default()
                    .insert(mapping.local_path.as_str());
            }
        }

        if let Some((local_path, remote_keys)) =
            pull_sources.iter().find(|(_, sources)| sources.len() > 1)
        {
            return Err(MappingError::DuplicatePullTarget {
                local_path: (*local_path).to_string(),
                remote_keys: remote_keys.iter().map(ToString::to_string).collect(),
            });
        }
        if let Some((remote_key, local_paths)) =
            push_sources.iter().find(|(_, sources)| sources.len() > 1)
        {
            return Err(MappingError::DuplicatePushTarget {
                remote_key: (*remote_key).to_string(),
                local_paths: local_paths.iter().map(ToString::to_string).collect(),
            });
        }

        Ok(set)
    }

    /// Build from rows already validated when they were saved
    pub fn from_stored(rows: Vec<FieldMapping>) -> Self {
        let overridden: HashSet<&str> = rows
            .iter()
            .filter(|row| row.origin == MappingOrigin::TenantOverride)
            .map(|row| row.remote_key.as_str())
            .collect();

        let effective = rows
            .iter()
            .filter(|row| {
                row.origin == MappingOrigin::TenantOverride
                    || !overridden.contains(row.remote_key.as_str())
            })
            .filter(|row| row.enabled)
            .cloned()
            .collect();

        Self { rows, effective }
    }

    /// All stored rows, including shadowed defaults and disabled rows
    pub fn rows(&self) -> &[FieldMapping] {
        &self.rows
    }

    /// Rows that take part in mapping
    pub fn effective(&self) -> &[FieldMapping] {
        &self.effective
    }

    pub fn is_empty(&self) -> bool {
        self.effective.is_empty()
    }

    /// Remote properties to request when fetching records
    pub fn remote_properties(&self) -> Vec<String> {
        let keys: BTreeSet<&str> = self
            .effective
            .iter()
            .filter(|mapping| mapping.direction.pulls())
            .map(|mapping| mapping.remote_key.as_str())
            .collect();
        keys.into_iter().map(str::to_string).collect()
    }

    /// Canonical paths any effective mapping touches
    pub fn local_paths(&self) -> Vec<String> {
        self.field_flows().into_iter().map(|flow| flow.path).collect()
    }

    /// Per canonical field, whether it is pulled and/or pushed
    pub fn field_flows(&self) -> Vec<FieldFlow> {
        let mut flows: BTreeMap<&str, FieldFlow> = BTreeMap::new();
        for mapping in &self.effective {
            let flow = flows
                .entry(mapping.local_path.as_str())
                .or_insert_with(|| FieldFlow {
                    path: mapping.local_path.clone(),
                    pull: false,
                    push: false,
                });
            flow.pull |= mapping.direction.pulls();
            flow.push |= mapping.direction.pushes();
        }
        flows.into_values().collect()
    }
}

/// Map a provider record into the canonical shape.
///
/// Only pull and bidirectional mappings take part. Fields whose remote key is
/// absent from the record are left out; fields that fail coercion or their
/// transform are left out and reported.
pub fn to_canonical(
    remote: &RemoteRecord,
    mappings: &MappingSet,
    _profile: &ProviderProfile,
) -> Mapped<CanonicalContact> {
    let mut canonical = CanonicalContact::new();
    let mut errors = Vec::new();

    for mapping in mappings.effective().iter().filter(|m| m.direction.pulls()) {
        let Some(raw) = remote.properties.get(&mapping.remote_key) else {
            continue;
        };
        let Some(kind) = canonical_kind(&mapping.local_path) else {
            continue;
        };

        let result = coerce::decode(raw, kind)
            .and_then(|value| match mapping.transform {
                Some(transform) => transform.apply(value, Flow::Pull),
                None => Ok(value),
            })
            .and_then(|value| coerce::check(value, kind));

        match result {
            Ok(value) => canonical.set(mapping.local_path.clone(), value),
            Err(message) => errors.push(FieldError {
                field: mapping.local_path.clone(),
                message: format!("{} (pull): {message}", mapping.remote_key),
            }),
        }
    }

    Mapped {
        value: canonical,
        errors,
    }
}

/// Map canonical fields onto provider properties.
///
/// Only push and bidirectional mappings take part, and only for fields present
/// in `canonical`, so callers can send a partial update.
pub fn to_remote(
    canonical: &CanonicalContact,
    mappings: &MappingSet,
    profile: &ProviderProfile,
) -> Mapped<RemoteRecord> {
    let mut record = RemoteRecord::default();
    let mut errors = Vec::new();

    for mapping in mappings.effective().iter().filter(|m| m.direction.pushes()) {
        if !canonical.contains(&mapping.local_path) {
            continue;
        }
        let value = canonical.get(&mapping.local_path);
        let transformed = match mapping.transform {
            Some(transform) => transform.apply(value, Flow::Push),
            None => Ok(value),
        };

        match transformed {
            Ok(value) => {
                let encoded = coerce::encode(
                    &value,
                    profile.is_multi_valued(&mapping.remote_key),
                    profile.date_style,
                );
                record.properties.insert(mapping.remote_key.clone(), encoded);
            }
            Err(message) => errors.push(FieldError {
                field: mapping.local_path.clone(),
                message: format!("{} (push): {message}", mapping.remote_key),
            }),
        }
    }

    Mapped {
        value: record,
        errors,
    }
}

/// Canonical values as the provider would echo them back after a push.
///
/// Only fields mapped in both directions are rewritten; a value the round trip
/// cannot reproduce keeps its original form. Comparing local values in this
/// form keeps lossy transforms (lowercasing, list collapse) from reading as a
/// change on every run.
pub fn round_trip(
    canonical: &CanonicalContact,
    mappings: &MappingSet,
    profile: &ProviderProfile,
) -> CanonicalContact {
    let pushed = to_remote(canonical, mappings, profile).value;
    let pulled = to_canonical(&pushed, mappings, profile).value;

    let mut echoed = canonical.clone();
    for flow in mappings.field_flows() {
        if flow.pull && flow.push && canonical.contains(&flow.path) && pulled.contains(&flow.path)
        {
            echoed.set(flow.path.clone(), pulled.get(&flow.path));
        }
    }
    echoed
}

/// Platform default mappings for a provider's standard contact fields
pub fn default_mappings(provider: Provider) -> Vec<FieldMapping> {
    use Direction::{Bidirectional, Pull};

    let rows = match provider {
        Provider::HubSpot => vec![
            FieldMapping::new("first_name", "firstname", Bidirectional),
            FieldMapping::new("last_name", "lastname", Bidirectional),
            FieldMapping::new("email", "email", Bidirectional).with_transform(Transform::Lowercase),
            FieldMapping::new("phones", "phone", Bidirectional),
            FieldMapping::new("company", "company", Bidirectional),
            FieldMapping::new("job_title", "jobtitle", Bidirectional),
            FieldMapping::new("lifecycle_stage", "lifecyclestage", Bidirectional)
                .with_transform(Transform::HubSpotLifecycleStage),
            FieldMapping::new("birthday", "date_of_birth", Bidirectional),
        ],
        Provider::Salesforce => vec![
            FieldMapping::new("first_name", "FirstName", Bidirectional),
            FieldMapping::new("last_name", "LastName", Bidirectional),
            FieldMapping::new("email", "Email", Bidirectional).with_transform(Transform::Lowercase),
            FieldMapping::new("phones", "Phone", Bidirectional),
            FieldMapping::new("job_title", "Title", Bidirectional),
            FieldMapping::new("birthday", "Birthdate", Bidirectional),
        ],
        Provider::Pipedrive => vec![
            FieldMapping::new("first_name", "first_name", Bidirectional),
            FieldMapping::new("last_name", "last_name", Bidirectional),
            FieldMapping::new("email", "email", Bidirectional).with_transform(Transform::Lowercase),
            FieldMapping::new("phones", "phone", Bidirectional),
            FieldMapping::new("company", "org_name", Pull),
            FieldMapping::new("job_title", "job_title", Bidirectional),
        ],
    };

    rows.into_iter().map(FieldMapping::platform_default).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldValue;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn hubspot() -> (MappingSet, ProviderProfile) {
        (
            MappingSet::validate(default_mappings(Provider::HubSpot)).unwrap(),
            ProviderProfile::for_provider(Provider::HubSpot),
        )
    }

    #[test]
    fn default_mappings_validate_for_every_provider() {
        for provider in Provider::ALL {
            let set = MappingSet::validate(default_mappings(provider)).unwrap();
            assert!(!set.is_empty());
            assert!(set.local_paths().contains(&"email".to_string()));
        }
    }

    #[test]
    fn validate_rejects_unknown_local_field() {
        let rows = vec![FieldMapping::new("nickname", "nick", Direction::Pull)];
        assert_eq!(
            MappingSet::validate(rows),
            Err(MappingError::UnknownLocalField("nickname".into()))
        );
    }

    #[test]
    fn validate_rejects_duplicate_pull_and_push_targets() {
        let rows = vec![
            FieldMapping::new("phones", "phone", Direction::Pull),
            FieldMapping::new("phones", "mobilephone", Direction::Bidirectional),
        ];
        assert!(matches!(
            MappingSet::validate(rows),
            Err(MappingError::DuplicatePullTarget { local_path, .. }) if local_path == "phones"
        ));

        let rows = vec![
            FieldMapping::new("company", "company", Direction::Push),
            FieldMapping::new("custom.org", "company", Direction::Push),
        ];
        assert!(matches!(
            MappingSet::validate(rows),
            Err(MappingError::DuplicatePushTarget { remote_key, .. }) if remote_key == "company"
        ));
    }

    #[test]
    fn pull_and_push_of_different_fields_do_not_collide() {
        let rows = vec![
            FieldMapping::new("phones", "phone", Direction::Pull),
            FieldMapping::new("phones", "mobilephone", Direction::Push),
        ];
        assert!(MappingSet::validate(rows).is_ok());
    }

    #[test]
    fn tenant_override_replaces_default_for_remote_field() {
        let mut rows = default_mappings(Provider::HubSpot);
        rows.push(FieldMapping::new("custom.role", "jobtitle", Direction::Pull));
        rows.push(FieldMapping::new("company", "company", Direction::Pull).disabled());

        let set = MappingSet::validate(rows).unwrap();
        let jobtitle: Vec<_> = set
            .effective()
            .iter()
            .filter(|m| m.remote_key == "jobtitle")
            .collect();
        assert_eq!(jobtitle.len(), 1);
        assert_eq!(jobtitle[0].local_path, "custom.role");
        assert!(set.effective().iter().all(|m| m.remote_key != "company"));
    }

    #[test]
    fn to_canonical_ignores_unmapped_and_reports_bad_fields() {
        let (set, profile) = hubspot();
        let remote = RemoteRecord::new(Some("101".into()))
            .with_property("firstname", json!("Ada"))
            .with_property("email", json!("ADA@Example.com"))
            .with_property("lifecyclestage", json!("marketingqualifiedlead"))
            .with_property("date_of_birth", json!("not a date"))
            .with_property("hs_object_source", json!("API"));

        let mapped = to_canonical(&remote, &set, &profile);
        assert_eq!(mapped.value.get("first_name"), FieldValue::Text("Ada".into()));
        assert_eq!(mapped.value.get("email"), FieldValue::Text("ada@example.com".into()));
        assert_eq!(mapped.value.get("lifecycle_stage"), FieldValue::Enum("mql".into()));
        assert!(!mapped.value.contains("birthday"));
        assert!(!mapped.value.contains("last_name"));
        assert_eq!(mapped.errors.len(), 1);
        assert_eq!(mapped.errors[0].field, "birthday");
    }

    #[test]
    fn to_remote_only_sends_present_push_fields() {
        let (set, profile) = hubspot();
        let canonical = CanonicalContact::new()
            .with("last_name", FieldValue::Text("Lovelace".into()))
            .with("birthday", FieldValue::Date(NaiveDate::from_ymd_opt(1990, 1, 2).unwrap()));

        let mapped = to_remote(&canonical, &set, &profile);
        assert!(mapped.errors.is_empty());
        assert_eq!(mapped.value.properties.len(), 2);
        assert_eq!(mapped.value.properties["lastname"], json!("Lovelace"));
        assert_eq!(mapped.value.properties["date_of_birth"], json!(631_238_400_000_i64));
    }

    #[test]
    fn roundtrip_per_field_type() {
        let (set, profile) = hubspot();
        let canonical = CanonicalContact::new()
            .with("first_name", FieldValue::Text("Ada".into()))
            .with("lifecycle_stage", FieldValue::Enum("customer".into()))
            .with("birthday", FieldValue::Date(NaiveDate::from_ymd_opt(1815, 12, 10).unwrap()))
            .with("phones", FieldValue::List(vec!["+1 555".into(), "+44 20".into()]));

        let remote = to_remote(&canonical, &set, &profile).value;
        let back = to_canonical(&remote, &set, &profile).value;

        assert_eq!(back.get("first_name"), canonical.get("first_name"));
        assert_eq!(back.get("lifecycle_stage"), canonical.get("lifecycle_stage"));
        assert_eq!(back.get("birthday"), canonical.get("birthday"));
        // HubSpot `phone` is single-valued: the list degrades to its first element
        assert_eq!(back.get("phones"), FieldValue::List(vec!["+1 555".into()]));
    }

    #[test]
    fn round_trip_applies_push_then_pull_transforms() {
        let (set, profile) = hubspot();
        let canonical = CanonicalContact::new()
            .with("email", FieldValue::Text("Ada@Example.COM".into()))
            .with("phones", FieldValue::List(vec!["111".into(), "222".into()]))
            .with("lifecycle_stage", FieldValue::Enum("mql".into()))
            .with("custom.tier", FieldValue::Text("gold".into()));

        let echoed = round_trip(&canonical, &set, &profile);
        assert_eq!(echoed.get("email"), FieldValue::Text("ada@example.com".into()));
        assert_eq!(echoed.get("phones"), FieldValue::List(vec!["111".into()]));
        assert_eq!(echoed.get("lifecycle_stage"), FieldValue::Enum("mql".into()));
        // Unmapped fields pass through untouched
        assert_eq!(echoed.get("custom.tier"), FieldValue::Text("gold".into()));
    }

    #[test]
    fn multi_valued_fields_keep_every_item() {
        let set = MappingSet::validate(default_mappings(Provider::Pipedrive)).unwrap();
        let profile = ProviderProfile::for_provider(Provider::Pipedrive);
        let canonical = CanonicalContact::new()
            .with("phones", FieldValue::List(vec!["111".into(), "222".into()]));

        let remote = to_remote(&canonical, &set, &profile).value;
        let back = to_canonical(&remote, &set, &profile).value;
        assert_eq!(back.get("phones"), canonical.get("phones"));
    }
}
