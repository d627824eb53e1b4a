//! Field-level reconciliation of a local and a remote snapshot.
//!
//! A side "changed" a field when its value differs from the baseline both
//! sides agreed on at the last sync. A side that was not observed (no record,
//! or the field missing from its snapshot) counts as unchanged. Without a
//! baseline, only a non-null value counts as a change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mapping::FieldFlow;
use crate::models::{CanonicalContact, ConflictPolicy, ConflictStatus, FieldValue, SyncState};

/// One side's snapshot and its modification time (unix ms)
#[derive(Debug, Clone, Copy)]
pub struct Side<'a> {
    pub values: &'a CanonicalContact,
    pub modified_at: Option<i64>,
}

impl<'a> Side<'a> {
    pub const fn new(values: &'a CanonicalContact, modified_at: Option<i64>) -> Self {
        Self {
            values,
            modified_at,
        }
    }
}

/// What happened to one field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOutcome {
    /// Both sides hold the same value
    InSync,
    TookLocal,
    TookRemote,
    /// Left for an operator; nothing was written
    Conflict,
}

impl FieldOutcome {
    /// Status an open conflict on this field moves to, if any
    pub const fn closes_conflict_as(self) -> Option<ConflictStatus> {
        match self {
            Self::InSync => Some(ConflictStatus::ResolvedManual),
            Self::TookLocal => Some(ConflictStatus::ResolvedLocal),
            Self::TookRemote => Some(ConflictStatus::ResolvedRemote),
            Self::Conflict => None,
        }
    }
}

/// A divergence the `manual` policy refused to settle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDraft {
    pub field_path: String,
    pub local_value: FieldValue,
    pub local_modified_at: Option<i64>,
    pub remote_value: FieldValue,
    pub remote_modified_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// New baseline: the values both sides hold once the updates are applied
    pub merged: CanonicalContact,
    /// Fields to write to the local contact
    pub local_updates: CanonicalContact,
    /// Fields to push to the provider
    pub remote_updates: CanonicalContact,
    pub conflicts: Vec<ConflictDraft>,
    pub outcomes: BTreeMap<String, FieldOutcome>,
}

impl Resolution {
    pub fn is_noop(&self) -> bool {
        self.local_updates.is_empty() && self.remote_updates.is_empty() && self.conflicts.is_empty()
    }
}

enum Winner {
    Local,
    Remote,
    Undecided,
}

/// Reconcile `local` and `remote` field by field.
///
/// Pure: the caller persists the resolution.
pub fn resolve(
    fields: &[FieldFlow],
    local: Option<Side<'_>>,
    remote: Option<Side<'_>>,
    last_state: Option<&SyncState>,
    policy: ConflictPolicy,
) -> Resolution {
    let mut resolution = Resolution::default();
    let local_ts = local.and_then(|side| side.modified_at);
    let remote_ts = remote.and_then(|side| side.modified_at);

    for flow in fields {
        let path = flow.path.as_str();
        let baseline = last_state
            .filter(|state| state.baseline.contains(path))
            .map(|state| state.baseline.get(path));
        let observed_local = observe(local, path);
        let observed_remote = observe(remote, path);

        let local_value = current(observed_local.as_ref(), baseline.as_ref());
        let remote_value = current(observed_remote.as_ref(), baseline.as_ref());

        match (flow.pull, flow.push) {
            (true, true) => {
                let outcome = if local_value == remote_value {
                    FieldOutcome::InSync
                } else {
                    let local_changed = changed(observed_local.as_ref(), baseline.as_ref());
                    let remote_changed = changed(observed_remote.as_ref(), baseline.as_ref());
                    let winner = match (local_changed, remote_changed) {
                        (true, false) => Winner::Local,
                        (false, true) => Winner::Remote,
                        _ => apply_policy(policy, local_ts, remote_ts),
                    };
                    match winner {
                        Winner::Local => FieldOutcome::TookLocal,
                        Winner::Remote => FieldOutcome::TookRemote,
                        Winner::Undecided => FieldOutcome::Conflict,
                    }
                };

                match outcome {
                    FieldOutcome::InSync => resolution.merged.set(path, local_value),
                    FieldOutcome::TookLocal => {
                        resolution.remote_updates.set(path, local_value.clone());
                        resolution.merged.set(path, local_value);
                    }
                    FieldOutcome::TookRemote => {
                        resolution.local_updates.set(path, remote_value.clone());
                        resolution.merged.set(path, remote_value);
                    }
                    FieldOutcome::Conflict => {
                        if let Some(baseline) = baseline {
                            resolution.merged.set(path, baseline);
                        }
                        resolution.conflicts.push(ConflictDraft {
                            field_path: path.to_string(),
                            local_value,
                            local_modified_at: local_ts,
                            remote_value,
                            remote_modified_at: remote_ts,
                        });
                    }
                }
                resolution.outcomes.insert(path.to_string(), outcome);
            }
            (true, false) => {
                // Pull-only: the provider is authoritative
                let Some(remote_value) = observed_remote else {
                    if let Some(baseline) = baseline {
                        resolution.merged.set(path, baseline);
                    }
                    continue;
                };
                let outcome = if observed_local.as_ref() == Some(&remote_value) {
                    FieldOutcome::InSync
                } else if local.is_none() && remote_value.is_null() {
                    FieldOutcome::InSync
                } else {
                    resolution.local_updates.set(path, remote_value.clone());
                    FieldOutcome::TookRemote
                };
                resolution.merged.set(path, remote_value);
                resolution.outcomes.insert(path.to_string(), outcome);
            }
            (false, true) => {
                // Push-only: the provider value is never read back
                let Some(local_value) = observed_local else {
                    if let Some(baseline) = baseline {
                        resolution.merged.set(path, baseline);
                    }
                    continue;
                };
                let outcome = match &baseline {
                    Some(baseline) if *baseline == local_value => FieldOutcome::InSync,
                    None if local_value.is_null() => FieldOutcome::InSync,
                    _ => {
                        resolution.remote_updates.set(path, local_value.clone());
                        FieldOutcome::TookLocal
                    }
                };
                resolution.merged.set(path, local_value);
                resolution.outcomes.insert(path.to_string(), outcome);
            }
            (false, false) => {}
        }
    }

    resolution
}

fn observe(side: Option<Side<'_>>, path: &str) -> Option<FieldValue> {
    side.filter(|side| side.values.contains(path))
        .map(|side| side.values.get(path))
}

/// Observed value, else the baseline, else null
fn current(observed: Option<&FieldValue>, baseline: Option<&FieldValue>) -> FieldValue {
    observed
        .or(baseline)
        .cloned()
        .unwrap_or(FieldValue::Null)
}

fn changed(observed: Option<&FieldValue>, baseline: Option<&FieldValue>) -> bool {
    match (observed, baseline) {
        (None, _) => false,
        (Some(observed), None) => !observed.is_null(),
        (Some(observed), Some(baseline)) => observed != baseline,
    }
}

/// Ties and a missing remote timestamp go to local
fn apply_policy(policy: ConflictPolicy, local_ts: Option<i64>, remote_ts: Option<i64>) -> Winner {
    match policy {
        ConflictPolicy::LocalWins => Winner::Local,
        ConflictPolicy::RemoteWins => Winner::Remote,
        ConflictPolicy::Manual => Winner::Undecided,
        ConflictPolicy::NewestWins => match (local_ts, remote_ts) {
            (_, None) => Winner::Local,
            (None, Some(_)) => Winner::Remote,
            (Some(local), Some(remote)) if local >= remote => Winner::Local,
            (Some(_), Some(_)) => Winner::Remote,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionId, ContactId};
    use pretty_assertions::assert_eq;

    const T0: i64 = 1_700_000_000_000;

    fn flows(paths: &[&str]) -> Vec<FieldFlow> {
        paths
            .iter()
            .map(|path| FieldFlow {
                path: (*path).to_string(),
                pull: true,
                push: true,
            })
            .collect()
    }

    fn text(value: &str) -> FieldValue {
        FieldValue::Text(value.to_string())
    }

    fn contact(pairs: &[(&str, &str)]) -> CanonicalContact {
        pairs
            .iter()
            .fold(CanonicalContact::new(), |contact, (path, value)| {
                contact.with(*path, text(value))
            })
    }

    fn state(baseline: CanonicalContact) -> SyncState {
        let mut state = SyncState::new(ConnectionId::new(), ContactId::new());
        state.external_id = Some("101".into());
        state.baseline = baseline;
        state
    }

    /// Both sides edited the same field after the last sync
    fn both_changed(policy: ConflictPolicy, local_ts: i64, remote_ts: Option<i64>) -> Resolution {
        let base = state(contact(&[("email", "old@x.io")]));
        let local = contact(&[("email", "local@x.io")]);
        let remote = contact(&[("email", "remote@x.io")]);
        resolve(
            &flows(&["email"]),
            Some(Side::new(&local, Some(local_ts))),
            Some(Side::new(&remote, remote_ts)),
            Some(&base),
            policy,
        )
    }

    #[test]
    fn only_local_changed_pushes_for_every_policy() {
        let base = state(contact(&[("email", "old@x.io")]));
        let local = contact(&[("email", "new@x.io")]);
        let remote = contact(&[("email", "old@x.io")]);
        for policy in [
            ConflictPolicy::LocalWins,
            ConflictPolicy::RemoteWins,
            ConflictPolicy::NewestWins,
            ConflictPolicy::Manual,
        ] {
            let resolution = resolve(
                &flows(&["email"]),
                Some(Side::new(&local, Some(T0))),
                Some(Side::new(&remote, Some(T0 + 10))),
                Some(&base),
                policy,
            );
            assert_eq!(resolution.remote_updates.get("email"), text("new@x.io"));
            assert!(resolution.local_updates.is_empty());
            assert!(resolution.conflicts.is_empty());
            assert_eq!(resolution.merged.get("email"), text("new@x.io"));
        }
    }

    #[test]
    fn only_remote_changed_pulls_for_every_policy() {
        let base = state(contact(&[("email", "old@x.io")]));
        let local = contact(&[("email", "old@x.io")]);
        let remote = contact(&[("email", "new@x.io")]);
        for policy in [
            ConflictPolicy::LocalWins,
            ConflictPolicy::RemoteWins,
            ConflictPolicy::NewestWins,
            ConflictPolicy::Manual,
        ] {
            let resolution = resolve(
                &flows(&["email"]),
                Some(Side::new(&local, Some(T0 + 10))),
                Some(Side::new(&remote, Some(T0))),
                Some(&base),
                policy,
            );
            assert_eq!(resolution.local_updates.get("email"), text("new@x.io"));
            assert!(resolution.remote_updates.is_empty());
            assert_eq!(
                resolution.outcomes.get("email"),
                Some(&FieldOutcome::TookRemote)
            );
        }
    }

    #[test]
    fn equal_values_never_write() {
        let base = state(contact(&[("email", "old@x.io")]));
        let same = contact(&[("email", "both@x.io")]);
        let resolution = resolve(
            &flows(&["email"]),
            Some(Side::new(&same, Some(T0))),
            Some(Side::new(&same, Some(T0))),
            Some(&base),
            ConflictPolicy::Manual,
        );
        assert!(resolution.is_noop());
        assert_eq!(resolution.merged.get("email"), text("both@x.io"));
        assert_eq!(resolution.outcomes.get("email"), Some(&FieldOutcome::InSync));
    }

    #[test]
    fn both_changed_local_and_remote_wins() {
        let resolution = both_changed(ConflictPolicy::LocalWins, T0, Some(T0 + 1));
        assert_eq!(resolution.remote_updates.get("email"), text("local@x.io"));
        assert!(resolution.local_updates.is_empty());

        let resolution = both_changed(ConflictPolicy::RemoteWins, T0 + 1, Some(T0));
        assert_eq!(resolution.local_updates.get("email"), text("remote@x.io"));
        assert!(resolution.remote_updates.is_empty());
    }

    #[test]
    fn newest_wins_compares_timestamps() {
        let resolution = both_changed(ConflictPolicy::NewestWins, T0, Some(T0 + 1));
        assert_eq!(resolution.local_updates.get("email"), text("remote@x.io"));

        let resolution = both_changed(ConflictPolicy::NewestWins, T0 + 1, Some(T0));
        assert_eq!(resolution.remote_updates.get("email"), text("local@x.io"));
    }

    #[test]
    fn newest_wins_tie_and_missing_remote_time_go_local() {
        let tie = both_changed(ConflictPolicy::NewestWins, T0, Some(T0));
        assert_eq!(tie.remote_updates.get("email"), text("local@x.io"));

        let untimed = both_changed(ConflictPolicy::NewestWins, T0, None);
        assert_eq!(untimed.remote_updates.get("email"), text("local@x.io"));
    }

    #[test]
    fn manual_emits_draft_and_keeps_baseline() {
        let resolution = both_changed(ConflictPolicy::Manual, T0, Some(T0 + 5));
        assert!(resolution.local_updates.is_empty());
        assert!(resolution.remote_updates.is_empty());
        assert_eq!(resolution.merged.get("email"), text("old@x.io"));
        assert_eq!(
            resolution.conflicts,
            vec![ConflictDraft {
                field_path: "email".into(),
                local_value: text("local@x.io"),
                local_modified_at: Some(T0),
                remote_value: text("remote@x.io"),
                remote_modified_at: Some(T0 + 5),
            }]
        );
    }

    #[test]
    fn without_state_both_sides_count_as_changed() {
        let local = contact(&[("first_name", "Ada"), ("last_name", "Lovelace")]);
        let remote = contact(&[("first_name", "Augusta"), ("last_name", "Lovelace")]);
        let resolution = resolve(
            &flows(&["first_name", "last_name"]),
            Some(Side::new(&local, Some(T0))),
            Some(Side::new(&remote, Some(T0 + 1))),
            None,
            ConflictPolicy::Manual,
        );
        assert_eq!(resolution.conflicts.len(), 1);
        assert_eq!(resolution.conflicts[0].field_path, "first_name");
        assert!(!resolution.merged.contains("first_name"));
        assert_eq!(resolution.merged.get("last_name"), text("Lovelace"));
    }

    #[test]
    fn first_pairing_never_blanks_a_filled_field() {
        let local = contact(&[("first_name", "Ada")]).with("last_name", FieldValue::Null);
        let remote = contact(&[("first_name", "Ada"), ("last_name", "Lovelace")]);
        let resolution = resolve(
            &flows(&["first_name", "last_name"]),
            Some(Side::new(&local, Some(T0 + 1))),
            Some(Side::new(&remote, Some(T0))),
            None,
            ConflictPolicy::LocalWins,
        );
        assert_eq!(resolution.local_updates, contact(&[("last_name", "Lovelace")]));
        assert!(resolution.remote_updates.is_empty());
    }

    #[test]
    fn unobserved_remote_reads_as_baseline() {
        let base = state(contact(&[("email", "old@x.io"), ("company", "Acme")]));
        let local = contact(&[("email", "new@x.io"), ("company", "Acme")]);
        let resolution = resolve(
            &flows(&["email", "company"]),
            Some(Side::new(&local, Some(T0))),
            None,
            Some(&base),
            ConflictPolicy::Manual,
        );
        assert_eq!(resolution.remote_updates, contact(&[("email", "new@x.io")]));
        assert!(resolution.conflicts.is_empty());
    }

    #[test]
    fn new_remote_record_fills_an_absent_local() {
        let remote = contact(&[("first_name", "Grace"), ("email", "grace@x.io")]);
        let resolution = resolve(
            &flows(&["first_name", "email", "company"]),
            None,
            Some(Side::new(&remote, Some(T0))),
            None,
            ConflictPolicy::NewestWins,
        );
        assert_eq!(resolution.local_updates, remote);
        assert!(resolution.remote_updates.is_empty());
        assert_eq!(resolution.outcomes.get("company"), Some(&FieldOutcome::InSync));
    }

    #[test]
    fn pull_only_and_push_only_fields_flow_one_way() {
        let fields = vec![
            FieldFlow {
                path: "company".into(),
                pull: true,
                push: false,
            },
            FieldFlow {
                path: "custom.score".into(),
                pull: false,
                push: true,
            },
        ];
        let base = state(contact(&[("company", "Acme"), ("custom.score", "10")]));
        let local = contact(&[("company", "Local Co"), ("custom.score", "12")]);
        let remote = contact(&[("company", "Acme")]);

        let resolution = resolve(
            &fields,
            Some(Side::new(&local, Some(T0 + 1))),
            Some(Side::new(&remote, Some(T0))),
            Some(&base),
            ConflictPolicy::LocalWins,
        );
        assert_eq!(resolution.local_updates, contact(&[("company", "Acme")]));
        assert_eq!(resolution.remote_updates, contact(&[("custom.score", "12")]));
        assert!(resolution.conflicts.is_empty());
    }

    #[test]
    fn outcomes_close_conflicts() {
        assert_eq!(
            FieldOutcome::TookLocal.closes_conflict_as(),
            Some(ConflictStatus::ResolvedLocal)
        );
        assert_eq!(
            FieldOutcome::InSync.closes_conflict_as(),
            Some(ConflictStatus::ResolvedManual)
        );
        assert_eq!(FieldOutcome::Conflict.closes_conflict_as(), None);
    }
}
