//! Per-record sync bookkeeping

use serde::{Deserialize, Serialize};

use super::contact::CanonicalContact;
use super::ids::{ConflictId, ConnectionId, ContactId};

/// Pairing of one local contact with its remote counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub connection_id: ConnectionId,
    pub local_id: ContactId,
    /// Remote id; cleared when the remote record disappears
    pub external_id: Option<String>,
    /// Local `updated_at` (unix ms) observed at the last successful sync
    pub local_version: i64,
    /// Remote modification time (unix ms) observed at the last successful sync
    pub remote_version: Option<i64>,
    pub last_synced_at: i64,
    /// Set when the remote record disappeared and the pairing was cleared
    pub unlinked_at: Option<i64>,
    /// Field values both sides agreed on at the last successful sync
    pub baseline: CanonicalContact,
    pub open_conflict_id: Option<ConflictId>,
}

impl SyncState {
    /// Fresh state for a newly paired record
    pub fn new(connection_id: ConnectionId, local_id: ContactId) -> Self {
        Self {
            connection_id,
            local_id,
            external_id: None,
            local_version: 0,
            remote_version: None,
            last_synced_at: 0,
            unlinked_at: None,
            baseline: CanonicalContact::new(),
            open_conflict_id: None,
        }
    }

    pub const fn is_linked(&self) -> bool {
        self.external_id.is_some()
    }

    /// Clear the remote pairing while keeping the row and its baseline
    pub fn unlink(&mut self, at: i64) {
        self.external_id = None;
        self.unlinked_at = Some(at);
    }
}
