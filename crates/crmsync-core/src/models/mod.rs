//! Data models for crmsync

mod conflict;
mod connection;
mod contact;
mod failed_record;
mod ids;
mod remote;
mod sync_run;
mod sync_state;

pub use conflict::{Conflict, ConflictChoice, ConflictStatus};
pub use connection::{
    ConflictPolicy, Connection, ConnectionStatus, NaturalKey, Provider, RateLimitConfig,
};
pub use contact::{
    canonical_kind, CanonicalContact, Contact, FieldKind, FieldValue, CUSTOM_FIELD_PREFIX,
    LIFECYCLE_STAGES,
};
pub use failed_record::{record_key, FailedRecord, FailedRecordStatus};
pub use ids::{ConflictId, ConnectionId, ContactId, RunId, TenantId};
pub use remote::{Checkpoint, RemoteChangeEvent, RemoteRecord};
pub use sync_run::{
    RecordErrorKind, RunCounts, RunErrorEntry, RunMode, RunStatus, RunTrigger, SyncRun,
};
pub use sync_state::SyncState;
