//! Services shared by the CLI and the API

mod store;
mod sync_service;

pub use store::{LocalWrite, RecordCommit, SyncStore};
pub use sync_service::{ConflictResolution, SyncService, SyncStatus};
