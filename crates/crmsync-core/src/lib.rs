//! crmsync-core - Core library for crmsync
//!
//! This crate contains the contact sync engine shared by the CLI and the API
//! server: the host database layer, the provider adapters, field mapping,
//! conflict resolution, the run orchestrator and the recurring job scheduler.

pub mod config;
pub mod db;
pub mod error;
pub mod mapping;
pub mod models;
pub mod providers;
pub mod rate_limit;
pub mod services;
pub mod sync;
pub mod util;
pub mod webhooks;

pub use error::{Error, Result};
pub use models::{Connection, ConnectionId, Contact, ContactId, RunId};
