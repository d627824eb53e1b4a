//! Error types for crmsync-core

use thiserror::Error;

use crate::config::ConfigError;
use crate::mapping::MappingError;
use crate::providers::ProviderError;

/// Result type alias using crmsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in crmsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Field mapping configuration rejected
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// Provider call failed
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Connection cannot be synced in its current state
    #[error("Connection {0} is not active")]
    ConnectionInactive(String),

    /// Credential vault error
    #[error("Credential error: {0}")]
    Credential(String),

    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
}
