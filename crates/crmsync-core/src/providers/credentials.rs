//! Provider credentials and the vault they are kept in.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use super::{ProviderError, ProviderHttp};
use crate::config::OAuthClient;
use crate::error::{Error, Result};
use crate::models::Connection;

const EXPIRY_SKEW_SECONDS: i64 = 60;

/// Access material for one connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// OAuth access token, or the static API token for token-based providers
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry as unix seconds; `None` for tokens that do not expire
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Per-org API host (Salesforce)
    #[serde(default)]
    pub instance_url: Option<String>,
}

impl Credential {
    pub fn api_token(token: impl Into<String>) -> Self {
        Self {
            access_token: token.into(),
            refresh_token: None,
            expires_at: None,
            instance_url: None,
        }
    }

    /// True when the token is expired or expires within the skew window
    #[must_use]
    pub fn needs_refresh(&self, now_secs: i64) -> bool {
        self.access_token.trim().is_empty()
            || self
                .expires_at
                .is_some_and(|expires_at| expires_at <= now_secs + EXPIRY_SKEW_SECONDS)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

/// Storage for credentials, addressed by a connection's credential reference
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn load(&self, reference: &str) -> Result<Option<Credential>>;
    async fn store(&self, reference: &str, credential: &Credential) -> Result<()>;
}

/// Vault backed by a JSON file mapping reference to credential
pub struct FileCredentialVault {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, Credential>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|error| {
                Error::Credential(format!(
                    "failed to parse {}: {error}",
                    self.path.display()
                ))
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl CredentialVault for FileCredentialVault {
    async fn load(&self, reference: &str) -> Result<Option<Credential>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(reference))
    }

    async fn store(&self, reference: &str, credential: &Credential) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(reference.to_string(), credential.clone());

        let contents = serde_json::to_vec_pretty(&all)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_private(&path, &contents))
            .await
            .map_err(|error| Error::Credential(format!("vault write task failed: {error}")))??;
        Ok(())
    }
}

/// Replace the vault file atomically with an owner-only, synced copy
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut file = NamedTempFile::new_in(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;

    // Make the rename itself durable
    #[cfg(unix)]
    std::fs::File::open(parent)?.sync_all()?;
    Ok(())
}

/// In-memory vault for tests and embedding
#[derive(Default)]
pub struct MemoryCredentialVault {
    credentials: Mutex<HashMap<String, Credential>>,
}

impl MemoryCredentialVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialVault for MemoryCredentialVault {
    async fn load(&self, reference: &str) -> Result<Option<Credential>> {
        Ok(self.credentials.lock().await.get(reference).cloned())
    }

    async fn store(&self, reference: &str, credential: &Credential) -> Result<()> {
        self.credentials
            .lock()
            .await
            .insert(reference.to_string(), credential.clone());
        Ok(())
    }
}

/// Load the stored OAuth credential and refresh it when it is about to expire.
///
/// Refreshed credentials are written back to the vault before returning.
pub(crate) async fn authenticate_oauth(
    http: &ProviderHttp,
    vault: &dyn CredentialVault,
    connection: &Connection,
    client: Option<&OAuthClient>,
    token_url: &str,
) -> std::result::Result<Credential, ProviderError> {
    let stored = load_credential(vault, connection).await?;
    if !stored.needs_refresh(chrono::Utc::now().timestamp()) {
        return Ok(stored);
    }

    let client = client.ok_or_else(|| {
        ProviderError::Auth(format!(
            "{} OAuth client is not configured; cannot refresh",
            connection.provider
        ))
    })?;
    let refreshed = http
        .refresh_oauth(connection, token_url, client, &stored)
        .await?;
    vault
        .store(&connection.credential_ref, &refreshed)
        .await
        .map_err(|error| ProviderError::Transient(format!("failed to persist credential: {error}")))?;
    tracing::info!(
        connection_id = %connection.id,
        provider = %connection.provider,
        "Refreshed provider access token"
    );
    Ok(refreshed)
}

/// Stored credential for a connection; a missing entry is an auth failure
pub(crate) async fn load_credential(
    vault: &dyn CredentialVault,
    connection: &Connection,
) -> std::result::Result<Credential, ProviderError> {
    vault
        .load(&connection.credential_ref)
        .await
        .map_err(|error| ProviderError::Transient(format!("credential vault unavailable: {error}")))?
        .ok_or_else(|| {
            ProviderError::Auth(format!(
                "no credential stored under '{}'",
                connection.credential_ref
            ))
        })
}
