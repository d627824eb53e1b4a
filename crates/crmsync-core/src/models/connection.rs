//! Connection model

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::{ConnectionId, TenantId};
use super::remote::Checkpoint;

/// Supported CRM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    HubSpot,
    Salesforce,
    Pipedrive,
}

impl Provider {
    pub const ALL: [Self; 3] = [Self::HubSpot, Self::Salesforce, Self::Pipedrive];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HubSpot => "hubspot",
            Self::Salesforce => "salesforce",
            Self::Pipedrive => "pipedrive",
        }
    }

    /// Published throughput limits for each provider's API tier we target.
    pub const fn default_rate_limit(self) -> RateLimitConfig {
        match self {
            Self::HubSpot => RateLimitConfig {
                capacity: 100,
                refill_amount: 100,
                refill_interval_ms: 10_000,
                daily_limit: Some(250_000),
            },
            Self::Salesforce => RateLimitConfig {
                capacity: 20,
                refill_amount: 20,
                refill_interval_ms: 1_000,
                daily_limit: Some(10_000),
            },
            Self::Pipedrive => RateLimitConfig {
                capacity: 80,
                refill_amount: 80,
                refill_interval_ms: 2_000,
                daily_limit: None,
            },
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hubspot" => Ok(Self::HubSpot),
            "salesforce" => Ok(Self::Salesforce),
            "pipedrive" => Ok(Self::Pipedrive),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Lifecycle status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Active,
    Paused,
    Error,
    Disconnected,
}

impl ConnectionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "disconnected" => Ok(Self::Disconnected),
            other => Err(format!("unknown connection status: {other}")),
        }
    }
}

/// Tenant-configured policy for fields changed on both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    LocalWins,
    RemoteWins,
    #[default]
    NewestWins,
    Manual,
}

impl ConflictPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::NewestWins => "newest_wins",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "local_wins" => Ok(Self::LocalWins),
            "remote_wins" => Ok(Self::RemoteWins),
            "newest_wins" => Ok(Self::NewestWins),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// Field used to pair a remote record with an existing local contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NaturalKey {
    #[default]
    Email,
    Phone,
}

impl NaturalKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }
}

impl FromStr for NaturalKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "phone" => Ok(Self::Phone),
            other => Err(format!("unknown natural key: {other}")),
        }
    }
}

/// Token bucket parameters for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum burst size
    pub capacity: u32,
    /// Tokens added every refill interval
    pub refill_amount: u32,
    /// Refill interval in milliseconds
    pub refill_interval_ms: u64,
    /// Optional ceiling per UTC day, persisted across restarts
    #[serde(default)]
    pub daily_limit: Option<u32>,
}

impl RateLimitConfig {
    pub const fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }
}

/// A tenant's authorized link to one CRM provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub tenant_id: TenantId,
    pub provider: Provider,
    /// Opaque reference resolved by the credential vault
    pub credential_ref: String,
    pub status: ConnectionStatus,
    pub rate_limit: RateLimitConfig,
    pub conflict_policy: ConflictPolicy,
    pub natural_key: NaturalKey,
    /// How far remote delta fetching has progressed
    pub remote_checkpoint: Option<Checkpoint>,
    /// Local contacts updated at or after this time (unix ms) are re-read
    pub local_checkpoint: Option<i64>,
    /// Consecutive failed health probes
    pub health_failures: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Connection {
    /// Create an active connection with provider defaults
    #[must_use]
    pub fn new(tenant_id: TenantId, provider: Provider, credential_ref: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: ConnectionId::new(),
            tenant_id,
            provider,
            credential_ref: credential_ref.into(),
            status: ConnectionStatus::Active,
            rate_limit: provider.default_rate_limit(),
            conflict_policy: ConflictPolicy::default(),
            natural_key: NaturalKey::default(),
            remote_checkpoint: None,
            local_checkpoint: None,
            health_failures: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub const fn is_active(&self) -> bool {
        matches!(self.status, ConnectionStatus::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_roundtrips_through_str() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("zoho".parse::<Provider>().is_err());
    }

    #[test]
    fn conflict_policy_accepts_dashed_names() {
        assert_eq!(
            "newest-wins".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::NewestWins
        );
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::NewestWins);
    }

    #[test]
    fn new_connection_uses_provider_defaults() {
        let connection = Connection::new(TenantId::new(), Provider::Salesforce, "cred-1");
        assert!(connection.is_active());
        assert_eq!(connection.rate_limit.capacity, 20);
        assert_eq!(connection.rate_limit.daily_limit, Some(10_000));
        assert!(connection.remote_checkpoint.is_none());
    }
}
