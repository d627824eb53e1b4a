//! Engine configuration loaded from the environment

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::util::is_http_url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// OAuth client registered with a provider
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for OAuthClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Cadence of the recurring jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub delta_sync: Duration,
    pub health_check: Duration,
    pub conflict_sweep: Duration,
    pub retry_sweep: Duration,
    pub log_cleanup: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            delta_sync: Duration::from_secs(15 * 60),
            health_check: Duration::from_secs(5 * 60),
            conflict_sweep: Duration::from_secs(60 * 60),
            retry_sweep: Duration::from_secs(60 * 60),
            log_cleanup: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Knobs read by the orchestrator during a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSettings {
    pub run_lock_ttl: Duration,
    /// Attempts per provider call for transient failures
    pub record_max_attempts: u32,
    /// First backoff step; doubled on each retry
    pub retry_base_delay: Duration,
    /// Total time a run may spend waiting out provider rate limits
    pub rate_limit_wait_budget: Duration,
    pub error_rate_threshold: f64,
    pub error_rate_min_sample: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            run_lock_ttl: Duration::from_secs(30 * 60),
            record_max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            rate_limit_wait_budget: Duration::from_secs(120),
            error_rate_threshold: 0.5,
            error_rate_min_sample: 20,
        }
    }
}

#[derive(Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub credentials_path: PathBuf,
    pub http_timeout: Duration,
    pub schedule: ScheduleConfig,
    pub run: RunSettings,
    pub log_retention: Duration,
    pub rate_limit_max_wait: Duration,
    pub retry_max_age: Duration,
    pub retry_sweep_limit: usize,
    pub health_failure_threshold: u32,
    pub conflict_stale_after: Duration,
    pub hubspot: Option<OAuthClient>,
    pub salesforce: Option<OAuthClient>,
    pub salesforce_login_url: String,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EngineConfig")
            .field("database_path", &self.database_path)
            .field("credentials_path", &self.credentials_path)
            .field("http_timeout", &self.http_timeout)
            .field("schedule", &self.schedule)
            .field("run", &self.run)
            .field("log_retention", &self.log_retention)
            .field("rate_limit_max_wait", &self.rate_limit_max_wait)
            .field("retry_max_age", &self.retry_max_age)
            .field("retry_sweep_limit", &self.retry_sweep_limit)
            .field("health_failure_threshold", &self.health_failure_threshold)
            .field("conflict_stale_after", &self.conflict_stale_after)
            .field("hubspot", &self.hubspot)
            .field("salesforce", &self.salesforce)
            .field("salesforce_login_url", &self.salesforce_login_url)
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("crmsync.db"),
            credentials_path: PathBuf::from("crmsync-credentials.json"),
            http_timeout: Duration::from_secs(30),
            schedule: ScheduleConfig::default(),
            run: RunSettings::default(),
            log_retention: Duration::from_secs(30 * 24 * 60 * 60),
            rate_limit_max_wait: Duration::from_secs(30),
            retry_max_age: Duration::from_secs(72 * 60 * 60),
            retry_sweep_limit: 200,
            health_failure_threshold: 3,
            conflict_stale_after: Duration::from_secs(24 * 60 * 60),
            hubspot: None,
            salesforce: None,
            salesforce_login_url: "https://login.salesforce.com".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_path = optional_trimmed(&lookup, "CRMSYNC_DATABASE_PATH")
            .map_or(defaults.database_path, PathBuf::from);
        let credentials_path = optional_trimmed(&lookup, "CRMSYNC_CREDENTIALS_PATH")
            .map_or(defaults.credentials_path, PathBuf::from);

        let http_timeout = secs(ranged(&lookup, "CRMSYNC_HTTP_TIMEOUT_SECS", 30, 1..=300)?);

        let schedule = ScheduleConfig {
            delta_sync: secs(ranged(&lookup, "CRMSYNC_DELTA_SYNC_INTERVAL_SECS", 900, 30..=86_400)?),
            health_check: secs(ranged(&lookup, "CRMSYNC_HEALTH_CHECK_INTERVAL_SECS", 300, 30..=86_400)?),
            conflict_sweep: secs(ranged(&lookup, "CRMSYNC_CONFLICT_SWEEP_INTERVAL_SECS", 3_600, 60..=86_400)?),
            retry_sweep: secs(ranged(&lookup, "CRMSYNC_RETRY_SWEEP_INTERVAL_SECS", 3_600, 60..=86_400)?),
            log_cleanup: secs(ranged(&lookup, "CRMSYNC_LOG_CLEANUP_INTERVAL_SECS", 86_400, 3_600..=604_800)?),
        };

        let log_retention_days: u64 = ranged(&lookup, "CRMSYNC_LOG_RETENTION_DAYS", 30, 1..=3_650)?;
        let run_lock_ttl = secs(ranged(&lookup, "CRMSYNC_RUN_LOCK_TTL_SECS", 1_800, 60..=86_400)?);
        let rate_limit_max_wait =
            Duration::from_millis(ranged(&lookup, "CRMSYNC_RATE_LIMIT_MAX_WAIT_MS", 30_000, 0..=600_000)?);
        let record_max_attempts: u32 = ranged(&lookup, "CRMSYNC_RECORD_MAX_ATTEMPTS", 3, 1..=10)?;
        let retry_max_age_hours: u64 = ranged(&lookup, "CRMSYNC_RETRY_MAX_AGE_HOURS", 72, 1..=720)?;
        let retry_sweep_limit: usize = ranged(&lookup, "CRMSYNC_RETRY_SWEEP_LIMIT", 200, 1..=10_000)?;
        let error_rate_threshold: f64 =
            ranged(&lookup, "CRMSYNC_ERROR_RATE_THRESHOLD", 0.5, 0.0..=1.0)?;
        let error_rate_min_sample: u32 = ranged(&lookup, "CRMSYNC_ERROR_RATE_MIN_SAMPLE", 20, 1..=10_000)?;
        let health_failure_threshold: u32 =
            ranged(&lookup, "CRMSYNC_HEALTH_FAILURE_THRESHOLD", 3, 1..=100)?;
        let conflict_stale_after =
            secs(ranged(&lookup, "CRMSYNC_CONFLICT_STALE_SECS", 86_400, 60..=2_592_000)?);

        let hubspot = oauth_client(&lookup, "HUBSPOT_CLIENT_ID", "HUBSPOT_CLIENT_SECRET")?;
        let salesforce = oauth_client(&lookup, "SALESFORCE_CLIENT_ID", "SALESFORCE_CLIENT_SECRET")?;
        let salesforce_login_url =
            value_or_default(&lookup, "SALESFORCE_LOGIN_URL", &defaults.salesforce_login_url)
                .trim_end_matches('/')
                .to_string();
        if !is_http_url(&salesforce_login_url) {
            return Err(ConfigError::Invalid(
                "SALESFORCE_LOGIN_URL must start with http:// or https://".to_string(),
            ));
        }

        Ok(Self {
            database_path,
            credentials_path,
            http_timeout,
            schedule,
            run: RunSettings {
                run_lock_ttl,
                record_max_attempts,
                error_rate_threshold,
                error_rate_min_sample,
                ..defaults.run
            },
            log_retention: secs(log_retention_days * 24 * 60 * 60),
            rate_limit_max_wait,
            retry_max_age: secs(retry_max_age_hours * 60 * 60),
            retry_sweep_limit,
            health_failure_threshold,
            conflict_stale_after,
            hubspot,
            salesforce,
            salesforce_login_url,
        })
    }
}

const fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn ranged<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Display,
{
    let describe = || format!("{name} must be in [{}, {}]", range.start(), range.end());
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid(describe()))?,
        None => default,
    };
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid(describe()))
    }
}

fn oauth_client(
    lookup: impl Fn(&str) -> Option<String>,
    id_var: &'static str,
    secret_var: &'static str,
) -> Result<Option<OAuthClient>, ConfigError> {
    match (optional_trimmed(&lookup, id_var), optional_trimmed(&lookup, secret_var)) {
        (None, None) => Ok(None),
        (Some(client_id), Some(client_secret)) => Ok(Some(OAuthClient {
            client_id,
            client_secret,
        })),
        (Some(_), None) => Err(ConfigError::MissingVar(secret_var)),
        (None, Some(_)) => Err(ConfigError::MissingVar(id_var)),
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        EngineConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.schedule, ScheduleConfig::default());
        assert_eq!(config.run.record_max_attempts, 3);
        assert_eq!(config.health_failure_threshold, 3);
        assert!(config.hubspot.is_none());
    }

    #[test]
    fn values_are_trimmed_and_range_checked() {
        let config = load(&[
            ("CRMSYNC_DELTA_SYNC_INTERVAL_SECS", " 60 "),
            ("CRMSYNC_ERROR_RATE_THRESHOLD", "0.25"),
            ("CRMSYNC_DATABASE_PATH", "/var/lib/crmsync.db"),
        ])
        .unwrap();
        assert_eq!(config.schedule.delta_sync, Duration::from_secs(60));
        assert!((config.run.error_rate_threshold - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.database_path, PathBuf::from("/var/lib/crmsync.db"));

        let err = load(&[("CRMSYNC_RECORD_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(err.to_string().contains("CRMSYNC_RECORD_MAX_ATTEMPTS"));
        let err = load(&[("CRMSYNC_ERROR_RATE_THRESHOLD", "two")]).unwrap_err();
        assert!(err.to_string().contains("CRMSYNC_ERROR_RATE_THRESHOLD"));
    }

    #[test]
    fn oauth_clients_need_both_halves() {
        let err = load(&[("HUBSPOT_CLIENT_ID", "abc")]).unwrap_err();
        assert!(err.to_string().contains("HUBSPOT_CLIENT_SECRET"));

        let err = load(&[("SALESFORCE_LOGIN_URL", "login.salesforce.com")]).unwrap_err();
        assert!(err.to_string().contains("SALESFORCE_LOGIN_URL"));
    }

    #[test]
    fn config_redacts_client_secrets() {
        let config = load(&[
            ("HUBSPOT_CLIENT_ID", "hub-id"),
            ("HUBSPOT_CLIENT_SECRET", "sensitive-hub-secret"),
            ("SALESFORCE_CLIENT_ID", "sf-id"),
            ("SALESFORCE_CLIENT_SECRET", "sensitive-sf-secret"),
        ])
        .unwrap();

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("hub-id"));
        assert!(!debug_output.contains("sensitive-hub-secret"));
        assert!(!debug_output.contains("sensitive-sf-secret"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
