use std::collections::HashMap;
use std::env;
use std::fmt;

use crmsync_core::config::{ConfigError, EngineConfig};

#[derive(Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Bearer token required on every `/v1` route except webhooks
    pub api_token: String,
    /// Shared secret webhook senders put in the URL or a header; webhooks
    /// are refused while unset
    pub webhook_secret: Option<String>,
    /// Host the recurring jobs in this process
    pub run_scheduler: bool,
    pub engine: EngineConfig,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ApiConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_token", &"[REDACTED]")
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("run_scheduler", &self.run_scheduler)
            .field("engine", &self.engine)
            .finish()
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = optional_trimmed(&lookup, "CRMSYNC_API_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let api_token = optional_trimmed(&lookup, "CRMSYNC_API_TOKEN")
            .ok_or(ConfigError::MissingVar("CRMSYNC_API_TOKEN"))?;
        if api_token.len() < 16 {
            return Err(ConfigError::Invalid(
                "CRMSYNC_API_TOKEN must be at least 16 characters".to_string(),
            ));
        }

        let webhook_secret = optional_trimmed(&lookup, "CRMSYNC_WEBHOOK_SECRET");
        if webhook_secret.as_ref().is_some_and(|secret| secret.len() < 16) {
            return Err(ConfigError::Invalid(
                "CRMSYNC_WEBHOOK_SECRET must be at least 16 characters".to_string(),
            ));
        }

        let run_scheduler = match optional_trimmed(&lookup, "CRMSYNC_API_RUN_SCHEDULER")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("1" | "true" | "yes") => true,
            Some("0" | "false" | "no") => false,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "CRMSYNC_API_RUN_SCHEDULER must be true or false, got '{other}'"
                )))
            }
        };

        Ok(Self {
            bind_addr,
            api_token,
            webhook_secret,
            run_scheduler,
            engine: EngineConfig::from_lookup(lookup)?,
        })
    }
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

    fn config_from(pairs: &[(&str, &str)]) -> Result<ApiConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        ApiConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_api_token() {
        let err = config_from(&[]).unwrap_err();
        assert!(err.to_string().contains("CRMSYNC_API_TOKEN"));

        let err = config_from(&[("CRMSYNC_API_TOKEN", "short")]).unwrap_err();
        assert!(err.to_string().contains("at least 16"));
    }

    #[test]
    fn config_defaults_and_scheduler_flag() {
        let config = config_from(&[("CRMSYNC_API_TOKEN", "0123456789abcdef")]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert!(config.run_scheduler);
        assert!(config.webhook_secret.is_none());

        let config = config_from(&[
            ("CRMSYNC_API_TOKEN", "0123456789abcdef"),
            ("CRMSYNC_API_RUN_SCHEDULER", "false"),
        ])
        .unwrap();
        assert!(!config.run_scheduler);

        assert!(config_from(&[
            ("CRMSYNC_API_TOKEN", "0123456789abcdef"),
            ("CRMSYNC_API_RUN_SCHEDULER", "sometimes"),
        ])
        .is_err());
    }

    #[test]
    fn config_redacts_secrets_in_debug() {
        let config = config_from(&[
            ("CRMSYNC_API_TOKEN", "sensitive-api-token"),
            ("CRMSYNC_WEBHOOK_SECRET", "sensitive-webhook-secret"),
        ])
        .unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-api-token"));
        assert!(!debug_output.contains("sensitive-webhook-secret"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
