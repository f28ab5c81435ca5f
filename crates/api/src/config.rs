//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub json_logs: bool,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Payment collaborator callbacks
    pub payment_webhook_secret: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            json_logs: lookup("LOG_FORMAT")
                .map(|f| f.trim().eq_ignore_ascii_case("json"))
                .unwrap_or(false),

            // Database
            database_url: lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: lookup("DATABASE_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),

            payment_webhook_secret: {
                let secret = lookup("PAYMENT_WEBHOOK_SECRET")
                    .ok_or(ConfigError::Missing("PAYMENT_WEBHOOK_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "PAYMENT_WEBHOOK_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SECRET: &str = "test-webhook-secret-must-be-32-chars-long";

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_minimal_config() {
        let config = Config::from_lookup(vars(&[
            ("DATABASE_URL", "postgres://test"),
            ("PAYMENT_WEBHOOK_SECRET", SECRET),
        ]))
        .unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.database_max_connections, 20);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_missing_database_url() {
        let result = Config::from_lookup(vars(&[("PAYMENT_WEBHOOK_SECRET", SECRET)]));
        assert!(matches!(result, Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    fn test_weak_webhook_secret_rejected() {
        let result = Config::from_lookup(vars(&[
            ("DATABASE_URL", "postgres://test"),
            ("PAYMENT_WEBHOOK_SECRET", "short"),
        ]));
        assert!(matches!(result, Err(ConfigError::WeakSecret(_))));
    }
}
