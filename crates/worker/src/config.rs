//! Worker configuration

use vidbill_billing::{BillingError, BillingResult};

const DEFAULT_SCHEDULE: &str = "0 0 2 1 * *";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Six-field cron expression (seconds first), evaluated in UTC
    pub schedule: String,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BillingResult<Self> {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BillingError::Config("DATABASE_URL not set".to_string()))?;

        let database_max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                BillingError::Config(format!("DATABASE_MAX_CONNECTIONS has invalid value {:?}", raw))
            })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let log_format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            database_url,
            database_max_connections,
            schedule: lookup("BILLING_SCHEDULE").unwrap_or_else(|| DEFAULT_SCHEDULE.to_string()),
            log_format,
        })
    }
}
