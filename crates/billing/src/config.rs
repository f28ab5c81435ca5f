//! Billing engine configuration
//!
//! Environment variables:
//! - `BILLING_CATALOG_PATH`: plans and multipliers JSON file (optional)
//! - `BILLING_MAX_CONCURRENT_TENANTS`: tenants billed in parallel (default: 8)
//! - `PAYMENT_GATEWAY_URL`: payment collaborator base URL
//! - `PAYMENT_GATEWAY_API_KEY`: bearer token for the collaborator
//! - `PAYMENT_WEBHOOK_SECRET`: HMAC secret of status callbacks
//! - `PAYMENT_DISPATCH_MAX_RETRIES`: retries of transient failures (default: 3)
//! - `PAYMENT_DISPATCH_TIMEOUT_SECS`: per-request timeout (default: 10)

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

const DEFAULT_MAX_CONCURRENT_TENANTS: usize = 8;
const DEFAULT_DISPATCH_MAX_RETRIES: usize = 3;
const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 10;

/// Settings of a billing run
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub catalog_path: Option<PathBuf>,
    pub max_concurrent_tenants: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            max_concurrent_tenants: DEFAULT_MAX_CONCURRENT_TENANTS,
        }
    }
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BillingResult<Self> {
        let max_concurrent_tenants = parse_or(
            &lookup,
            "BILLING_MAX_CONCURRENT_TENANTS",
            DEFAULT_MAX_CONCURRENT_TENANTS,
        )?;
        if max_concurrent_tenants == 0 {
            return Err(BillingError::Config(
                "BILLING_MAX_CONCURRENT_TENANTS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            catalog_path: lookup("BILLING_CATALOG_PATH").map(PathBuf::from),
            max_concurrent_tenants,
        })
    }
}

/// Connection settings of the payment collaborator
#[derive(Debug, Clone)]
pub struct PaymentGatewayConfig {
    pub gateway_url: String,
    pub api_key: String,
    pub webhook_secret: String,
    pub max_retries: usize,
    pub timeout: Duration,
}

impl PaymentGatewayConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BillingResult<Self> {
        let gateway_url = required(&lookup, "PAYMENT_GATEWAY_URL")?;
        Ok(Self {
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            api_key: required(&lookup, "PAYMENT_GATEWAY_API_KEY")?,
            webhook_secret: required(&lookup, "PAYMENT_WEBHOOK_SECRET")?,
            max_retries: parse_or(&lookup, "PAYMENT_DISPATCH_MAX_RETRIES", DEFAULT_DISPATCH_MAX_RETRIES)?,
            timeout: Duration::from_secs(parse_or(
                &lookup,
                "PAYMENT_DISPATCH_TIMEOUT_SECS",
                DEFAULT_DISPATCH_TIMEOUT_SECS,
            )?),
        })
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> BillingResult<String> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BillingError::Config(format!("{} not set", key)))
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> BillingResult<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has invalid value {:?}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_billing_defaults() {
        let config = BillingConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config.max_concurrent_tenants, 8);
        assert!(config.catalog_path.is_none());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let result = BillingConfig::from_lookup(vars(&[("BILLING_MAX_CONCURRENT_TENANTS", "0")]));
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[test]
    fn test_gateway_config() {
        let config = PaymentGatewayConfig::from_lookup(vars(&[
            ("PAYMENT_GATEWAY_URL", "https://payments.internal/"),
            ("PAYMENT_GATEWAY_API_KEY", "key"),
            ("PAYMENT_WEBHOOK_SECRET", "secret"),
            ("PAYMENT_DISPATCH_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.gateway_url, "https://payments.internal");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_gateway_config_requires_secret() {
        let result = PaymentGatewayConfig::from_lookup(vars(&[
            ("PAYMENT_GATEWAY_URL", "https://payments.internal"),
            ("PAYMENT_GATEWAY_API_KEY", "key"),
        ]));
        match result {
            Err(BillingError::Config(msg)) => assert!(msg.contains("PAYMENT_WEBHOOK_SECRET")),
            other => panic!("expected config error, got {:?}", other),
        }
    }
}
