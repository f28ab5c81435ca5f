//! Plan configuration: included limits, overage rates and the billing catalog
//!
//! Everything here is validated when it is loaded, so a malformed tier list
//! or a negative limit is rejected long before a billing run touches it.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vidbill_shared::{MetricType, PlanTier, TenantId};

use crate::error::{BillingError, BillingResult};
use crate::multiplier::UsageMultiplier;

/// Included allowances of a subscription plan.
/// A limit of 0 means "no included allowance", never "unlimited".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanLimits {
    pub storage_limit_bytes: i64,
    pub bandwidth_limit_bytes: i64,
    pub video_limit: i64,
    pub user_limit: i64,
    pub api_calls_limit: i64,
}

impl PlanLimits {
    /// Raw included allowance for a metric, in the metric's raw unit
    pub fn limit_for(&self, metric: MetricType) -> i64 {
        match metric {
            MetricType::Storage => self.storage_limit_bytes,
            MetricType::Bandwidth => self.bandwidth_limit_bytes,
            MetricType::VideoCount => self.video_limit,
            MetricType::UserCount => self.user_limit,
            MetricType::ApiCalls => self.api_calls_limit,
            // Plans carry no view allowance
            MetricType::Views => 0,
        }
    }

    pub fn validate(&self) -> BillingResult<()> {
        for metric in MetricType::ALL {
            let limit = self.limit_for(metric);
            if limit < 0 {
                return Err(BillingError::InvalidBillingConfiguration(format!(
                    "negative {} limit: {}",
                    metric, limit
                )));
            }
        }
        Ok(())
    }
}

/// One slice of a graduated rate. `up_to` is the upper bound of the slice
/// measured in overage units; the last tier is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateTier {
    #[serde(default)]
    pub up_to: Option<Decimal>,
    pub price_per_unit: Decimal,
}

/// Price of usage beyond the included limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverageRate {
    Flat { unit_price: Decimal },
    Tiered { tiers: Vec<RateTier> },
}

impl OverageRate {
    pub fn flat(unit_price: Decimal) -> Self {
        OverageRate::Flat { unit_price }
    }

    /// Build a tiered rate from `(upper_bound, price)` pairs; the last
    /// pair's bound is ignored because the final tier is unbounded.
    pub fn tiered(tiers: impl IntoIterator<Item = (Option<Decimal>, Decimal)>) -> Self {
        OverageRate::Tiered {
            tiers: tiers
                .into_iter()
                .map(|(up_to, price_per_unit)| RateTier {
                    up_to,
                    price_per_unit,
                })
                .collect(),
        }
    }

    /// Reject negative prices, empty tier lists, missing or non-increasing bounds
    pub fn validate(&self) -> BillingResult<()> {
        match self {
            OverageRate::Flat { unit_price } => {
                if unit_price.is_sign_negative() && !unit_price.is_zero() {
                    return Err(BillingError::InvalidBillingConfiguration(format!(
                        "negative flat unit price: {}",
                        unit_price
                    )));
                }
                Ok(())
            }
            OverageRate::Tiered { tiers } => {
                if tiers.is_empty() {
                    return Err(BillingError::InvalidBillingConfiguration(
                        "tiered rate has no tiers".to_string(),
                    ));
                }

                let last = tiers.len() - 1;
                let mut previous = Decimal::ZERO;
                for (index, tier) in tiers.iter().enumerate() {
                    if tier.price_per_unit < Decimal::ZERO {
                        return Err(BillingError::InvalidBillingConfiguration(format!(
                            "tier {} has negative price {}",
                            index, tier.price_per_unit
                        )));
                    }
                    match tier.up_to {
                        Some(bound) if bound <= previous => {
                            return Err(BillingError::InvalidBillingConfiguration(format!(
                                "tier {} upper bound {} does not exceed previous bound {}",
                                index, bound, previous
                            )));
                        }
                        Some(bound) => previous = bound,
                        None if index != last => {
                            return Err(BillingError::InvalidBillingConfiguration(format!(
                                "tier {} is unbounded but is not the last tier",
                                index
                            )));
                        }
                        None => {}
                    }
                }
                Ok(())
            }
        }
    }
}

/// Subscription plan as configured by the back office
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub plan_id: String,
    pub name: String,
    pub tier: PlanTier,
    pub base_price: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub limits: PlanLimits,
    /// Metrics without a rate are never billed
    #[serde(default)]
    pub overage_rates: BTreeMap<MetricType, OverageRate>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl PlanConfig {
    pub fn validate(&self) -> BillingResult<()> {
        if self.base_price < Decimal::ZERO {
            return Err(BillingError::InvalidBillingConfiguration(format!(
                "plan {} has negative base price {}",
                self.plan_id, self.base_price
            )));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::InvalidBillingConfiguration(format!(
                "plan {} has invalid currency code {:?}",
                self.plan_id, self.currency
            )));
        }
        self.limits.validate()?;
        for (metric, rate) in &self.overage_rates {
            rate.validate().map_err(|e| {
                BillingError::InvalidBillingConfiguration(format!(
                    "plan {} {} rate: {}",
                    self.plan_id, metric, e
                ))
            })?;
        }
        Ok(())
    }
}

/// Tenant attributes the billing engine needs; owned by the tenant service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantProfile {
    pub tenant_id: TenantId,
    /// `None` when the tenant never subscribed
    pub plan_id: Option<String>,
    pub region: Option<String>,
}

/// Plans and multipliers loaded together from one configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingCatalog {
    #[serde(default)]
    pub plans: Vec<PlanConfig>,
    #[serde(default)]
    pub multipliers: Vec<UsageMultiplier>,
}

impl BillingCatalog {
    /// Parse and validate a catalog document
    pub fn from_json(json: &str) -> BillingResult<Self> {
        let catalog: BillingCatalog = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog file from disk
    pub fn load(path: impl AsRef<Path>) -> BillingResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Config(format!("Failed to read catalog {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_json(&json)?;

        tracing::info!(
            path = %path.display(),
            plans = catalog.plans.len(),
            multipliers = catalog.multipliers.len(),
            "Loaded billing catalog"
        );

        Ok(catalog)
    }

    pub fn validate(&self) -> BillingResult<()> {
        let mut plan_ids = HashSet::new();
        for plan in &self.plans {
            if !plan_ids.insert(plan.plan_id.as_str()) {
                return Err(BillingError::InvalidBillingConfiguration(format!(
                    "duplicate plan id {}",
                    plan.plan_id
                )));
            }
            plan.validate()?;
        }

        let mut multiplier_ids = HashSet::new();
        for multiplier in &self.multipliers {
            if !multiplier_ids.insert(multiplier.id) {
                return Err(BillingError::InvalidBillingConfiguration(format!(
                    "duplicate multiplier id {}",
                    multiplier.id
                )));
            }
            multiplier.validate()?;
        }
        Ok(())
    }

    pub fn plan(&self, plan_id: &str) -> Option<&PlanConfig> {
        self.plans.iter().find(|p| p.plan_id == plan_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bandwidth_tiers() -> OverageRate {
        OverageRate::tiered([(Some(dec!(50)), dec!(0.05)), (None, dec!(0.03))])
    }

    #[test]
    fn test_example_catalog_is_valid() {
        let catalog =
            BillingCatalog::from_json(include_str!("../../../config/billing_catalog.example.json"))
                .unwrap();
        assert_eq!(catalog.plans.len(), 3);
        assert_eq!(catalog.multipliers.len(), 2);

        let pro = catalog.plan("pro").unwrap();
        assert_eq!(pro.base_price, dec!(49));
        assert_eq!(pro.overage_rates.get(&MetricType::Bandwidth), Some(&bandwidth_tiers()));
        assert!(catalog.plan("free").unwrap().overage_rates.is_empty());
    }

    #[test]
    fn test_valid_tiered_rate() {
        assert!(bandwidth_tiers().validate().is_ok());
    }

    #[test]
    fn test_last_tier_bound_is_optional() {
        let rate = OverageRate::tiered([(Some(dec!(10)), dec!(1)), (Some(dec!(20)), dec!(0.5))]);
        assert!(rate.validate().is_ok());
    }

    #[test]
    fn test_non_monotonic_tiers_are_rejected() {
        let rate = OverageRate::tiered([
            (Some(dec!(50)), dec!(0.05)),
            (Some(dec!(50)), dec!(0.04)),
            (None, dec!(0.03)),
        ]);
        assert!(matches!(
            rate.validate(),
            Err(BillingError::InvalidBillingConfiguration(_))
        ));
    }

    #[test]
    fn test_zero_first_bound_is_rejected() {
        let rate = OverageRate::tiered([(Some(dec!(0)), dec!(0.05)), (None, dec!(0.03))]);
        assert!(rate.validate().is_err());
    }

    #[test]
    fn test_unbounded_middle_tier_is_rejected() {
        let rate = OverageRate::tiered([(None, dec!(0.05)), (Some(dec!(10)), dec!(0.03))]);
        assert!(rate.validate().is_err());
    }

    #[test]
    fn test_empty_and_negative_rates_are_rejected() {
        assert!(OverageRate::Tiered { tiers: vec![] }.validate().is_err());
        assert!(OverageRate::flat(dec!(-0.01)).validate().is_err());
        assert!(OverageRate::tiered([(None, dec!(-1))]).validate().is_err());
    }

    #[test]
    fn test_negative_limit_is_rejected() {
        let limits = PlanLimits {
            video_limit: -1,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
        assert_eq!(PlanLimits::default().limit_for(MetricType::Views), 0);
    }

    #[test]
    fn test_catalog_from_json() {
        let json = r#"{
            "plans": [{
                "plan_id": "pro",
                "name": "Professional",
                "tier": "professional",
                "base_price": "49.00",
                "limits": {
                    "storage_limit_bytes": 100000000000,
                    "bandwidth_limit_bytes": 500000000000,
                    "video_limit": 1000,
                    "user_limit": 10,
                    "api_calls_limit": 100000
                },
                "overage_rates": {
                    "storage": {"type": "flat", "unit_price": "0.10"},
                    "bandwidth": {"type": "tiered", "tiers": [
                        {"up_to": "50", "price_per_unit": "0.05"},
                        {"price_per_unit": "0.03"}
                    ]}
                }
            }],
            "multipliers": [{
                "id": "7d8e1f5c-2f4b-4f59-9a51-3b8f3f7c1a10",
                "metric": "storage",
                "multiplier": 0.8,
                "conditions": [{"kind": "region_in", "regions": ["eu-west"]}]
            }]
        }"#;

        let catalog = BillingCatalog::from_json(json).unwrap();
        let plan = catalog.plan("pro").unwrap();
        assert_eq!(plan.currency, "USD");
        assert_eq!(plan.base_price, dec!(49));
        assert_eq!(
            plan.overage_rates.get(&MetricType::Storage),
            Some(&OverageRate::flat(dec!(0.10)))
        );
        assert_eq!(catalog.multipliers.len(), 1);
        assert!(catalog.multipliers[0].active);
    }

    #[test]
    fn test_catalog_rejects_unknown_condition_kind() {
        let json = r#"{
            "multipliers": [{
                "id": "7d8e1f5c-2f4b-4f59-9a51-3b8f3f7c1a10",
                "metric": "storage",
                "multiplier": 0.8,
                "conditions": [{"kind": "customer_name_like", "pattern": "acme%"}]
            }]
        }"#;
        assert!(matches!(
            BillingCatalog::from_json(json),
            Err(BillingError::InvalidBillingConfiguration(_))
        ));
    }

    #[test]
    fn test_catalog_rejects_malformed_tiers() {
        let json = r#"{
            "plans": [{
                "plan_id": "pro",
                "name": "Professional",
                "tier": "professional",
                "base_price": "49.00",
                "limits": {
                    "storage_limit_bytes": 0,
                    "bandwidth_limit_bytes": 0,
                    "video_limit": 0,
                    "user_limit": 0,
                    "api_calls_limit": 0
                },
                "overage_rates": {
                    "bandwidth": {"type": "tiered", "tiers": [
                        {"up_to": "80", "price_per_unit": "0.05"},
                        {"up_to": "50", "price_per_unit": "0.04"},
                        {"price_per_unit": "0.03"}
                    ]}
                }
            }]
        }"#;
        assert!(BillingCatalog::from_json(json).is_err());
    }
}
