//! Conditional usage multipliers
//!
//! A multiplier scales a tenant's raw usage of one metric before the plan
//! limit is subtracted (regional discounts, partner deals, and so on).
//! At most one active multiplier may match a tenant for a given metric;
//! more than one is a configuration error and billing stops for that tenant.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vidbill_shared::{MetricType, PlanTier, TenantId};

use crate::error::{BillingError, BillingResult};

/// Predicate over tenant attributes. Unknown kinds are rejected when the
/// configuration is deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MultiplierCondition {
    PlanTierEquals { tier: PlanTier },
    RegionIn { regions: Vec<String> },
    TenantIn { tenants: Vec<TenantId> },
}

impl MultiplierCondition {
    pub fn matches(&self, tenant: &TenantAttributes) -> bool {
        match self {
            MultiplierCondition::PlanTierEquals { tier } => tenant.plan_tier == *tier,
            MultiplierCondition::RegionIn { regions } => match &tenant.region {
                Some(region) => regions.iter().any(|r| r.eq_ignore_ascii_case(region)),
                None => false,
            },
            MultiplierCondition::TenantIn { tenants } => tenants.contains(&tenant.tenant_id),
        }
    }
}

/// Configured scaling factor for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMultiplier {
    pub id: Uuid,
    pub metric: MetricType,
    pub multiplier: f64,
    /// All must hold; empty matches every tenant
    #[serde(default)]
    pub conditions: Vec<MultiplierCondition>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_active() -> bool {
    true
}

impl UsageMultiplier {
    pub fn validate(&self) -> BillingResult<()> {
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(BillingError::InvalidBillingConfiguration(format!(
                "multiplier {} for {} must be positive and finite, got {}",
                self.id, self.metric, self.multiplier
            )));
        }
        Ok(())
    }

    pub fn applies_to(&self, tenant: &TenantAttributes, metric: MetricType) -> bool {
        self.active
            && self.metric == metric
            && self.conditions.iter().all(|c| c.matches(tenant))
    }
}

/// Tenant attributes multiplier conditions are evaluated against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantAttributes {
    pub tenant_id: TenantId,
    pub plan_tier: PlanTier,
    pub region: Option<String>,
}

/// Picks the single multiplier that applies to a tenant and metric
#[derive(Debug, Clone, Default)]
pub struct MultiplierResolver {
    multipliers: Vec<UsageMultiplier>,
}

impl MultiplierResolver {
    pub fn new(multipliers: Vec<UsageMultiplier>) -> BillingResult<Self> {
        for multiplier in &multipliers {
            multiplier.validate()?;
        }
        Ok(Self { multipliers })
    }

    /// Multiplier for `(tenant, metric)`, 1.0 when nothing matches.
    /// Two or more matches fail closed with `AmbiguousMultiplier`.
    pub fn resolve(&self, tenant: &TenantAttributes, metric: MetricType) -> BillingResult<f64> {
        let matched: Vec<&UsageMultiplier> = self
            .multipliers
            .iter()
            .filter(|m| m.applies_to(tenant, metric))
            .collect();

        match matched.as_slice() {
            [] => Ok(1.0),
            [only] => {
                tracing::debug!(
                    tenant_id = %tenant.tenant_id,
                    metric = %metric,
                    multiplier_id = %only.id,
                    multiplier = only.multiplier,
                    "Applying usage multiplier"
                );
                Ok(only.multiplier)
            }
            _ => {
                let ids: Vec<Uuid> = matched.iter().map(|m| m.id).collect();
                tracing::error!(
                    tenant_id = %tenant.tenant_id,
                    metric = %metric,
                    matched = ?ids,
                    "Ambiguous usage multiplier configuration"
                );
                Err(BillingError::AmbiguousMultiplier {
                    tenant_id: tenant.tenant_id,
                    metric,
                    matched: ids,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(region: Option<&str>) -> TenantAttributes {
        TenantAttributes {
            tenant_id: TenantId::new(),
            plan_tier: PlanTier::Professional,
            region: region.map(str::to_string),
        }
    }

    fn multiplier(
        metric: MetricType,
        value: f64,
        conditions: Vec<MultiplierCondition>,
    ) -> UsageMultiplier {
        UsageMultiplier {
            id: Uuid::new_v4(),
            metric,
            multiplier: value,
            conditions,
            active: true,
            description: None,
        }
    }

    #[test]
    fn test_no_match_defaults_to_one() {
        let resolver = MultiplierResolver::new(vec![multiplier(
            MetricType::Bandwidth,
            0.5,
            vec![MultiplierCondition::RegionIn {
                regions: vec!["ap-south".into()],
            }],
        )])
        .unwrap();

        let t = tenant(Some("eu-west"));
        assert_eq!(resolver.resolve(&t, MetricType::Bandwidth).unwrap(), 1.0);
        assert_eq!(resolver.resolve(&t, MetricType::Storage).unwrap(), 1.0);
    }

    #[test]
    fn test_single_match() {
        let resolver = MultiplierResolver::new(vec![multiplier(
            MetricType::Storage,
            0.8,
            vec![
                MultiplierCondition::RegionIn {
                    regions: vec!["EU-WEST".into()],
                },
                MultiplierCondition::PlanTierEquals {
                    tier: PlanTier::Professional,
                },
            ],
        )])
        .unwrap();

        assert_eq!(
            resolver
                .resolve(&tenant(Some("eu-west")), MetricType::Storage)
                .unwrap(),
            0.8
        );
        // Missing region never satisfies a region condition
        assert_eq!(resolver.resolve(&tenant(None), MetricType::Storage).unwrap(), 1.0);
    }

    #[test]
    fn test_conditions_are_anded() {
        let t = tenant(Some("eu-west"));
        let m = multiplier(
            MetricType::Views,
            2.0,
            vec![
                MultiplierCondition::TenantIn {
                    tenants: vec![t.tenant_id],
                },
                MultiplierCondition::PlanTierEquals {
                    tier: PlanTier::Enterprise,
                },
            ],
        );
        assert!(!m.applies_to(&t, MetricType::Views));
    }

    #[test]
    fn test_inactive_multiplier_never_matches() {
        let mut m = multiplier(MetricType::ApiCalls, 3.0, vec![]);
        m.active = false;
        let resolver = MultiplierResolver::new(vec![m]).unwrap();
        assert_eq!(resolver.resolve(&tenant(None), MetricType::ApiCalls).unwrap(), 1.0);
    }

    #[test]
    fn test_two_matches_fail_closed() {
        let a = multiplier(MetricType::Bandwidth, 0.5, vec![]);
        let b = multiplier(
            MetricType::Bandwidth,
            0.7,
            vec![MultiplierCondition::PlanTierEquals {
                tier: PlanTier::Professional,
            }],
        );
        let ids = vec![a.id, b.id];
        let resolver = MultiplierResolver::new(vec![a, b]).unwrap();

        match resolver.resolve(&tenant(None), MetricType::Bandwidth) {
            Err(BillingError::AmbiguousMultiplier { matched, metric, .. }) => {
                assert_eq!(matched, ids);
                assert_eq!(metric, MetricType::Bandwidth);
            }
            other => panic!("expected AmbiguousMultiplier, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_multipliers_are_rejected() {
        for value in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = MultiplierResolver::new(vec![multiplier(MetricType::Storage, value, vec![])]);
            assert!(matches!(
                result,
                Err(BillingError::InvalidBillingConfiguration(_))
            ));
        }
    }

    #[test]
    fn test_condition_json_shape() {
        let json = r#"[
            {"kind": "plan_tier_equals", "tier": "business"},
            {"kind": "tenant_in", "tenants": ["5b0f6a4e-8d0c-4c57-9a0e-1c3f2a9b7d11"]}
        ]"#;
        let conditions: Vec<MultiplierCondition> = serde_json::from_str(json).unwrap();
        assert_eq!(
            conditions[0],
            MultiplierCondition::PlanTierEquals {
                tier: PlanTier::Business
            }
        );
        assert!(serde_json::from_str::<MultiplierCondition>(r#"{"kind": "weekday_is"}"#).is_err());
    }
}
