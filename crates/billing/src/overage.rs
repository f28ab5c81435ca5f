//! Usage-based overage pricing
//!
//! Converts a tenant's usage of one metric into an overage charge:
//! raw usage is converted to billing units, scaled by the tenant's
//! multiplier, reduced by the plan allowance, then priced with a flat or
//! graduated tiered rate. Each metric's cost is rounded to the currency's
//! minor unit on its own, before the invoice sums them.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vidbill_shared::MetricType;

use crate::error::{BillingError, BillingResult};
use crate::money::{bytes_to_gb, round_to_minor_units};
use crate::multiplier::{MultiplierResolver, TenantAttributes};
use crate::plan::OverageRate;

/// Portion of the overage quantity priced by one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSlice {
    pub tier_index: usize,
    pub quantity: Decimal,
    pub price_per_unit: Decimal,
    pub cost: Decimal,
}

/// One invoice breakdown line. Everything is copied by value so later
/// configuration changes never alter an issued invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCharge {
    pub metric: MetricType,
    /// Raw counter value (bytes for byte metrics)
    pub raw_usage: i64,
    /// Raw plan allowance (bytes for byte metrics)
    pub included_limit: i64,
    pub unit: String,
    pub multiplier: f64,
    /// Usage after the multiplier, in billing units
    pub adjusted_usage: Decimal,
    /// Allowance in billing units
    pub included_units: Decimal,
    pub overage_quantity: Decimal,
    /// Rounded to the currency's minor unit
    pub overage_cost: Decimal,
    pub rate: OverageRate,
    #[serde(default)]
    pub tiers: Vec<TierSlice>,
}

/// Convert a raw counter into the unit its rate is quoted in
pub fn to_billing_units(metric: MetricType, raw: i64) -> Decimal {
    if metric.is_byte_metric() {
        bytes_to_gb(raw)
    } else {
        Decimal::from(raw)
    }
}

/// Price an overage quantity. Returns the unrounded cost and, for tiered
/// rates, the slices it was built from.
pub fn price_overage(quantity: Decimal, rate: &OverageRate) -> (Decimal, Vec<TierSlice>) {
    if quantity <= Decimal::ZERO {
        return (Decimal::ZERO, Vec::new());
    }

    match rate {
        OverageRate::Flat { unit_price } => (quantity * unit_price, Vec::new()),
        OverageRate::Tiered { tiers } => {
            let last = tiers.len().saturating_sub(1);
            let mut slices = Vec::new();
            let mut previous = Decimal::ZERO;
            let mut total = Decimal::ZERO;

            for (index, tier) in tiers.iter().enumerate() {
                // Last tier is unbounded whatever its configured bound says
                let upper = if index == last { None } else { tier.up_to };
                let ceiling = match upper {
                    Some(bound) => quantity.min(bound),
                    None => quantity,
                };
                let slice = (ceiling - previous).max(Decimal::ZERO);

                if slice > Decimal::ZERO {
                    let cost = slice * tier.price_per_unit;
                    total += cost;
                    slices.push(TierSlice {
                        tier_index: index,
                        quantity: slice,
                        price_per_unit: tier.price_per_unit,
                        cost,
                    });
                }

                match upper {
                    Some(bound) if quantity > bound => previous = bound,
                    _ => break,
                }
            }

            (total, slices)
        }
    }
}

/// Computes per-metric overage charges for one currency
#[derive(Debug, Clone)]
pub struct OverageCalculator {
    resolver: MultiplierResolver,
    minor_units: u32,
}

impl OverageCalculator {
    pub fn new(resolver: MultiplierResolver, minor_units: u32) -> Self {
        Self {
            resolver,
            minor_units,
        }
    }

    pub fn compute_overage(
        &self,
        tenant: &TenantAttributes,
        metric: MetricType,
        raw_usage: i64,
        limit: i64,
        rate: &OverageRate,
    ) -> BillingResult<MetricCharge> {
        if raw_usage < 0 {
            return Err(BillingError::InvalidBillingConfiguration(format!(
                "negative {} usage {} for tenant {}",
                metric, raw_usage, tenant.tenant_id
            )));
        }
        if limit < 0 {
            return Err(BillingError::InvalidBillingConfiguration(format!(
                "negative {} limit {}",
                metric, limit
            )));
        }
        rate.validate()?;

        let multiplier = self.resolver.resolve(tenant, metric)?;
        let factor = Decimal::from_f64(multiplier).ok_or_else(|| {
            BillingError::InvalidBillingConfiguration(format!(
                "multiplier {} is not representable as a decimal",
                multiplier
            ))
        })?;

        // Multiplier scales usage before the allowance is subtracted
        let adjusted_usage = to_billing_units(metric, raw_usage)
            .checked_mul(factor)
            .ok_or_else(|| {
                BillingError::InvalidBillingConfiguration(format!(
                    "{} usage {} overflows when scaled by {}",
                    metric, raw_usage, multiplier
                ))
            })?;
        let included_units = to_billing_units(metric, limit);
        let overage_quantity = (adjusted_usage - included_units).max(Decimal::ZERO);

        let (cost, tiers) = price_overage(overage_quantity, rate);
        let overage_cost = round_to_minor_units(cost, self.minor_units);

        if overage_quantity > Decimal::ZERO {
            tracing::debug!(
                tenant_id = %tenant.tenant_id,
                metric = %metric,
                adjusted_usage = %adjusted_usage,
                included_units = %included_units,
                overage_quantity = %overage_quantity,
                overage_cost = %overage_cost,
                "Computed metric overage"
            );
        }

        Ok(MetricCharge {
            metric,
            raw_usage,
            included_limit: limit,
            unit: metric.billing_unit().to_string(),
            multiplier,
            adjusted_usage,
            included_units,
            overage_quantity,
            overage_cost,
            rate: rate.clone(),
            tiers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::BYTES_PER_GB;
    use crate::multiplier::{MultiplierCondition, UsageMultiplier};
    use rust_decimal_macros::dec;
    use uuid::Uuid;
    use vidbill_shared::{PlanTier, TenantId};

    fn tenant() -> TenantAttributes {
        TenantAttributes {
            tenant_id: TenantId::new(),
            plan_tier: PlanTier::Professional,
            region: Some("eu-west".into()),
        }
    }

    fn calculator(multipliers: Vec<UsageMultiplier>) -> OverageCalculator {
        OverageCalculator::new(MultiplierResolver::new(multipliers).unwrap(), 2)
    }

    fn bandwidth_tiers() -> OverageRate {
        OverageRate::tiered([(Some(dec!(50)), dec!(0.05)), (None, dec!(0.03))])
    }

    #[test]
    fn test_flat_storage_overage() {
        let charge = calculator(vec![])
            .compute_overage(
                &tenant(),
                MetricType::Storage,
                150 * BYTES_PER_GB,
                100 * BYTES_PER_GB,
                &OverageRate::flat(dec!(0.10)),
            )
            .unwrap();

        assert_eq!(charge.overage_quantity, dec!(50));
        assert_eq!(charge.overage_cost, dec!(5.00));
        assert_eq!(charge.unit, "GB");
        assert_eq!(charge.multiplier, 1.0);
    }

    #[test]
    fn test_tiered_bandwidth_overage() {
        let charge = calculator(vec![])
            .compute_overage(
                &tenant(),
                MetricType::Bandwidth,
                580 * BYTES_PER_GB,
                500 * BYTES_PER_GB,
                &bandwidth_tiers(),
            )
            .unwrap();

        assert_eq!(charge.overage_quantity, dec!(80));
        assert_eq!(charge.overage_cost, dec!(3.40));
        assert_eq!(charge.tiers.len(), 2);
        assert_eq!(charge.tiers[0].quantity, dec!(50));
        assert_eq!(charge.tiers[0].cost, dec!(2.50));
        assert_eq!(charge.tiers[1].quantity, dec!(30));
        assert_eq!(charge.tiers[1].cost, dec!(0.90));
    }

    #[test]
    fn test_multiplier_applies_before_limit() {
        let discount = UsageMultiplier {
            id: Uuid::new_v4(),
            metric: MetricType::Storage,
            multiplier: 0.5,
            conditions: vec![MultiplierCondition::RegionIn {
                regions: vec!["eu-west".into()],
            }],
            active: true,
            description: Some("EU storage discount".into()),
        };

        let charge = calculator(vec![discount])
            .compute_overage(
                &tenant(),
                MetricType::Storage,
                180 * BYTES_PER_GB,
                100 * BYTES_PER_GB,
                &OverageRate::flat(dec!(0.10)),
            )
            .unwrap();

        assert_eq!(charge.adjusted_usage, dec!(90));
        assert_eq!(charge.overage_quantity, Decimal::ZERO);
        assert_eq!(charge.overage_cost, Decimal::ZERO);
        assert_eq!(charge.multiplier, 0.5);
    }

    #[test]
    fn test_zero_limit_bills_everything() {
        let charge = calculator(vec![])
            .compute_overage(&tenant(), MetricType::Views, 1_000, 0, &OverageRate::flat(dec!(0.001)))
            .unwrap();
        assert_eq!(charge.overage_quantity, dec!(1000));
        assert_eq!(charge.overage_cost, dec!(1.00));
    }

    #[test]
    fn test_cost_is_rounded_half_away_from_zero() {
        // 3 calls at 0.005 = 0.015 -> 0.02
        let charge = calculator(vec![])
            .compute_overage(&tenant(), MetricType::ApiCalls, 3, 0, &OverageRate::flat(dec!(0.005)))
            .unwrap();
        assert_eq!(charge.overage_cost, dec!(0.02));
    }

    #[test]
    fn test_rounding_follows_currency_precision() {
        let yen = OverageCalculator::new(MultiplierResolver::default(), 0);
        let charge = yen
            .compute_overage(&tenant(), MetricType::UserCount, 5, 2, &OverageRate::flat(dec!(12.5)))
            .unwrap();
        // 3 users at 12.5 = 37.5 -> 38
        assert_eq!(charge.overage_cost, dec!(38));
    }

    #[test]
    fn test_negative_inputs_are_rejected() {
        let calc = calculator(vec![]);
        let rate = OverageRate::flat(dec!(1));
        assert!(matches!(
            calc.compute_overage(&tenant(), MetricType::VideoCount, -1, 10, &rate),
            Err(BillingError::InvalidBillingConfiguration(_))
        ));
        assert!(matches!(
            calc.compute_overage(&tenant(), MetricType::VideoCount, 1, -10, &rate),
            Err(BillingError::InvalidBillingConfiguration(_))
        ));
    }

    #[test]
    fn test_malformed_tiers_are_rejected() {
        let rate = OverageRate::tiered([(Some(dec!(50)), dec!(0.05)), (Some(dec!(40)), dec!(0.03)), (None, dec!(0.01))]);
        assert!(calculator(vec![])
            .compute_overage(&tenant(), MetricType::Bandwidth, 10, 0, &rate)
            .is_err());
    }

    #[test]
    fn test_quantity_within_first_tier() {
        let (cost, slices) = price_overage(dec!(20), &bandwidth_tiers());
        assert_eq!(cost, dec!(1.00));
        assert_eq!(slices.len(), 1);
    }

    #[test]
    fn test_last_tier_bound_is_ignored() {
        let rate = OverageRate::tiered([(Some(dec!(10)), dec!(1)), (Some(dec!(20)), dec!(0.5))]);
        let (cost, slices) = price_overage(dec!(100), &rate);
        // 10 * 1 + 90 * 0.5
        assert_eq!(cost, dec!(55));
        assert_eq!(slices[1].quantity, dec!(90));
    }
}
