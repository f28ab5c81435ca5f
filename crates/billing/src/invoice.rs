//! Invoice composition
//!
//! One invoice exists per tenant per billing period. Composing a period
//! that already has a finalized invoice returns it untouched; a draft is
//! recomputed in place under the same id. The `(tenant, period)` unique key
//! in the store is what serializes concurrent composers.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vidbill_shared::TenantId;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventLogger, BillingEventType};
use crate::money::{currency_minor_units, round_to_minor_units};
use crate::multiplier::{MultiplierResolver, TenantAttributes};
use crate::overage::{MetricCharge, OverageCalculator};
use crate::plan::{PlanConfig, TenantProfile};
use crate::store::{BillingConfigSource, BillingStore};
use crate::usage::{BillingPeriod, TenantUsageSnapshot, UsagePeriodAggregator};

/// Invoice lifecycle: Draft -> Finalized -> PaymentRequested -> Paid | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    PaymentRequested,
    Paid,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Finalized => "finalized",
            InvoiceStatus::PaymentRequested => "payment_requested",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        matches!(
            (self, next),
            (InvoiceStatus::Draft, InvoiceStatus::Finalized)
                | (InvoiceStatus::Finalized, InvoiceStatus::PaymentRequested)
                | (InvoiceStatus::PaymentRequested, InvoiceStatus::Paid)
                | (InvoiceStatus::PaymentRequested, InvoiceStatus::Failed)
        )
    }

    /// Amounts and breakdown can no longer change
    pub fn is_frozen(&self) -> bool {
        !matches!(self, InvoiceStatus::Draft)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Failed)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InvoiceStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "finalized" => Ok(InvoiceStatus::Finalized),
            "payment_requested" => Ok(InvoiceStatus::PaymentRequested),
            "paid" => Ok(InvoiceStatus::Paid),
            "failed" => Ok(InvoiceStatus::Failed),
            other => Err(BillingError::Internal(format!(
                "Unknown invoice status: {}",
                other
            ))),
        }
    }
}

/// Billing record for one tenant and one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantInvoice {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub plan_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub base_amount: Decimal,
    pub overage_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub usage_breakdown: Vec<MetricCharge>,
    pub status: InvoiceStatus,
    pub payment_reference: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finalized_at: Option<OffsetDateTime>,
}

impl TenantInvoice {
    pub fn period(&self) -> BillingPeriod {
        BillingPeriod {
            start: self.period_start,
            end: self.period_end,
        }
    }

    /// Check `overage = sum(breakdown)` and `total = base + overage`
    pub fn verify_totals(&self) -> BillingResult<()> {
        let breakdown_sum: Decimal = self.usage_breakdown.iter().map(|c| c.overage_cost).sum();
        if breakdown_sum != self.overage_amount {
            return Err(BillingError::Internal(format!(
                "invoice {} overage {} does not match breakdown sum {}",
                self.id, self.overage_amount, breakdown_sum
            )));
        }
        if self.base_amount + self.overage_amount != self.total_amount {
            return Err(BillingError::Internal(format!(
                "invoice {} total {} does not equal base {} + overage {}",
                self.id, self.total_amount, self.base_amount, self.overage_amount
            )));
        }
        Ok(())
    }

    /// Nothing to collect
    pub fn is_zero_total(&self) -> bool {
        self.total_amount.is_zero()
    }
}

/// Amounts computed for one tenant and period before they are persisted
struct ComposedAmounts {
    base_amount: Decimal,
    overage_amount: Decimal,
    total_amount: Decimal,
    usage_breakdown: Vec<MetricCharge>,
}

/// Builds and finalizes invoices
#[derive(Clone)]
pub struct InvoiceComposer {
    config: Arc<dyn BillingConfigSource>,
    store: Arc<dyn BillingStore>,
    aggregator: UsagePeriodAggregator,
    events: BillingEventLogger,
}

impl InvoiceComposer {
    pub fn new(
        config: Arc<dyn BillingConfigSource>,
        store: Arc<dyn BillingStore>,
        aggregator: UsagePeriodAggregator,
    ) -> Self {
        Self {
            events: BillingEventLogger::new(store.clone()),
            config,
            store,
            aggregator,
        }
    }

    /// Compose the invoice for `[period_start, period_end)`
    pub async fn compose(
        &self,
        tenant_id: TenantId,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<TenantInvoice> {
        let period = BillingPeriod::new(period_start, period_end)?;
        self.compose_period(tenant_id, &period).await
    }

    pub async fn compose_period(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<TenantInvoice> {
        let existing = self.store.find_invoice(tenant_id, period).await?;
        if let Some(invoice) = &existing {
            if invoice.status.is_frozen() {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    invoice_id = %invoice.id,
                    status = %invoice.status,
                    "Invoice already finalized, returning stored copy"
                );
                return Ok(invoice.clone());
            }
        }

        let (profile, plan) = self.config.tenant_plan(tenant_id).await?;
        let snapshot = self.snapshot_for(tenant_id, period).await?;
        let amounts = self.compute_amounts(&profile, &plan, &snapshot).await?;
        let now = OffsetDateTime::now_utc();

        match existing {
            Some(draft) => {
                let invoice = TenantInvoice {
                    plan_id: plan.plan_id.clone(),
                    base_amount: amounts.base_amount,
                    overage_amount: amounts.overage_amount,
                    total_amount: amounts.total_amount,
                    currency: plan.currency.clone(),
                    usage_breakdown: amounts.usage_breakdown,
                    updated_at: now,
                    ..draft
                };

                if self.store.overwrite_draft(&invoice).await? {
                    self.log_drafted(&invoice).await;
                    Ok(invoice)
                } else {
                    self.recover_conflict(tenant_id, period).await
                }
            }
            None => {
                let invoice = TenantInvoice {
                    id: Uuid::new_v4(),
                    tenant_id,
                    plan_id: plan.plan_id.clone(),
                    period_start: period.start,
                    period_end: period.end,
                    base_amount: amounts.base_amount,
                    overage_amount: amounts.overage_amount,
                    total_amount: amounts.total_amount,
                    currency: plan.currency.clone(),
                    usage_breakdown: amounts.usage_breakdown,
                    status: InvoiceStatus::Draft,
                    payment_reference: None,
                    created_at: now,
                    updated_at: now,
                    finalized_at: None,
                };

                match self.store.insert_invoice(&invoice).await {
                    Ok(()) => {
                        self.log_drafted(&invoice).await;
                        Ok(invoice)
                    }
                    Err(BillingError::ConcurrentInvoiceConflict { .. }) => {
                        self.recover_conflict(tenant_id, period).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Move a draft to Finalized. Frozen invoices are returned as stored.
    pub async fn finalize(&self, invoice: &TenantInvoice) -> BillingResult<TenantInvoice> {
        if invoice.status.is_frozen() {
            return Ok(invoice.clone());
        }
        invoice.verify_totals()?;

        let now = OffsetDateTime::now_utc();
        let won = self
            .store
            .transition_status(
                invoice.id,
                InvoiceStatus::Draft,
                InvoiceStatus::Finalized,
                None,
                now,
            )
            .await?;

        let current = self
            .store
            .get_invoice(invoice.id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice.id))?;

        if won {
            tracing::info!(
                tenant_id = %current.tenant_id,
                invoice_id = %current.id,
                total_amount = %current.total_amount,
                currency = %current.currency,
                "Invoice finalized"
            );
            self.events
                .log_invoice(BillingEventType::InvoiceFinalized, &current)
                .await;
            return Ok(current);
        }

        if current.status.is_frozen() {
            Ok(current)
        } else {
            Err(BillingError::InvalidStatusTransition {
                from: current.status,
                to: InvoiceStatus::Finalized,
            })
        }
    }

    async fn snapshot_for(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<TenantUsageSnapshot> {
        match self.store.get_snapshot(tenant_id, period.start).await? {
            Some(snapshot) if snapshot.period == *period => Ok(snapshot),
            _ => self.aggregator.aggregate_period(tenant_id, period).await,
        }
    }

    async fn compute_amounts(
        &self,
        profile: &TenantProfile,
        plan: &PlanConfig,
        snapshot: &TenantUsageSnapshot,
    ) -> BillingResult<ComposedAmounts> {
        let minor_units = currency_minor_units(&plan.currency);
        let resolver = MultiplierResolver::new(self.config.active_multipliers().await?)?;
        let calculator = OverageCalculator::new(resolver, minor_units);
        let tenant = TenantAttributes {
            tenant_id: profile.tenant_id,
            plan_tier: plan.tier,
            region: profile.region.clone(),
        };

        let mut usage_breakdown = Vec::with_capacity(plan.overage_rates.len());
        for (metric, rate) in &plan.overage_rates {
            let charge = calculator.compute_overage(
                &tenant,
                *metric,
                snapshot.counters.value_for(*metric),
                plan.limits.limit_for(*metric),
                rate,
            )?;
            usage_breakdown.push(charge);
        }

        let base_amount = round_to_minor_units(plan.base_price, minor_units);
        let overage_amount: Decimal = usage_breakdown.iter().map(|c| c.overage_cost).sum();

        Ok(ComposedAmounts {
            base_amount,
            overage_amount,
            total_amount: base_amount + overage_amount,
            usage_breakdown,
        })
    }

    /// Another composer won the write; its invoice is the answer
    async fn recover_conflict(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<TenantInvoice> {
        tracing::warn!(
            tenant_id = %tenant_id,
            period = %period,
            "Concurrent invoice write detected, re-reading stored invoice"
        );

        match self.store.find_invoice(tenant_id, period).await? {
            Some(invoice) => {
                self.events
                    .log_invoice(BillingEventType::InvoiceConflictRecovered, &invoice)
                    .await;
                Ok(invoice)
            }
            None => Err(BillingError::ConcurrentInvoiceConflict {
                tenant_id,
                period_start: period.start,
            }),
        }
    }

    async fn log_drafted(&self, invoice: &TenantInvoice) {
        tracing::info!(
            tenant_id = %invoice.tenant_id,
            invoice_id = %invoice.id,
            base_amount = %invoice.base_amount,
            overage_amount = %invoice.overage_amount,
            total_amount = %invoice.total_amount,
            currency = %invoice.currency,
            "Invoice drafted"
        );
        self.events
            .log_invoice(BillingEventType::InvoiceDrafted, invoice)
            .await;
    }
}
