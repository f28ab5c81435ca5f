//! Storage seams of the billing engine
//!
//! The engine reads upstream usage through [`UsageFeed`], plan and tenant
//! configuration through [`BillingConfigSource`], and persists its own
//! output through [`BillingStore`]. Postgres and in-memory implementations
//! live in the submodules.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;
use vidbill_shared::TenantId;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::invoice::{InvoiceStatus, TenantInvoice};
use crate::multiplier::UsageMultiplier;
use crate::plan::{PlanConfig, TenantProfile};
use crate::usage::{BillingPeriod, RawUsageCounters, TenantUsageSnapshot};

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

/// Raw usage counters owned by the video platform
#[async_trait]
pub trait UsageFeed: Send + Sync {
    /// Sum every counter over `[period.start, period.end)`
    async fn period_counters(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<RawUsageCounters>;
}

/// Tenant, plan and multiplier configuration
#[async_trait]
pub trait BillingConfigSource: Send + Sync {
    async fn tenant_profile(&self, tenant_id: TenantId) -> BillingResult<Option<TenantProfile>>;

    async fn plan(&self, plan_id: &str) -> BillingResult<Option<PlanConfig>>;

    async fn active_multipliers(&self) -> BillingResult<Vec<UsageMultiplier>>;

    /// Tenants a scheduled run should bill
    async fn billable_tenants(&self) -> BillingResult<Vec<TenantId>>;

    /// Tenant profile together with its plan; `TenantNotFound` when either
    /// is missing
    async fn tenant_plan(&self, tenant_id: TenantId) -> BillingResult<(TenantProfile, PlanConfig)> {
        let profile = self
            .tenant_profile(tenant_id)
            .await?
            .ok_or(BillingError::TenantNotFound(tenant_id))?;

        let plan_id = match &profile.plan_id {
            Some(plan_id) => plan_id.clone(),
            None => return Err(BillingError::TenantNotFound(tenant_id)),
        };

        match self.plan(&plan_id).await? {
            Some(plan) => Ok((profile, plan)),
            None => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    plan_id = %plan_id,
                    "Tenant references a plan that is not configured"
                );
                Err(BillingError::TenantNotFound(tenant_id))
            }
        }
    }
}

/// Snapshots, invoices and billing events written by the engine
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Insert or overwrite the snapshot keyed by `(tenant_id, period.start)`
    async fn upsert_snapshot(&self, snapshot: &TenantUsageSnapshot) -> BillingResult<()>;

    async fn get_snapshot(
        &self,
        tenant_id: TenantId,
        period_start: OffsetDateTime,
    ) -> BillingResult<Option<TenantUsageSnapshot>>;

    async fn find_invoice(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<Option<TenantInvoice>>;

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<TenantInvoice>>;

    /// Newest period first
    async fn list_invoices(&self, tenant_id: TenantId, limit: i64)
        -> BillingResult<Vec<TenantInvoice>>;

    /// Insert a new invoice. Fails with `ConcurrentInvoiceConflict` when an
    /// invoice for the same tenant and period already exists.
    async fn insert_invoice(&self, invoice: &TenantInvoice) -> BillingResult<()>;

    /// Replace the amounts of a stored draft. Returns false when the stored
    /// invoice is no longer a draft.
    async fn overwrite_draft(&self, invoice: &TenantInvoice) -> BillingResult<bool>;

    /// Compare-and-set the status. Returns false when the stored status is
    /// not `from`. Moving to `Finalized` stamps `finalized_at`.
    async fn transition_status(
        &self,
        invoice_id: Uuid,
        from: InvoiceStatus,
        to: InvoiceStatus,
        payment_reference: Option<&str>,
        at: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn log_event(&self, event: &BillingEvent) -> BillingResult<()>;

    /// Newest first
    async fn list_events(&self, tenant_id: TenantId, limit: i64) -> BillingResult<Vec<BillingEvent>>;
}
