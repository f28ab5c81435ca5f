//! In-memory billing store (for development and tests without Postgres)
//!
//! Holds the upstream usage records, the billing catalog and the engine's
//! own output behind one lock, so every compare-and-set is atomic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;
use vidbill_shared::TenantId;

use super::{BillingConfigSource, BillingStore, UsageFeed};
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::invoice::{InvoiceStatus, TenantInvoice};
use crate::multiplier::UsageMultiplier;
use crate::plan::{BillingCatalog, PlanConfig, TenantProfile};
use crate::usage::{BillingPeriod, RawUsageCounters, TenantUsageSnapshot};

#[derive(Debug, Clone)]
struct UserRecord {
    tenant_id: TenantId,
    user_id: Uuid,
    created_at: OffsetDateTime,
    deactivated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
struct VideoRecord {
    tenant_id: TenantId,
    file_size_bytes: i64,
    created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct ViewRecord {
    tenant_id: TenantId,
    video_id: Uuid,
    viewer_id: Option<Uuid>,
    viewed_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct ApiUsageRecord {
    tenant_id: TenantId,
    request_count: i64,
    occurred_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct MemoryState {
    tenants: BTreeMap<TenantId, TenantProfile>,
    plans: HashMap<String, PlanConfig>,
    multipliers: Vec<UsageMultiplier>,
    users: Vec<UserRecord>,
    videos: HashMap<Uuid, VideoRecord>,
    views: Vec<ViewRecord>,
    api_usage: Vec<ApiUsageRecord>,
    snapshots: HashMap<(TenantId, OffsetDateTime), TenantUsageSnapshot>,
    invoices: HashMap<Uuid, TenantInvoice>,
    events: Vec<BillingEvent>,
}

/// Billing store backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryBillingStore {
    state: RwLock<MemoryState>,
}

impl InMemoryBillingStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    /// Start from a validated catalog
    pub fn with_catalog(catalog: BillingCatalog) -> Self {
        let store = Self::new_in_memory();
        store.load_catalog(catalog);
        store
    }

    // A panic while holding the lock leaves plain data behind, never a
    // half-applied transition, so the guard is taken over.
    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace plans and multipliers
    pub fn load_catalog(&self, catalog: BillingCatalog) {
        let mut state = self.write();
        state.plans = catalog
            .plans
            .into_iter()
            .map(|p| (p.plan_id.clone(), p))
            .collect();
        state.multipliers = catalog.multipliers;
    }

    pub fn add_tenant(&self, tenant_id: TenantId, plan_id: Option<&str>, region: Option<&str>) {
        self.write().tenants.insert(
            tenant_id,
            TenantProfile {
                tenant_id,
                plan_id: plan_id.map(str::to_string),
                region: region.map(str::to_string),
            },
        );
    }

    pub fn add_user(
        &self,
        tenant_id: TenantId,
        created_at: OffsetDateTime,
        deactivated_at: Option<OffsetDateTime>,
    ) -> Uuid {
        let user_id = Uuid::new_v4();
        self.write().users.push(UserRecord {
            tenant_id,
            user_id,
            created_at,
            deactivated_at,
        });
        user_id
    }

    pub fn record_video(&self, tenant_id: TenantId, file_size_bytes: i64, created_at: OffsetDateTime) -> Uuid {
        let video_id = Uuid::new_v4();
        self.write().videos.insert(
            video_id,
            VideoRecord {
                tenant_id,
                file_size_bytes,
                created_at,
            },
        );
        video_id
    }

    pub fn record_view(
        &self,
        tenant_id: TenantId,
        video_id: Uuid,
        viewer_id: Uuid,
        viewed_at: OffsetDateTime,
    ) {
        self.write().views.push(ViewRecord {
            tenant_id,
            video_id,
            viewer_id: Some(viewer_id),
            viewed_at,
        });
    }

    pub fn record_api_calls(&self, tenant_id: TenantId, request_count: i64, occurred_at: OffsetDateTime) {
        self.write().api_usage.push(ApiUsageRecord {
            tenant_id,
            request_count,
            occurred_at,
        });
    }

    pub fn snapshot_count(&self) -> usize {
        self.read().snapshots.len()
    }

    pub fn invoice_count(&self) -> usize {
        self.read().invoices.len()
    }
}

fn in_period(period: &BillingPeriod, at: OffsetDateTime) -> bool {
    period.contains(at)
}

#[async_trait]
impl UsageFeed for InMemoryBillingStore {
    async fn period_counters(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<RawUsageCounters> {
        let state = self.read();
        let mut counters = RawUsageCounters::default();

        for video in state
            .videos
            .values()
            .filter(|v| v.tenant_id == tenant_id && in_period(period, v.created_at))
        {
            counters.storage_bytes += video.file_size_bytes;
            counters.video_count += 1;
        }

        let mut viewers = HashSet::new();
        for view in state
            .views
            .iter()
            .filter(|v| v.tenant_id == tenant_id && in_period(period, v.viewed_at))
        {
            counters.view_count += 1;
            // Served file size per view, as the platform reports bandwidth
            if let Some(video) = state.videos.get(&view.video_id) {
                counters.bandwidth_bytes += video.file_size_bytes;
            }
            if let Some(viewer_id) = view.viewer_id {
                viewers.insert(viewer_id);
            }
        }
        counters.unique_viewers = viewers.len() as i64;

        // Users active at any point of the period
        counters.user_count = state
            .users
            .iter()
            .filter(|u| {
                u.tenant_id == tenant_id
                    && u.created_at < period.end
                    && u.deactivated_at.map_or(true, |d| d > period.start)
            })
            .map(|u| u.user_id)
            .collect::<HashSet<_>>()
            .len() as i64;

        counters.api_calls = state
            .api_usage
            .iter()
            .filter(|a| a.tenant_id == tenant_id && in_period(period, a.occurred_at))
            .map(|a| a.request_count)
            .sum();

        Ok(counters)
    }
}

#[async_trait]
impl BillingConfigSource for InMemoryBillingStore {
    async fn tenant_profile(&self, tenant_id: TenantId) -> BillingResult<Option<TenantProfile>> {
        Ok(self.read().tenants.get(&tenant_id).cloned())
    }

    async fn plan(&self, plan_id: &str) -> BillingResult<Option<PlanConfig>> {
        Ok(self.read().plans.get(plan_id).cloned())
    }

    async fn active_multipliers(&self) -> BillingResult<Vec<UsageMultiplier>> {
        Ok(self
            .read()
            .multipliers
            .iter()
            .filter(|m| m.active)
            .cloned()
            .collect())
    }

    async fn billable_tenants(&self) -> BillingResult<Vec<TenantId>> {
        Ok(self
            .read()
            .tenants
            .values()
            .filter(|t| t.plan_id.is_some())
            .map(|t| t.tenant_id)
            .collect())
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn upsert_snapshot(&self, snapshot: &TenantUsageSnapshot) -> BillingResult<()> {
        self.write()
            .snapshots
            .insert((snapshot.tenant_id, snapshot.period.start), snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(
        &self,
        tenant_id: TenantId,
        period_start: OffsetDateTime,
    ) -> BillingResult<Option<TenantUsageSnapshot>> {
        Ok(self.read().snapshots.get(&(tenant_id, period_start)).cloned())
    }

    async fn find_invoice(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<Option<TenantInvoice>> {
        Ok(self
            .read()
            .invoices
            .values()
            .find(|i| i.tenant_id == tenant_id && i.period() == *period)
            .cloned())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<TenantInvoice>> {
        Ok(self.read().invoices.get(&invoice_id).cloned())
    }

    async fn list_invoices(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<TenantInvoice>> {
        let mut invoices: Vec<TenantInvoice> = self
            .read()
            .invoices
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        invoices.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(invoices)
    }

    async fn insert_invoice(&self, invoice: &TenantInvoice) -> BillingResult<()> {
        let mut state = self.write();
        let period = invoice.period();
        let taken = state
            .invoices
            .values()
            .any(|i| i.tenant_id == invoice.tenant_id && i.period() == period);
        if taken || state.invoices.contains_key(&invoice.id) {
            return Err(BillingError::ConcurrentInvoiceConflict {
                tenant_id: invoice.tenant_id,
                period_start: invoice.period_start,
            });
        }
        state.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn overwrite_draft(&self, invoice: &TenantInvoice) -> BillingResult<bool> {
        let mut state = self.write();
        match state.invoices.get_mut(&invoice.id) {
            Some(stored) if stored.status == InvoiceStatus::Draft => {
                stored.plan_id = invoice.plan_id.clone();
                stored.base_amount = invoice.base_amount;
                stored.overage_amount = invoice.overage_amount;
                stored.total_amount = invoice.total_amount;
                stored.currency = invoice.currency.clone();
                stored.usage_breakdown = invoice.usage_breakdown.clone();
                stored.updated_at = invoice.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_status(
        &self,
        invoice_id: Uuid,
        from: InvoiceStatus,
        to: InvoiceStatus,
        payment_reference: Option<&str>,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.write();
        match state.invoices.get_mut(&invoice_id) {
            Some(stored) if stored.status == from => {
                stored.status = to;
                stored.updated_at = at;
                if to == InvoiceStatus::Finalized {
                    stored.finalized_at = Some(at);
                }
                if let Some(reference) = payment_reference {
                    stored.payment_reference = Some(reference.to_string());
                }
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::InvoiceNotFound(invoice_id)),
        }
    }

    async fn log_event(&self, event: &BillingEvent) -> BillingResult<()> {
        self.write().events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, tenant_id: TenantId, limit: i64) -> BillingResult<Vec<BillingEvent>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .read()
            .events
            .iter()
            .rev()
            .filter(|e| e.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
