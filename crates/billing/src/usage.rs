//! Usage period aggregation
//!
//! Turns the platform's raw usage records into one snapshot per tenant per
//! billing period. Snapshots are keyed by `(tenant_id, period_start)` and
//! re-aggregating a period overwrites the previous snapshot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime};
use vidbill_shared::{MetricType, TenantId};

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEventLogger;
use crate::store::{BillingConfigSource, BillingStore, UsageFeed};

/// Half-open billing interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl BillingPeriod {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> BillingResult<Self> {
        if start >= end {
            return Err(BillingError::InvalidPeriod(format!(
                "period start {} is not before end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Calendar month (UTC) containing `at`
    pub fn month_containing(at: OffsetDateTime) -> BillingResult<Self> {
        let date = at.to_offset(time::UtcOffset::UTC).date();
        let start = first_of_month(date.year(), date.month())?;
        let end = match date.month() {
            Month::December => first_of_month(date.year() + 1, Month::January)?,
            month => first_of_month(date.year(), month.next())?,
        };
        Self::new(start, end)
    }

    /// Calendar month (UTC) before the one containing `now`; what a
    /// scheduled run bills
    pub fn previous_month(now: OffsetDateTime) -> BillingResult<Self> {
        let current = Self::month_containing(now)?;
        Self::month_containing(current.start - time::Duration::days(1))
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        at >= self.start && at < self.end
    }

    pub fn start_rfc3339(&self) -> String {
        self.start
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.start.to_string())
    }

    pub fn end_rfc3339(&self) -> String {
        self.end
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.end.to_string())
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start_rfc3339(), self.end_rfc3339())
    }
}

fn first_of_month(year: i32, month: Month) -> BillingResult<OffsetDateTime> {
    Date::from_calendar_date(year, month, 1)
        .map(|d| d.midnight().assume_utc())
        .map_err(|e| BillingError::InvalidPeriod(e.to_string()))
}

/// Upstream counters summed over one period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawUsageCounters {
    pub storage_bytes: i64,
    pub bandwidth_bytes: i64,
    pub video_count: i64,
    pub user_count: i64,
    pub unique_viewers: i64,
    pub view_count: i64,
    pub api_calls: i64,
}

impl RawUsageCounters {
    /// Raw usage of a metric in its raw unit (bytes or count)
    pub fn value_for(&self, metric: MetricType) -> i64 {
        match metric {
            MetricType::Storage => self.storage_bytes,
            MetricType::Bandwidth => self.bandwidth_bytes,
            MetricType::VideoCount => self.video_count,
            MetricType::UserCount => self.user_count,
            MetricType::ApiCalls => self.api_calls,
            MetricType::Views => self.view_count,
        }
    }
}

/// Aggregated usage of one tenant for one billing period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantUsageSnapshot {
    pub tenant_id: TenantId,
    pub period: BillingPeriod,
    #[serde(flatten)]
    pub counters: RawUsageCounters,
    #[serde(with = "time::serde::rfc3339")]
    pub aggregated_at: OffsetDateTime,
}

/// Builds and persists usage snapshots
#[derive(Clone)]
pub struct UsagePeriodAggregator {
    feed: Arc<dyn UsageFeed>,
    config: Arc<dyn BillingConfigSource>,
    store: Arc<dyn BillingStore>,
    events: BillingEventLogger,
}

impl UsagePeriodAggregator {
    pub fn new(
        feed: Arc<dyn UsageFeed>,
        config: Arc<dyn BillingConfigSource>,
        store: Arc<dyn BillingStore>,
    ) -> Self {
        Self {
            events: BillingEventLogger::new(store.clone()),
            feed,
            config,
            store,
        }
    }

    /// Aggregate a tenant's usage over `[period_start, period_end)` and upsert
    /// the snapshot
    pub async fn aggregate(
        &self,
        tenant_id: TenantId,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<TenantUsageSnapshot> {
        let period = BillingPeriod::new(period_start, period_end)?;
        self.aggregate_period(tenant_id, &period).await
    }

    pub async fn aggregate_period(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<TenantUsageSnapshot> {
        // Unknown tenants and tenants without a plan are never metered
        self.config.tenant_plan(tenant_id).await?;

        let counters = self.feed.period_counters(tenant_id, period).await?;
        let snapshot = TenantUsageSnapshot {
            tenant_id,
            period: *period,
            counters,
            aggregated_at: OffsetDateTime::now_utc(),
        };

        self.store.upsert_snapshot(&snapshot).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            period = %period,
            storage_bytes = counters.storage_bytes,
            bandwidth_bytes = counters.bandwidth_bytes,
            video_count = counters.video_count,
            user_count = counters.user_count,
            view_count = counters.view_count,
            api_calls = counters.api_calls,
            "Aggregated tenant usage"
        );

        self.events.log_usage_aggregated(&snapshot).await;

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{BillingCatalog, PlanConfig, PlanLimits};
    use crate::store::memory::InMemoryBillingStore;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use time::macros::datetime;
    use vidbill_shared::PlanTier;

    fn store_with_tenant() -> (Arc<InMemoryBillingStore>, TenantId) {
        let store = Arc::new(InMemoryBillingStore::new_in_memory());
        store.load_catalog(BillingCatalog {
            plans: vec![PlanConfig {
                plan_id: "starter".into(),
                name: "Starter".into(),
                tier: PlanTier::Starter,
                base_price: dec!(19),
                currency: "USD".into(),
                limits: PlanLimits::default(),
                overage_rates: BTreeMap::new(),
            }],
            multipliers: vec![],
        });
        let tenant_id = TenantId::new();
        store.add_tenant(tenant_id, Some("starter"), None);
        (store, tenant_id)
    }

    fn aggregator(store: &Arc<InMemoryBillingStore>) -> UsagePeriodAggregator {
        UsagePeriodAggregator::new(store.clone(), store.clone(), store.clone())
    }

    #[test]
    fn test_period_must_be_ordered() {
        let t = datetime!(2026-03-01 00:00 UTC);
        assert!(matches!(
            BillingPeriod::new(t, t),
            Err(BillingError::InvalidPeriod(_))
        ));
        assert!(BillingPeriod::new(t + time::Duration::days(1), t).is_err());
    }

    #[test]
    fn test_month_boundaries() {
        let period = BillingPeriod::month_containing(datetime!(2026-12-15 13:45 UTC)).unwrap();
        assert_eq!(period.start, datetime!(2026-12-01 00:00 UTC));
        assert_eq!(period.end, datetime!(2027-01-01 00:00 UTC));

        let previous = BillingPeriod::previous_month(datetime!(2026-03-01 02:00 UTC)).unwrap();
        assert_eq!(previous.start, datetime!(2026-02-01 00:00 UTC));
        assert_eq!(previous.end, datetime!(2026-03-01 00:00 UTC));
        assert!(previous.contains(datetime!(2026-02-28 23:59:59 UTC)));
        assert!(!previous.contains(previous.end));
    }

    #[tokio::test]
    async fn test_aggregate_sums_only_within_period() {
        let (store, tenant_id) = store_with_tenant();
        let inside = datetime!(2026-02-10 12:00 UTC);
        let video = store.record_video(tenant_id, 2_000_000_000, inside);
        store.record_video(tenant_id, 5_000_000_000, datetime!(2026-03-01 00:00 UTC));
        store.record_view(tenant_id, video, uuid::Uuid::new_v4(), inside);
        store.record_api_calls(tenant_id, 40, inside);
        store.record_api_calls(tenant_id, 60, datetime!(2026-01-31 23:59 UTC));

        let snapshot = aggregator(&store)
            .aggregate(
                tenant_id,
                datetime!(2026-02-01 00:00 UTC),
                datetime!(2026-03-01 00:00 UTC),
            )
            .await
            .unwrap();

        assert_eq!(snapshot.counters.storage_bytes, 2_000_000_000);
        assert_eq!(snapshot.counters.video_count, 1);
        assert_eq!(snapshot.counters.bandwidth_bytes, 2_000_000_000);
        assert_eq!(snapshot.counters.view_count, 1);
        assert_eq!(snapshot.counters.unique_viewers, 1);
        assert_eq!(snapshot.counters.api_calls, 40);
    }

    #[tokio::test]
    async fn test_reaggregation_overwrites_single_snapshot() {
        let (store, tenant_id) = store_with_tenant();
        store.record_api_calls(tenant_id, 10, datetime!(2026-02-03 08:00 UTC));
        let agg = aggregator(&store);
        let start = datetime!(2026-02-01 00:00 UTC);
        let end = datetime!(2026-03-01 00:00 UTC);

        let first = agg.aggregate(tenant_id, start, end).await.unwrap();
        let second = agg.aggregate(tenant_id, start, end).await.unwrap();

        assert_eq!(first.counters, second.counters);
        assert_eq!(store.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_rejected() {
        let (store, _) = store_with_tenant();
        let result = aggregator(&store)
            .aggregate(
                TenantId::new(),
                datetime!(2026-02-01 00:00 UTC),
                datetime!(2026-03-01 00:00 UTC),
            )
            .await;
        assert!(matches!(result, Err(BillingError::TenantNotFound(_))));
    }

    #[tokio::test]
    async fn test_tenant_without_plan_is_rejected() {
        let (store, _) = store_with_tenant();
        let tenant_id = TenantId::new();
        store.add_tenant(tenant_id, None, None);
        let result = aggregator(&store)
            .aggregate(
                tenant_id,
                datetime!(2026-02-01 00:00 UTC),
                datetime!(2026-03-01 00:00 UTC),
            )
            .await;
        assert!(matches!(result, Err(BillingError::TenantNotFound(_))));
    }
}
