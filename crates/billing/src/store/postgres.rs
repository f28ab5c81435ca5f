//! Postgres billing store
//!
//! Reads the platform's usage tables and billing configuration, and writes
//! snapshots, invoices and billing events. The `tenant_invoices_period_key`
//! unique constraint is what serializes concurrent invoice writers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;
use vidbill_shared::{MetricType, PlanTier, TenantId};

use super::{BillingConfigSource, BillingStore, UsageFeed};
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::invoice::{InvoiceStatus, TenantInvoice};
use crate::multiplier::{MultiplierCondition, UsageMultiplier};
use crate::overage::MetricCharge;
use crate::plan::{BillingCatalog, OverageRate, PlanConfig, PlanLimits, TenantProfile};
use crate::usage::{BillingPeriod, RawUsageCounters, TenantUsageSnapshot};

const INVOICE_COLUMNS: &str = r#"
    id, tenant_id, plan_id, period_start, period_end,
    base_amount, overage_amount, total_amount, currency,
    usage_breakdown, status, payment_reference,
    created_at, updated_at, finalized_at
"#;

/// Billing store backed by Postgres
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Write a validated catalog into `billing_plans` and `usage_multipliers`.
    /// Multipliers missing from the catalog are deactivated, never deleted.
    pub async fn sync_catalog(&self, catalog: &BillingCatalog) -> BillingResult<()> {
        catalog.validate()?;
        let mut tx = self.pool.begin().await?;

        for plan in &catalog.plans {
            sqlx::query(
                r#"
                INSERT INTO billing_plans (
                    plan_id, name, tier, base_price, currency,
                    storage_limit_bytes, bandwidth_limit_bytes, video_limit,
                    user_limit, api_calls_limit, overage_rates, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
                ON CONFLICT (plan_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    tier = EXCLUDED.tier,
                    base_price = EXCLUDED.base_price,
                    currency = EXCLUDED.currency,
                    storage_limit_bytes = EXCLUDED.storage_limit_bytes,
                    bandwidth_limit_bytes = EXCLUDED.bandwidth_limit_bytes,
                    video_limit = EXCLUDED.video_limit,
                    user_limit = EXCLUDED.user_limit,
                    api_calls_limit = EXCLUDED.api_calls_limit,
                    overage_rates = EXCLUDED.overage_rates,
                    updated_at = NOW()
                "#,
            )
            .bind(&plan.plan_id)
            .bind(&plan.name)
            .bind(plan.tier.to_string())
            .bind(plan.base_price)
            .bind(&plan.currency)
            .bind(plan.limits.storage_limit_bytes)
            .bind(plan.limits.bandwidth_limit_bytes)
            .bind(plan.limits.video_limit)
            .bind(plan.limits.user_limit)
            .bind(plan.limits.api_calls_limit)
            .bind(Json(&plan.overage_rates))
            .execute(&mut *tx)
            .await?;
        }

        for multiplier in &catalog.multipliers {
            sqlx::query(
                r#"
                INSERT INTO usage_multipliers (
                    id, metric, multiplier, conditions, active, description, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (id) DO UPDATE SET
                    metric = EXCLUDED.metric,
                    multiplier = EXCLUDED.multiplier,
                    conditions = EXCLUDED.conditions,
                    active = EXCLUDED.active,
                    description = EXCLUDED.description,
                    updated_at = NOW()
                "#,
            )
            .bind(multiplier.id)
            .bind(multiplier.metric.to_string())
            .bind(multiplier.multiplier)
            .bind(Json(&multiplier.conditions))
            .bind(multiplier.active)
            .bind(&multiplier.description)
            .execute(&mut *tx)
            .await?;
        }

        let ids: Vec<Uuid> = catalog.multipliers.iter().map(|m| m.id).collect();
        sqlx::query(
            "UPDATE usage_multipliers SET active = FALSE, updated_at = NOW() WHERE active AND NOT (id = ANY($1))",
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            plans = catalog.plans.len(),
            multipliers = catalog.multipliers.len(),
            "Synced billing catalog to database"
        );

        Ok(())
    }
}

fn config_error(context: &str, err: impl std::fmt::Display) -> BillingError {
    BillingError::InvalidBillingConfiguration(format!("{}: {}", context, err))
}

fn plan_from_row(row: &PgRow) -> BillingResult<PlanConfig> {
    let plan_id: String = row.try_get("plan_id")?;
    let tier: String = row.try_get("tier")?;
    let tier: PlanTier = tier
        .parse()
        .map_err(|e| config_error(&format!("plan {}", plan_id), e))?;
    let Json(overage_rates): Json<BTreeMap<MetricType, OverageRate>> =
        row.try_get("overage_rates")?;

    let plan = PlanConfig {
        name: row.try_get("name")?,
        tier,
        base_price: row.try_get::<Decimal, _>("base_price")?,
        currency: row.try_get("currency")?,
        limits: PlanLimits {
            storage_limit_bytes: row.try_get("storage_limit_bytes")?,
            bandwidth_limit_bytes: row.try_get("bandwidth_limit_bytes")?,
            video_limit: row.try_get("video_limit")?,
            user_limit: row.try_get("user_limit")?,
            api_calls_limit: row.try_get("api_calls_limit")?,
        },
        overage_rates,
        plan_id,
    };
    plan.validate()?;
    Ok(plan)
}

fn multiplier_from_row(row: &PgRow) -> BillingResult<UsageMultiplier> {
    let metric: String = row.try_get("metric")?;
    let Json(conditions): Json<Vec<MultiplierCondition>> = row.try_get("conditions")?;
    Ok(UsageMultiplier {
        id: row.try_get("id")?,
        metric: metric
            .parse()
            .map_err(|e| config_error("usage multiplier", e))?,
        multiplier: row.try_get("multiplier")?,
        conditions,
        active: row.try_get("active")?,
        description: row.try_get("description")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> BillingResult<TenantUsageSnapshot> {
    Ok(TenantUsageSnapshot {
        tenant_id: TenantId(row.try_get("tenant_id")?),
        period: BillingPeriod {
            start: row.try_get("period_start")?,
            end: row.try_get("period_end")?,
        },
        counters: RawUsageCounters {
            storage_bytes: row.try_get("storage_bytes")?,
            bandwidth_bytes: row.try_get("bandwidth_bytes")?,
            video_count: row.try_get("video_count")?,
            user_count: row.try_get("user_count")?,
            unique_viewers: row.try_get("unique_viewers")?,
            view_count: row.try_get("view_count")?,
            api_calls: row.try_get("api_calls")?,
        },
        aggregated_at: row.try_get("aggregated_at")?,
    })
}

fn invoice_from_row(row: &PgRow) -> BillingResult<TenantInvoice> {
    let status: String = row.try_get("status")?;
    let Json(usage_breakdown): Json<Vec<MetricCharge>> = row.try_get("usage_breakdown")?;
    Ok(TenantInvoice {
        id: row.try_get("id")?,
        tenant_id: TenantId(row.try_get("tenant_id")?),
        plan_id: row.try_get("plan_id")?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        base_amount: row.try_get("base_amount")?,
        overage_amount: row.try_get("overage_amount")?,
        total_amount: row.try_get("total_amount")?,
        currency: row.try_get("currency")?,
        usage_breakdown,
        status: status.parse()?,
        payment_reference: row.try_get("payment_reference")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finalized_at: row.try_get("finalized_at")?,
    })
}

#[async_trait]
impl UsageFeed for PgBillingStore {
    async fn period_counters(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<RawUsageCounters> {
        // Bandwidth is the served file size summed per view, as the platform
        // records it; partial plays are not accounted for.
        let counters: RawUsageCounters = sqlx::query_as(
            r#"
            SELECT
                COALESCE((
                    SELECT SUM(file_size_bytes) FROM videos
                    WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3
                ), 0)::BIGINT AS storage_bytes,
                COALESCE((
                    SELECT SUM(v.file_size_bytes)
                    FROM video_views vv
                    JOIN videos v ON v.id = vv.video_id
                    WHERE vv.tenant_id = $1 AND vv.viewed_at >= $2 AND vv.viewed_at < $3
                ), 0)::BIGINT AS bandwidth_bytes,
                (
                    SELECT COUNT(*) FROM videos
                    WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3
                ) AS video_count,
                (
                    SELECT COUNT(DISTINCT user_id) FROM tenant_users
                    WHERE tenant_id = $1 AND created_at < $3
                      AND (deactivated_at IS NULL OR deactivated_at > $2)
                ) AS user_count,
                (
                    SELECT COUNT(DISTINCT viewer_id) FROM video_views
                    WHERE tenant_id = $1 AND viewed_at >= $2 AND viewed_at < $3
                ) AS unique_viewers,
                (
                    SELECT COUNT(*) FROM video_views
                    WHERE tenant_id = $1 AND viewed_at >= $2 AND viewed_at < $3
                ) AS view_count,
                COALESCE((
                    SELECT SUM(request_count) FROM api_usage
                    WHERE tenant_id = $1 AND occurred_at >= $2 AND occurred_at < $3
                ), 0)::BIGINT AS api_calls
            "#,
        )
        .bind(tenant_id.0)
        .bind(period.start)
        .bind(period.end)
        .fetch_one(&self.pool)
        .await?;

        Ok(counters)
    }
}

#[async_trait]
impl BillingConfigSource for PgBillingStore {
    async fn tenant_profile(&self, tenant_id: TenantId) -> BillingResult<Option<TenantProfile>> {
        let row: Option<(Uuid, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT id, plan_id, region FROM tenants WHERE id = $1")
                .bind(tenant_id.0)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, plan_id, region)| TenantProfile {
            tenant_id: TenantId(id),
            plan_id,
            region,
        }))
    }

    async fn plan(&self, plan_id: &str) -> BillingResult<Option<PlanConfig>> {
        let row = sqlx::query(
            r#"
            SELECT plan_id, name, tier, base_price, currency,
                   storage_limit_bytes, bandwidth_limit_bytes, video_limit,
                   user_limit, api_calls_limit, overage_rates
            FROM billing_plans
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(plan_from_row).transpose()
    }

    async fn active_multipliers(&self) -> BillingResult<Vec<UsageMultiplier>> {
        let rows = sqlx::query(
            r#"
            SELECT id, metric, multiplier, conditions, active, description
            FROM usage_multipliers
            WHERE active
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(multiplier_from_row).collect()
    }

    async fn billable_tenants(&self) -> BillingResult<Vec<TenantId>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM tenants WHERE status = 'active' AND plan_id IS NOT NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| TenantId(id)).collect())
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn upsert_snapshot(&self, snapshot: &TenantUsageSnapshot) -> BillingResult<()> {
        let c = &snapshot.counters;
        sqlx::query(
            r#"
            INSERT INTO tenant_usage_snapshots (
                tenant_id, period_start, period_end,
                storage_bytes, bandwidth_bytes, video_count, user_count,
                unique_viewers, view_count, api_calls, aggregated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tenant_id, period_start) DO UPDATE SET
                period_end = EXCLUDED.period_end,
                storage_bytes = EXCLUDED.storage_bytes,
                bandwidth_bytes = EXCLUDED.bandwidth_bytes,
                video_count = EXCLUDED.video_count,
                user_count = EXCLUDED.user_count,
                unique_viewers = EXCLUDED.unique_viewers,
                view_count = EXCLUDED.view_count,
                api_calls = EXCLUDED.api_calls,
                aggregated_at = EXCLUDED.aggregated_at
            "#,
        )
        .bind(snapshot.tenant_id.0)
        .bind(snapshot.period.start)
        .bind(snapshot.period.end)
        .bind(c.storage_bytes)
        .bind(c.bandwidth_bytes)
        .bind(c.video_count)
        .bind(c.user_count)
        .bind(c.unique_viewers)
        .bind(c.view_count)
        .bind(c.api_calls)
        .bind(snapshot.aggregated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_snapshot(
        &self,
        tenant_id: TenantId,
        period_start: OffsetDateTime,
    ) -> BillingResult<Option<TenantUsageSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, period_start, period_end,
                   storage_bytes, bandwidth_bytes, video_count, user_count,
                   unique_viewers, view_count, api_calls, aggregated_at
            FROM tenant_usage_snapshots
            WHERE tenant_id = $1 AND period_start = $2
            "#,
        )
        .bind(tenant_id.0)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn find_invoice(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<Option<TenantInvoice>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tenant_invoices WHERE tenant_id = $1 AND period_start = $2 AND period_end = $3",
            INVOICE_COLUMNS
        ))
        .bind(tenant_id.0)
        .bind(period.start)
        .bind(period.end)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<TenantInvoice>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tenant_invoices WHERE id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn list_invoices(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<TenantInvoice>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tenant_invoices WHERE tenant_id = $1 ORDER BY period_start DESC LIMIT $2",
            INVOICE_COLUMNS
        ))
        .bind(tenant_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(invoice_from_row).collect()
    }

    async fn insert_invoice(&self, invoice: &TenantInvoice) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO tenant_invoices (
                id, tenant_id, plan_id, period_start, period_end,
                base_amount, overage_amount, total_amount, currency,
                usage_breakdown, status, payment_reference,
                created_at, updated_at, finalized_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.tenant_id.0)
        .bind(&invoice.plan_id)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.base_amount)
        .bind(invoice.overage_amount)
        .bind(invoice.total_amount)
        .bind(&invoice.currency)
        .bind(Json(&invoice.usage_breakdown))
        .bind(invoice.status.as_str())
        .bind(&invoice.payment_reference)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .bind(invoice.finalized_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                Err(BillingError::ConcurrentInvoiceConflict {
                    tenant_id: invoice.tenant_id,
                    period_start: invoice.period_start,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn overwrite_draft(&self, invoice: &TenantInvoice) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_invoices SET
                plan_id = $2,
                base_amount = $3,
                overage_amount = $4,
                total_amount = $5,
                currency = $6,
                usage_breakdown = $7,
                updated_at = $8
            WHERE id = $1 AND status = 'draft'
            "#,
        )
        .bind(invoice.id)
        .bind(&invoice.plan_id)
        .bind(invoice.base_amount)
        .bind(invoice.overage_amount)
        .bind(invoice.total_amount)
        .bind(&invoice.currency)
        .bind(Json(&invoice.usage_breakdown))
        .bind(invoice.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn transition_status(
        &self,
        invoice_id: Uuid,
        from: InvoiceStatus,
        to: InvoiceStatus,
        payment_reference: Option<&str>,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_invoices SET
                status = $3,
                updated_at = $4,
                finalized_at = CASE WHEN $3 = 'finalized' THEN $4 ELSE finalized_at END,
                payment_reference = COALESCE($5, payment_reference)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(invoice_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(at)
        .bind(payment_reference)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM tenant_invoices WHERE id = $1")
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(BillingError::InvoiceNotFound(invoice_id)),
        }
    }

    async fn log_event(&self, event: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (
                id, tenant_id, event_type, invoice_id, event_data, actor_type, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_id.0)
        .bind(&event.event_type)
        .bind(event.invoice_id)
        .bind(&event.event_data)
        .bind(&event.actor_type)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_events(&self, tenant_id: TenantId, limit: i64) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, event_type, invoice_id, event_data, actor_type, created_at
            FROM billing_events
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
