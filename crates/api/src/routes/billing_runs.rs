//! Operator-triggered billing runs

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;
use vidbill_billing::{ActorType, BillingPeriod, TenantInvoice};
use vidbill_shared::TenantId;

use crate::{error::ApiResult, state::AppState};

/// Billing run request body
#[derive(Debug, Deserialize)]
pub struct BillingRunRequest {
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
}

/// Aggregate, compose, finalize and dispatch one tenant's invoice for a period.
/// Safe to repeat: an issued invoice is returned unchanged.
pub async fn run_tenant_billing(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<BillingRunRequest>,
) -> ApiResult<Json<TenantInvoice>> {
    let tenant_id = TenantId::from(tenant_id);
    let period = BillingPeriod::new(request.period_start, request.period_end)?;

    tracing::info!(
        tenant_id = %tenant_id,
        period = %period,
        "Operator billing run requested"
    );

    let invoice = state
        .billing
        .run_tenant_period(tenant_id, &period, ActorType::Operator)
        .await?;

    Ok(Json(invoice))
}
