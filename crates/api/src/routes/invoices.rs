//! Invoice lookups

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vidbill_billing::TenantInvoice;
use vidbill_shared::TenantId;

use crate::{error::ApiResult, state::AppState};

const DEFAULT_LIMIT: i64 = 12;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListInvoicesQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct InvoiceListResponse {
    pub tenant_id: TenantId,
    pub invoices: Vec<TenantInvoice>,
}

/// List a tenant's invoices, newest period first
pub async fn list_tenant_invoices(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ListInvoicesQuery>,
) -> ApiResult<Json<InvoiceListResponse>> {
    let tenant_id = TenantId::from(tenant_id);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let invoices = state.billing.list_invoices(tenant_id, limit).await?;

    Ok(Json(InvoiceListResponse {
        tenant_id,
        invoices,
    }))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<TenantInvoice>> {
    Ok(Json(state.billing.get_invoice(invoice_id).await?))
}
