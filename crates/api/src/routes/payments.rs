//! Payment collaborator status callback

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use uuid::Uuid;
use vidbill_billing::payment::SIGNATURE_HEADER;
use vidbill_billing::{verify_callback_signature, InvoiceStatus, PaymentCallback};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub invoice_id: Uuid,
    pub status: InvoiceStatus,
}

/// Apply a signed payment outcome. Replays of an applied outcome succeed.
pub async fn payment_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<CallbackResponse>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Payment callback missing signature header");
            ApiError::InvalidSignature
        })?;

    verify_callback_signature(&state.webhook_secret, &body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Payment callback signature verification failed");
        ApiError::InvalidSignature
    })?;

    let callback: PaymentCallback = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid callback body: {}", e)))?;

    tracing::info!(
        invoice_id = %callback.invoice_id,
        outcome = ?callback.outcome,
        "Payment callback verified"
    );

    let invoice = state
        .billing
        .record_payment_outcome(
            callback.invoice_id,
            callback.outcome,
            callback.payment_reference.as_deref(),
        )
        .await?;

    Ok((
        StatusCode::OK,
        Json(CallbackResponse {
            invoice_id: invoice.id,
            status: invoice.status,
        }),
    ))
}
