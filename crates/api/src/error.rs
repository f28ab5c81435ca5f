//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use vidbill_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Invalid payment callback signature")]
    InvalidSignature,

    // Engine errors
    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::InvalidSignature => (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE", self.to_string()),
            ApiError::Billing(err) => {
                let status = match err {
                    BillingError::InvalidPeriod(_) => StatusCode::BAD_REQUEST,
                    BillingError::TenantNotFound(_) | BillingError::InvoiceNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    BillingError::InvalidBillingConfiguration(_)
                    | BillingError::AmbiguousMultiplier { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    BillingError::ConcurrentInvoiceConflict { .. }
                    | BillingError::InvalidStatusTransition { .. } => StatusCode::CONFLICT,
                    BillingError::PaymentDispatch { .. } => StatusCode::BAD_GATEWAY,
                    BillingError::WebhookSignatureInvalid => StatusCode::UNAUTHORIZED,
                    BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };

                // Server-side details stay in the logs
                let message = if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
                    tracing::error!(code = err.code(), error = %err, "Billing request failed");
                    "Internal server error".to_string()
                } else {
                    err.to_string()
                };

                (status, err.code(), message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
