//! Billing error types

use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;
use vidbill_shared::{MetricType, TenantId};

use crate::invoice::InvoiceStatus;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid billing period: {0}")]
    InvalidPeriod(String),

    #[error("Tenant not found or has no plan: {0}")]
    TenantNotFound(TenantId),

    #[error("Invalid billing configuration: {0}")]
    InvalidBillingConfiguration(String),

    #[error("{} active multipliers match tenant {tenant_id} for {metric}: {matched:?}", .matched.len())]
    AmbiguousMultiplier {
        tenant_id: TenantId,
        metric: MetricType,
        matched: Vec<Uuid>,
    },

    #[error("Concurrent invoice write for tenant {tenant_id} period starting {period_start}")]
    ConcurrentInvoiceConflict {
        tenant_id: TenantId,
        period_start: OffsetDateTime,
    },

    #[error("Invalid invoice status transition: {from} -> {to}")]
    InvalidStatusTransition {
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(Uuid),

    #[error("Payment dispatch failed: {message}")]
    PaymentDispatch { message: String, transient: bool },

    #[error("Payment callback signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors that abort a tenant's billing run and must reach an operator.
    /// Retrying any of these reproduces the same failure.
    pub fn is_operator_fatal(&self) -> bool {
        matches!(
            self,
            BillingError::InvalidPeriod(_)
                | BillingError::TenantNotFound(_)
                | BillingError::InvalidBillingConfiguration(_)
                | BillingError::AmbiguousMultiplier { .. }
        )
    }

    /// Returns true if this error is transient and the operation may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            BillingError::PaymentDispatch { transient, .. } => *transient,
            BillingError::Database(_) => true,
            _ => false,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::InvalidPeriod(_) => "INVALID_PERIOD",
            BillingError::TenantNotFound(_) => "TENANT_NOT_FOUND",
            BillingError::InvalidBillingConfiguration(_) => "INVALID_BILLING_CONFIGURATION",
            BillingError::AmbiguousMultiplier { .. } => "AMBIGUOUS_MULTIPLIER",
            BillingError::ConcurrentInvoiceConflict { .. } => "CONCURRENT_INVOICE_CONFLICT",
            BillingError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            BillingError::InvoiceNotFound(_) => "INVOICE_NOT_FOUND",
            BillingError::PaymentDispatch { .. } => "PAYMENT_DISPATCH_FAILED",
            BillingError::WebhookSignatureInvalid => "INVALID_SIGNATURE",
            BillingError::Database(_) => "DATABASE_ERROR",
            BillingError::Config(_) => "CONFIG_ERROR",
            BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidBillingConfiguration(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
