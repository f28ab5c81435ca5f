//! Billing Events Module
//!
//! Append-only billing event log. Every step of a billing run leaves an
//! event behind so operators can reconstruct why an invoice carries the
//! amount it does, and why a tenant's run stopped.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vidbill_shared::TenantId;

use crate::error::{BillingError, BillingResult};
use crate::invoice::TenantInvoice;
use crate::store::BillingStore;
use crate::usage::TenantUsageSnapshot;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Metering
    UsageAggregated,

    // Invoicing
    InvoiceDrafted,
    InvoiceFinalized,
    InvoiceConflictRecovered,

    // Payment collaborator
    PaymentRequested,
    PaymentDispatchFailed,
    PaymentSucceeded,
    PaymentFailed,

    // Operator attention
    BillingRunFailed,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::UsageAggregated => "USAGE_AGGREGATED",
            BillingEventType::InvoiceDrafted => "INVOICE_DRAFTED",
            BillingEventType::InvoiceFinalized => "INVOICE_FINALIZED",
            BillingEventType::InvoiceConflictRecovered => "INVOICE_CONFLICT_RECOVERED",
            BillingEventType::PaymentRequested => "PAYMENT_REQUESTED",
            BillingEventType::PaymentDispatchFailed => "PAYMENT_DISPATCH_FAILED",
            BillingEventType::PaymentSucceeded => "PAYMENT_SUCCEEDED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::BillingRunFailed => "BILLING_RUN_FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// Scheduled or engine-internal work
    System,
    /// Operator triggering a run through the API
    Operator,
    /// Payment collaborator callback
    PaymentGateway,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::System => write!(f, "system"),
            ActorType::Operator => write!(f, "operator"),
            ActorType::PaymentGateway => write!(f, "payment_gateway"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub invoice_id: Option<Uuid>,
    pub event_data: serde_json::Value,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    tenant_id: TenantId,
    event_type: BillingEventType,
    invoice_id: Option<Uuid>,
    event_data: serde_json::Value,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    /// Create a new event builder
    pub fn new(tenant_id: TenantId, event_type: BillingEventType) -> Self {
        Self {
            tenant_id,
            event_type,
            invoice_id: None,
            event_data: serde_json::json!({}),
            actor_type: ActorType::System,
        }
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Attach the invoice the event concerns
    pub fn invoice(mut self, invoice_id: Uuid) -> Self {
        self.invoice_id = Some(invoice_id);
        self
    }

    /// Set the actor type
    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn build(self) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            event_type: self.event_type.to_string(),
            invoice_id: self.invoice_id,
            event_data: self.event_data,
            actor_type: self.actor_type.to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Service for logging and querying billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn BillingStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Log a billing event
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event = builder.build();
        self.store.log_event(&event).await?;
        Ok(event.id)
    }

    /// Log an event where a failed write must not fail the caller.
    /// The audit trail is best effort; billing state lives on the invoice.
    pub async fn record(&self, builder: BillingEventBuilder) {
        let tenant_id = builder.tenant_id;
        let event_type = builder.event_type;
        if let Err(e) = self.log_event(builder).await {
            tracing::warn!(
                tenant_id = %tenant_id,
                event_type = %event_type,
                error = %e,
                "Failed to write billing event"
            );
        }
    }

    /// Get recent events for a tenant, newest first
    pub async fn get_events_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        self.store.list_events(tenant_id, limit).await
    }
}

// Implement FromRow for BillingEvent
impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for BillingEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: TenantId(row.try_get("tenant_id")?),
            event_type: row.try_get("event_type")?,
            invoice_id: row.try_get("invoice_id")?,
            event_data: row.try_get("event_data")?,
            actor_type: row.try_get("actor_type")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Convenience functions for common event logging scenarios
impl BillingEventLogger {
    pub async fn log_usage_aggregated(&self, snapshot: &TenantUsageSnapshot) {
        let builder = BillingEventBuilder::new(snapshot.tenant_id, BillingEventType::UsageAggregated)
            .data(serde_json::json!({
                "period_start": snapshot.period.start_rfc3339(),
                "period_end": snapshot.period.end_rfc3339(),
                "counters": snapshot.counters,
            }));
        self.record(builder).await
    }

    pub async fn log_invoice(&self, event_type: BillingEventType, invoice: &TenantInvoice) {
        let builder = BillingEventBuilder::new(invoice.tenant_id, event_type)
            .invoice(invoice.id)
            .data(serde_json::json!({
                "status": invoice.status.as_str(),
                "total_amount": invoice.total_amount,
                "currency": invoice.currency,
            }));
        self.record(builder).await
    }

    pub async fn log_payment_outcome(
        &self,
        invoice: &TenantInvoice,
        event_type: BillingEventType,
        payment_reference: Option<&str>,
        amount: Decimal,
    ) {
        let builder = BillingEventBuilder::new(invoice.tenant_id, event_type)
            .invoice(invoice.id)
            .data(serde_json::json!({
                "payment_reference": payment_reference,
                "amount": amount,
                "currency": invoice.currency,
            }))
            .actor_type(ActorType::PaymentGateway);
        self.record(builder).await
    }

    pub async fn log_dispatch_failed(&self, invoice: &TenantInvoice, error: &BillingError) {
        let builder = BillingEventBuilder::new(invoice.tenant_id, BillingEventType::PaymentDispatchFailed)
            .invoice(invoice.id)
            .data(serde_json::json!({
                "error": error.to_string(),
                "transient": error.is_transient(),
            }));
        self.record(builder).await
    }

    /// Operator-facing record of a run that stopped on a fatal error
    pub async fn log_run_failed(
        &self,
        tenant_id: TenantId,
        period_start: &str,
        error: &BillingError,
        actor_type: ActorType,
    ) {
        let builder = BillingEventBuilder::new(tenant_id, BillingEventType::BillingRunFailed)
            .data(serde_json::json!({
                "period_start": period_start,
                "code": error.code(),
                "error": error.to_string(),
            }))
            .actor_type(actor_type);
        self.record(builder).await
    }
}
