//! Usage metering and tiered overage billing engine
//!
//! Converts raw per-tenant usage over a billing period into one idempotent
//! invoice per tenant and period:
//!
//! - [`usage`]: period aggregation into usage snapshots
//! - [`multiplier`]: conditional usage multipliers
//! - [`overage`]: flat and graduated tiered overage pricing
//! - [`invoice`]: invoice composition and finalization
//! - [`payment`]: the payment collaborator boundary
//! - [`service`]: per-tenant and whole-period billing runs

pub mod config;
pub mod error;
pub mod events;
pub mod invoice;
pub mod money;
pub mod multiplier;
pub mod overage;
pub mod payment;
pub mod plan;
pub mod service;
pub mod store;
pub mod usage;

pub use config::{BillingConfig, PaymentGatewayConfig};
pub use error::{BillingError, BillingResult};
pub use events::{ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType};
pub use invoice::{InvoiceComposer, InvoiceStatus, TenantInvoice};
pub use money::{currency_minor_units, round_to_minor_units};
pub use multiplier::{MultiplierCondition, MultiplierResolver, TenantAttributes, UsageMultiplier};
pub use overage::{MetricCharge, OverageCalculator, TierSlice};
pub use payment::{
    verify_callback_signature, HttpPaymentDispatcher, PaymentCallback, PaymentOutcome,
    PaymentReceipt, PaymentRequest, PaymentRequestDispatcher,
};
pub use plan::{BillingCatalog, OverageRate, PlanConfig, PlanLimits, RateTier, TenantProfile};
pub use service::{BillingRunReport, BillingService, TenantRunFailure, TenantRunSummary};
pub use store::{
    BillingConfigSource, BillingStore, InMemoryBillingStore, PgBillingStore, UsageFeed,
};
pub use usage::{BillingPeriod, RawUsageCounters, TenantUsageSnapshot, UsagePeriodAggregator};
