//! Billing run orchestration
//!
//! A tenant's run is aggregate -> compose -> finalize -> request payment.
//! Runs for different tenants are independent tasks; the store's
//! `(tenant, period)` uniqueness and compare-and-set status updates are the
//! only coordination between them.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;
use vidbill_shared::TenantId;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEvent, BillingEventLogger, BillingEventType};
use crate::invoice::{InvoiceComposer, InvoiceStatus, TenantInvoice};
use crate::payment::{PaymentOutcome, PaymentRequest, PaymentRequestDispatcher};
use crate::store::{BillingConfigSource, BillingStore, UsageFeed};
use crate::usage::{BillingPeriod, UsagePeriodAggregator};

/// Tenant whose run produced an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRunSummary {
    pub tenant_id: TenantId,
    pub invoice_id: Uuid,
    pub status: InvoiceStatus,
    pub total_amount: Decimal,
    pub currency: String,
}

impl From<&TenantInvoice> for TenantRunSummary {
    fn from(invoice: &TenantInvoice) -> Self {
        Self {
            tenant_id: invoice.tenant_id,
            invoice_id: invoice.id,
            status: invoice.status,
            total_amount: invoice.total_amount,
            currency: invoice.currency.clone(),
        }
    }
}

/// Tenant whose run stopped on an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRunFailure {
    pub tenant_id: TenantId,
    pub code: String,
    pub message: String,
    pub operator_fatal: bool,
}

/// Outcome of billing every tenant for one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRunReport {
    pub period: BillingPeriod,
    pub succeeded: Vec<TenantRunSummary>,
    pub failed: Vec<TenantRunFailure>,
}

impl BillingRunReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Entry point of the billing engine
#[derive(Clone)]
pub struct BillingService {
    config: Arc<dyn BillingConfigSource>,
    store: Arc<dyn BillingStore>,
    aggregator: UsagePeriodAggregator,
    composer: InvoiceComposer,
    dispatcher: Arc<dyn PaymentRequestDispatcher>,
    events: BillingEventLogger,
    settings: BillingConfig,
}

impl BillingService {
    pub fn new(
        feed: Arc<dyn UsageFeed>,
        config: Arc<dyn BillingConfigSource>,
        store: Arc<dyn BillingStore>,
        dispatcher: Arc<dyn PaymentRequestDispatcher>,
        settings: BillingConfig,
    ) -> Self {
        let aggregator = UsagePeriodAggregator::new(feed, config.clone(), store.clone());
        let composer = InvoiceComposer::new(config.clone(), store.clone(), aggregator.clone());
        Self {
            events: BillingEventLogger::new(store.clone()),
            config,
            store,
            aggregator,
            composer,
            dispatcher,
            settings,
        }
    }

    pub fn aggregator(&self) -> &UsagePeriodAggregator {
        &self.aggregator
    }

    pub fn composer(&self) -> &InvoiceComposer {
        &self.composer
    }

    /// Bill one tenant for one period
    pub async fn run_tenant_period(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
        actor: ActorType,
    ) -> BillingResult<TenantInvoice> {
        let result = self.run_tenant_period_inner(tenant_id, period).await;

        if let Err(e) = &result {
            if e.is_operator_fatal() {
                tracing::error!(
                    tenant_id = %tenant_id,
                    period = %period,
                    code = e.code(),
                    error = %e,
                    "Billing run failed, operator action required"
                );
                self.events
                    .log_run_failed(tenant_id, &period.start_rfc3339(), e, actor)
                    .await;
            } else {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    period = %period,
                    error = %e,
                    "Billing run failed"
                );
            }
        }

        result
    }

    async fn run_tenant_period_inner(
        &self,
        tenant_id: TenantId,
        period: &BillingPeriod,
    ) -> BillingResult<TenantInvoice> {
        if let Some(existing) = self.store.find_invoice(tenant_id, period).await? {
            if existing.status.is_frozen() {
                return self.dispatch_if_pending(existing).await;
            }
        }

        // Fresh counters every run; a draft is recomputed from them
        self.aggregator.aggregate_period(tenant_id, period).await?;
        let draft = self.composer.compose_period(tenant_id, period).await?;
        let invoice = self.composer.finalize(&draft).await?;

        self.dispatch_if_pending(invoice).await
    }

    /// Request payment for a finalized invoice with something to collect.
    /// A failed dispatch leaves the invoice finalized for the next run.
    async fn dispatch_if_pending(&self, invoice: TenantInvoice) -> BillingResult<TenantInvoice> {
        if invoice.status != InvoiceStatus::Finalized {
            return Ok(invoice);
        }
        if invoice.is_zero_total() {
            tracing::info!(
                tenant_id = %invoice.tenant_id,
                invoice_id = %invoice.id,
                "Zero-total invoice, no payment requested"
            );
            return Ok(invoice);
        }

        let request = PaymentRequest::for_invoice(&invoice);
        let receipt = match self.dispatcher.request_payment(&request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::warn!(
                    tenant_id = %invoice.tenant_id,
                    invoice_id = %invoice.id,
                    error = %e,
                    "Payment request dispatch failed, invoice stays finalized"
                );
                self.events.log_dispatch_failed(&invoice, &e).await;
                return Ok(invoice);
            }
        };

        let moved = self
            .store
            .transition_status(
                invoice.id,
                InvoiceStatus::Finalized,
                InvoiceStatus::PaymentRequested,
                Some(&receipt.reference),
                OffsetDateTime::now_utc(),
            )
            .await?;
        let current = self.load_invoice(invoice.id).await?;

        if moved {
            tracing::info!(
                tenant_id = %current.tenant_id,
                invoice_id = %current.id,
                payment_reference = %receipt.reference,
                total_amount = %current.total_amount,
                "Payment requested"
            );
            self.events
                .log_invoice(BillingEventType::PaymentRequested, &current)
                .await;
        }

        Ok(current)
    }

    /// Bill every billable tenant for one period. One tenant's failure
    /// never stops the others.
    pub async fn run_period_for_all(&self, period: &BillingPeriod) -> BillingResult<BillingRunReport> {
        let tenants = self.config.billable_tenants().await?;
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_tenants));

        tracing::info!(
            period = %period,
            tenants = tenants.len(),
            max_concurrent = self.settings.max_concurrent_tenants,
            "Starting billing run"
        );

        let mut tasks = JoinSet::new();
        for tenant_id in tenants {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| BillingError::Internal(format!("billing semaphore closed: {}", e)))?;
            let service = self.clone();
            let period = *period;
            tasks.spawn(async move {
                let _permit = permit;
                let result = service
                    .run_tenant_period(tenant_id, &period, ActorType::System)
                    .await;
                (tenant_id, result)
            });
        }

        let mut report = BillingRunReport {
            period: *period,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(invoice))) => report.succeeded.push(TenantRunSummary::from(&invoice)),
                Ok((tenant_id, Err(e))) => report.failed.push(TenantRunFailure {
                    tenant_id,
                    code: e.code().to_string(),
                    message: e.to_string(),
                    operator_fatal: e.is_operator_fatal(),
                }),
                Err(e) => {
                    tracing::error!(error = %e, "Billing task panicked");
                }
            }
        }

        report.succeeded.sort_by_key(|s| s.tenant_id);
        report.failed.sort_by_key(|f| f.tenant_id);

        tracing::info!(
            period = %period,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Billing run complete"
        );

        Ok(report)
    }

    /// Apply the collaborator's final outcome to an invoice
    pub async fn record_payment_outcome(
        &self,
        invoice_id: Uuid,
        outcome: PaymentOutcome,
        payment_reference: Option<&str>,
    ) -> BillingResult<TenantInvoice> {
        let invoice = self.load_invoice(invoice_id).await?;
        let target = outcome.invoice_status();
        let now = OffsetDateTime::now_utc();

        match invoice.status {
            // Replayed callback
            status if status == target => return Ok(invoice),
            // Callback arrived before the PaymentRequested write landed
            InvoiceStatus::Finalized => {
                self.store
                    .transition_status(
                        invoice_id,
                        InvoiceStatus::Finalized,
                        InvoiceStatus::PaymentRequested,
                        None,
                        now,
                    )
                    .await?;
            }
            InvoiceStatus::PaymentRequested => {}
            other => {
                return Err(BillingError::InvalidStatusTransition {
                    from: other,
                    to: target,
                })
            }
        }

        let moved = self
            .store
            .transition_status(
                invoice_id,
                InvoiceStatus::PaymentRequested,
                target,
                payment_reference,
                now,
            )
            .await?;
        let current = self.load_invoice(invoice_id).await?;

        if !moved {
            return if current.status == target {
                Ok(current)
            } else {
                Err(BillingError::InvalidStatusTransition {
                    from: current.status,
                    to: target,
                })
            };
        }

        let event_type = match outcome {
            PaymentOutcome::Paid => BillingEventType::PaymentSucceeded,
            PaymentOutcome::Failed => BillingEventType::PaymentFailed,
        };
        tracing::info!(
            tenant_id = %current.tenant_id,
            invoice_id = %current.id,
            status = %current.status,
            "Payment outcome recorded"
        );
        self.events
            .log_payment_outcome(&current, event_type, payment_reference, current.total_amount)
            .await;

        Ok(current)
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<TenantInvoice> {
        self.load_invoice(invoice_id).await
    }

    pub async fn list_invoices(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<TenantInvoice>> {
        self.store.list_invoices(tenant_id, limit).await
    }

    pub async fn list_events(&self, tenant_id: TenantId, limit: i64) -> BillingResult<Vec<BillingEvent>> {
        self.events.get_events_for_tenant(tenant_id, limit).await
    }

    async fn load_invoice(&self, invoice_id: Uuid) -> BillingResult<TenantInvoice> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::BYTES_PER_GB;
    use crate::payment::PaymentReceipt;
    use crate::plan::{BillingCatalog, OverageRate, PlanConfig, PlanLimits};
    use crate::store::memory::InMemoryBillingStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use time::macros::datetime;
    use vidbill_shared::{MetricType, PlanTier};

    #[derive(Default)]
    struct RecordingDispatcher {
        requests: Mutex<Vec<PaymentRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl PaymentRequestDispatcher for RecordingDispatcher {
        async fn request_payment(&self, request: &PaymentRequest) -> BillingResult<PaymentReceipt> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(BillingError::PaymentDispatch {
                    message: "gateway down".into(),
                    transient: true,
                });
            }
            Ok(PaymentReceipt {
                reference: format!("pr_{}", request.invoice_id.simple()),
            })
        }
    }

    fn catalog() -> BillingCatalog {
        let mut overage_rates = BTreeMap::new();
        overage_rates.insert(MetricType::Storage, OverageRate::flat(dec!(0.10)));
        BillingCatalog {
            plans: vec![
                PlanConfig {
                    plan_id: "pro".into(),
                    name: "Professional".into(),
                    tier: PlanTier::Professional,
                    base_price: dec!(49),
                    currency: "USD".into(),
                    limits: PlanLimits {
                        storage_limit_bytes: 100 * BYTES_PER_GB,
                        ..Default::default()
                    },
                    overage_rates,
                },
                PlanConfig {
                    plan_id: "free".into(),
                    name: "Free".into(),
                    tier: PlanTier::Free,
                    base_price: Decimal::ZERO,
                    currency: "USD".into(),
                    limits: PlanLimits::default(),
                    overage_rates: BTreeMap::new(),
                },
            ],
            multipliers: vec![],
        }
    }

    fn service(fail: bool) -> (Arc<InMemoryBillingStore>, Arc<RecordingDispatcher>, BillingService) {
        let store = Arc::new(InMemoryBillingStore::with_catalog(catalog()));
        let dispatcher = Arc::new(RecordingDispatcher {
            fail,
            ..Default::default()
        });
        let service = BillingService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            dispatcher.clone(),
            BillingConfig::default(),
        );
        (store, dispatcher, service)
    }

    fn period() -> BillingPeriod {
        BillingPeriod::new(datetime!(2026-02-01 00:00 UTC), datetime!(2026-03-01 00:00 UTC)).unwrap()
    }

    #[tokio::test]
    async fn test_run_requests_payment() {
        let (store, dispatcher, service) = service(false);
        let tenant_id = TenantId::new();
        store.add_tenant(tenant_id, Some("pro"), None);
        store.record_video(tenant_id, 150 * BYTES_PER_GB, datetime!(2026-02-05 00:00 UTC));

        let invoice = service
            .run_tenant_period(tenant_id, &period(), ActorType::System)
            .await
            .unwrap();

        assert_eq!(invoice.status, InvoiceStatus::PaymentRequested);
        assert_eq!(invoice.total_amount, dec!(54.00));
        assert!(invoice.payment_reference.unwrap().starts_with("pr_"));

        let requests = dispatcher.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, dec!(54.00));
    }

    #[tokio::test]
    async fn test_rerun_does_not_dispatch_twice() {
        let (store, dispatcher, service) = service(false);
        let tenant_id = TenantId::new();
        store.add_tenant(tenant_id, Some("pro"), None);

        let first = service
            .run_tenant_period(tenant_id, &period(), ActorType::System)
            .await
            .unwrap();
        let second = service
            .run_tenant_period(tenant_id, &period(), ActorType::System)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(dispatcher.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_total_invoice_is_not_dispatched() {
        let (store, dispatcher, service) = service(false);
        let tenant_id = TenantId::new();
        store.add_tenant(tenant_id, Some("free"), None);

        let invoice = service
            .run_tenant_period(tenant_id, &period(), ActorType::System)
            .await
            .unwrap();

        assert_eq!(invoice.status, InvoiceStatus::Finalized);
        assert!(dispatcher.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dispatch_leaves_invoice_finalized() {
        let (store, dispatcher, service) = service(true);
        let tenant_id = TenantId::new();
        store.add_tenant(tenant_id, Some("pro"), None);

        let invoice = service
            .run_tenant_period(tenant_id, &period(), ActorType::System)
            .await
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Finalized);

        // Next run retries the dispatch for the same invoice
        let again = service
            .run_tenant_period(tenant_id, &period(), ActorType::System)
            .await
            .unwrap();
        assert_eq!(again.id, invoice.id);
        assert_eq!(dispatcher.requests.lock().unwrap().len(), 2);

        let events = service.list_events(tenant_id, 50).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == "PAYMENT_DISPATCH_FAILED"));
    }

    #[tokio::test]
    async fn test_fatal_error_is_recorded_for_operators() {
        let (store, _dispatcher, service) = service(false);
        let tenant_id = TenantId::new();
        store.add_tenant(tenant_id, Some("retired-plan"), None);

        let result = service
            .run_tenant_period(tenant_id, &period(), ActorType::Operator)
            .await;
        assert!(matches!(result, Err(BillingError::TenantNotFound(_))));

        let events = service.list_events(tenant_id, 10).await.unwrap();
        assert_eq!(events[0].event_type, "BILLING_RUN_FAILED");
        assert_eq!(events[0].actor_type, "operator");
        assert_eq!(store.invoice_count(), 0);
    }

    #[tokio::test]
    async fn test_payment_outcome_lifecycle() {
        let (store, _dispatcher, service) = service(false);
        let tenant_id = TenantId::new();
        store.add_tenant(tenant_id, Some("pro"), None);
        let invoice = service
            .run_tenant_period(tenant_id, &period(), ActorType::System)
            .await
            .unwrap();

        let paid = service
            .record_payment_outcome(invoice.id, PaymentOutcome::Paid, Some("ch_123"))
            .await
            .unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.payment_reference.as_deref(), Some("ch_123"));

        // Same outcome again is a no-op, the opposite one is refused
        let replay = service
            .record_payment_outcome(invoice.id, PaymentOutcome::Paid, Some("ch_123"))
            .await
            .unwrap();
        assert_eq!(replay, paid);
        assert!(matches!(
            service
                .record_payment_outcome(invoice.id, PaymentOutcome::Failed, None)
                .await,
            Err(BillingError::InvalidStatusTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_outcome_for_draft_is_refused() {
        let (store, _dispatcher, service) = service(false);
        let tenant_id = TenantId::new();
        store.add_tenant(tenant_id, Some("pro"), None);
        let draft = service
            .composer()
            .compose_period(tenant_id, &period())
            .await
            .unwrap();

        assert!(matches!(
            service
                .record_payment_outcome(draft.id, PaymentOutcome::Paid, None)
                .await,
            Err(BillingError::InvalidStatusTransition {
                from: InvoiceStatus::Draft,
                to: InvoiceStatus::Paid
            })
        ));
    }

    #[tokio::test]
    async fn test_outcome_on_finalized_invoice_is_accepted() {
        let (store, _dispatcher, service) = service(true);
        let tenant_id = TenantId::new();
        store.add_tenant(tenant_id, Some("pro"), None);
        let invoice = service
            .run_tenant_period(tenant_id, &period(), ActorType::System)
            .await
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Finalized);

        let failed = service
            .record_payment_outcome(invoice.id, PaymentOutcome::Failed, None)
            .await
            .unwrap();
        assert_eq!(failed.status, InvoiceStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_for_all_isolates_failures() {
        let (store, _dispatcher, service) = service(false);
        let good = TenantId::new();
        let broken = TenantId::new();
        store.add_tenant(good, Some("pro"), None);
        store.add_tenant(broken, Some("retired-plan"), None);
        store.add_tenant(TenantId::new(), None, None);

        let report = service.run_period_for_all(&period()).await.unwrap();

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.succeeded[0].tenant_id, good);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].tenant_id, broken);
        assert_eq!(report.failed[0].code, "TENANT_NOT_FOUND");
        assert!(report.failed[0].operator_fatal);
        assert!(!report.is_clean());
    }
}
