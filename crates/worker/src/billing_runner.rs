//! Scheduled billing runs
//!
//! Each tick bills every tenant for the calendar month before the tick.
//! Re-running a month is safe: finalized invoices are returned as stored and
//! only still-unrequested payments are dispatched again.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use vidbill_billing::{BillingPeriod, BillingResult, BillingRunReport, BillingService};

/// Runs whole-period billing, never more than one run at a time
#[derive(Clone)]
pub struct BillingRunner {
    service: BillingService,
    running: Arc<Mutex<()>>,
}

impl BillingRunner {
    pub fn new(service: BillingService) -> Self {
        Self {
            service,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Bill every tenant for `period`. Returns `None` when another run is
    /// still in progress.
    pub async fn run_for(&self, period: &BillingPeriod) -> BillingResult<Option<BillingRunReport>> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::warn!(period = %period, "Previous billing run still in progress, skipping");
            return Ok(None);
        };

        let started = std::time::Instant::now();
        let report = self.service.run_period_for_all(period).await?;

        tracing::info!(
            period = %period,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Billing run completed"
        );
        for failure in report.failed.iter().filter(|f| f.operator_fatal) {
            tracing::error!(
                tenant_id = %failure.tenant_id,
                code = %failure.code,
                error = %failure.message,
                "Tenant needs operator attention"
            );
        }

        Ok(Some(report))
    }

    /// Bill the calendar month preceding `now`
    pub async fn run_previous_month(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Option<BillingRunReport>> {
        let period = BillingPeriod::previous_month(now)?;
        self.run_for(&period).await
    }

    /// Register the monthly job on `scheduler`
    pub async fn schedule(&self, scheduler: &JobScheduler, cron: &str) -> anyhow::Result<()> {
        let runner = self.clone();
        let job = Job::new_async(cron, move |_id, _scheduler| {
            let runner = runner.clone();
            Box::pin(async move {
                if let Err(e) = runner.run_previous_month(OffsetDateTime::now_utc()).await {
                    tracing::error!(code = e.code(), error = %e, "Scheduled billing run failed");
                }
            })
        })?;

        scheduler.add(job).await?;
        tracing::info!(schedule = %cron, "Billing job scheduled");
        Ok(())
    }
}
