//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;
use vidbill_billing::BillingService;

#[derive(Clone)]
pub struct AppState {
    pub billing: BillingService,
    /// Checked by the readiness probes; `None` when running on the in-memory store
    pub pool: Option<PgPool>,
    pub webhook_secret: Arc<str>,
}

impl AppState {
    pub fn new(billing: BillingService, pool: Option<PgPool>, webhook_secret: impl Into<Arc<str>>) -> Self {
        Self {
            billing,
            pool,
            webhook_secret: webhook_secret.into(),
        }
    }
}
