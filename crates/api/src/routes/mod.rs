//! API routes

pub mod billing_runs;
pub mod health;
pub mod invoices;
pub mod payments;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let api_v1_routes = Router::new()
        .route(
            "/tenants/:tenant_id/billing-runs",
            post(billing_runs::run_tenant_billing),
        )
        .route("/tenants/:tenant_id/invoices", get(invoices::list_tenant_invoices))
        .route("/invoices/:invoice_id", get(invoices::get_invoice))
        .route("/payments/callback", post(payments::payment_callback));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
