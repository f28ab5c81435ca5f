//! VidBill API server

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vidbill_api::{create_router, AppState, Config};
use vidbill_billing::{
    BillingConfig, BillingService, HttpPaymentDispatcher, PaymentGatewayConfig, PgBillingStore,
};
use vidbill_shared::{create_pool, run_migrations};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vidbill_api=debug,vidbill_billing=debug,tower_http=debug"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.json_logs);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting VidBill API");

    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    run_migrations(&pool).await?;
    let store = Arc::new(PgBillingStore::new(pool.clone()));

    let dispatcher = Arc::new(HttpPaymentDispatcher::new(PaymentGatewayConfig::from_env()?)?);
    let billing = BillingService::new(
        store.clone(),
        store.clone(),
        store,
        dispatcher,
        BillingConfig::from_env()?,
    );

    let state = AppState::new(billing, Some(pool), config.payment_webhook_secret.as_str());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}
