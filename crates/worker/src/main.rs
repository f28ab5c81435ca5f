//! VidBill worker binary

use std::sync::Arc;

use tokio_cron_scheduler::JobScheduler;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vidbill_billing::{
    BillingCatalog, BillingConfig, BillingService, HttpPaymentDispatcher, PaymentGatewayConfig,
    PgBillingStore,
};
use vidbill_shared::{create_pool, run_migrations};
use vidbill_worker::{BillingRunner, LogFormat, WorkerConfig};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vidbill_worker=debug,vidbill_billing=debug,sqlx=warn"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(config.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting VidBill worker");

    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    run_migrations(&pool).await?;
    let store = Arc::new(PgBillingStore::new(pool));

    let billing_config = BillingConfig::from_env()?;
    if let Some(path) = &billing_config.catalog_path {
        let catalog = BillingCatalog::load(path)?;
        store.sync_catalog(&catalog).await?;
    }

    let dispatcher = Arc::new(HttpPaymentDispatcher::new(PaymentGatewayConfig::from_env()?)?);
    let service = BillingService::new(
        store.clone(),
        store.clone(),
        store,
        dispatcher,
        billing_config,
    );
    let runner = BillingRunner::new(service);

    let mut scheduler = JobScheduler::new().await?;
    runner.schedule(&scheduler, &config.schedule).await?;
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
