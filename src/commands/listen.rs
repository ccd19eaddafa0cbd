use std::time::Duration;

use tracing::info;

use subledger_core::Config;
use subledger_sync::Reconciler;

use crate::services;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the polling reconciler for the default portfolio until Ctrl-C.
pub async fn run(config: &Config, assets: Option<String>) -> anyhow::Result<()> {
    let services = services::init(config).await?;

    match &assets {
        Some(file) => info!(file = %file, "Filtering monitored wallets by assets file"),
        None => info!("Monitoring ALL Exchange wallets (no --assets filter)"),
    }

    let reconciler = Reconciler::new(
        services.exchange.clone(),
        services.store.clone(),
        &services.default_portfolio.id,
        config.reconciler.clone(),
    );

    let handle = reconciler.start(assets.as_deref()).await?;
    info!("Reconciler running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.stop(SHUTDOWN_TIMEOUT).await;
    Ok(())
}
