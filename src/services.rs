use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use subledger_core::types::Portfolio;
use subledger_core::{BackendKind, Config, ExchangeCredentials};
use subledger_db::{DatabasePool, RelationalStore};
use subledger_formance::FormanceStore;
use subledger_ledger::LedgerStore;
use subledger_prime::{PrimeApi, PrimeClient};

/// Fully-wired services: Ledger Store backend, Exchange client, and the
/// resolved default portfolio.
pub struct Services {
    pub store: Arc<dyn LedgerStore>,
    pub exchange: Arc<dyn PrimeApi>,
    pub default_portfolio: Portfolio,
    pub portfolios: Vec<Portfolio>,
}

/// Initializes everything a command needs to talk to both the Exchange and
/// the Ledger Store. The store's catch-all account namespace is scoped to
/// the default portfolio.
pub async fn init(config: &Config) -> anyhow::Result<Services> {
    info!("Loading Exchange API credentials");
    let credentials = ExchangeCredentials::load()?;
    let exchange: Arc<dyn PrimeApi> = Arc::new(PrimeClient::new(credentials));

    info!("Discovering portfolios");
    let portfolios = exchange.list_portfolios().await?;
    for portfolio in &portfolios {
        info!(id = %portfolio.id, name = %portfolio.name, "  Portfolio");
    }

    let default_portfolio = portfolios
        .iter()
        .find(|p| p.name == "Default Portfolio")
        .cloned()
        .context("default portfolio not found")?;
    info!(
        id = %default_portfolio.id,
        name = %default_portfolio.name,
        "Using default portfolio"
    );

    let store = init_store(config, &default_portfolio.id).await?;

    Ok(Services {
        store,
        exchange,
        default_portfolio,
        portfolios,
    })
}

/// Initializes just the Ledger Store, for read-only commands that never
/// touch the Exchange.
pub async fn init_store_only(config: &Config) -> anyhow::Result<Arc<dyn LedgerStore>> {
    init_store(config, "").await
}

async fn init_store(config: &Config, portfolio_id: &str) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match config.backend {
        BackendKind::Formance => {
            info!(stack_url = %config.formance.stack_url, "Using double-entry backend");
            let mut store = FormanceStore::connect(&config.formance).await?;
            if !portfolio_id.is_empty() {
                store.set_portfolio(portfolio_id);
            }
            Ok(Arc::new(store))
        }
        BackendKind::Sqlite => {
            info!(path = %config.database.path, "Using relational backend");
            let db = DatabasePool::connect(&config.database).await?;
            let store = if portfolio_id.is_empty() {
                RelationalStore::new(db)
            } else {
                RelationalStore::new(db).with_portfolio(portfolio_id)
            };
            Ok(Arc::new(store))
        }
    }
}
