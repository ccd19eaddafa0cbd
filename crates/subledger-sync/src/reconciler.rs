use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use subledger_core::assets::{load_asset_config, AssetConfig};
use subledger_core::types::WalletInfo;
use subledger_core::ReconcilerConfig;
use subledger_ledger::{LedgerStore, PlatformTransactionParams};
use subledger_prime::{PrimeApi, PrimeTransaction};

use crate::cache::ProcessedCache;
use crate::{Result, SyncError};

/// The polling reconciler: converts the Exchange's unordered, weakly
/// consistent transaction stream into the correct sequence of subledger
/// operations.
///
/// One instance monitors one portfolio. The monitored wallet set is captured
/// once at start and not refreshed; restart the listener after provisioning
/// new wallets.
pub struct Reconciler {
    exchange: Arc<dyn PrimeApi>,
    store: Arc<dyn LedgerStore>,
    portfolio_id: String,
    config: ReconcilerConfig,
    cache: ProcessedCache,
}

/// Handle to a running reconciler: signals shutdown and waits for the
/// in-flight polling cycle to finish within a bounded timeout.
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ReconcilerHandle {
    pub async fn stop(self, timeout: Duration) {
        info!("Stopping reconciler");
        let _ = self.shutdown.send(true);

        for (name, task) in self.tasks {
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(task = name, "Forced shutdown after timeout");
            }
        }
        info!("Reconciler stopped");
    }
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn PrimeApi>,
        store: Arc<dyn LedgerStore>,
        portfolio_id: &str,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            exchange,
            store,
            portfolio_id: portfolio_id.to_string(),
            config,
            cache: ProcessedCache::new(),
        })
    }

    pub(crate) fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    pub(crate) fn exchange(&self) -> &dyn PrimeApi {
        self.exchange.as_ref()
    }

    pub(crate) fn portfolio_id(&self) -> &str {
        &self.portfolio_id
    }

    pub(crate) fn cache(&self) -> &ProcessedCache {
        &self.cache
    }

    /// Catch-all subledger user for events that cannot be attributed.
    pub(crate) fn platform_user_id(&self) -> String {
        format!("platform-{}", self.portfolio_id)
    }

    /// Discovers wallets, runs the startup recovery sweep, then enters
    /// steady-state polling. Returns a handle used to stop the loops.
    pub async fn start(
        self: &Arc<Self>,
        assets_filter: Option<&str>,
    ) -> Result<ReconcilerHandle> {
        info!("Starting reconciler");

        let wallets = self.load_monitored_wallets(assets_filter).await?;
        if wallets.is_empty() {
            warn!("No wallets to monitor - make sure addresses have been created");
            return Err(SyncError::NoWallets);
        }

        self.startup_recovery(&wallets).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let poller = Arc::clone(self);
        let poll_wallets = wallets.clone();
        let mut poll_shutdown = shutdown_rx.clone();
        let poll_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poller.config.polling_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        poller.poll_wallets(&poll_wallets).await;
                    }
                    _ = poll_shutdown.changed() => break,
                }
            }
        });

        let cleaner = Arc::clone(self);
        let mut cleanup_shutdown = shutdown_rx;
        let cleanup_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleaner.config.cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // skip the immediate first tick; there is nothing to clean yet
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cleaner.cache.evict_older_than(cleaner.config.lookback_window);
                    }
                    _ = cleanup_shutdown.changed() => break,
                }
            }
        });

        info!(
            wallets = wallets.len(),
            polling_interval = ?self.config.polling_interval,
            lookback_window = ?self.config.lookback_window,
            "Reconciler started"
        );

        Ok(ReconcilerHandle {
            shutdown: shutdown_tx,
            tasks: vec![("poll", poll_task), ("cleanup", cleanup_task)],
        })
    }

    /// Discovers trading wallets to monitor. With an assets filter, only
    /// wallets for the listed assets; otherwise every wallet on the
    /// portfolio. Falls back to the local address index when the Exchange
    /// is unreachable.
    pub async fn load_monitored_wallets(
        &self,
        assets_filter: Option<&str>,
    ) -> Result<Vec<WalletInfo>> {
        match assets_filter {
            Some(file) => self.load_filtered_wallets(file).await,
            None => self.load_all_wallets().await,
        }
    }

    async fn load_all_wallets(&self) -> Result<Vec<WalletInfo>> {
        info!(portfolio_id = %self.portfolio_id, "Discovering ALL wallets from the Exchange portfolio");

        match self
            .exchange
            .list_wallets(&self.portfolio_id, "TRADING", &[])
            .await
        {
            Ok(wallets) if !wallets.is_empty() => {
                let deduped = dedup_wallets(wallets.into_iter().map(|w| WalletInfo {
                    id: w.id,
                    asset_symbol: w.symbol,
                }));
                info!(count = deduped.len(), "Monitoring ALL Exchange wallets");
                Ok(deduped)
            }
            Ok(_) => self.load_filtered_wallets(&self.config.assets_file).await,
            Err(e) => {
                warn!(error = %e, "Could not discover wallets from the Exchange, falling back to local store");
                self.load_filtered_wallets(&self.config.assets_file).await
            }
        }
    }

    async fn load_filtered_wallets(&self, assets_file: &str) -> Result<Vec<WalletInfo>> {
        info!(file = assets_file, "Loading filtered wallets from assets file");

        let asset_configs = load_asset_config(assets_file)?;
        let symbols = unique_symbols(&asset_configs);

        match self
            .exchange
            .list_wallets(&self.portfolio_id, "TRADING", &symbols)
            .await
        {
            Ok(wallets) if !wallets.is_empty() => {
                let deduped = dedup_wallets(wallets.into_iter().map(|w| WalletInfo {
                    id: w.id,
                    asset_symbol: w.symbol,
                }));
                info!(
                    count = deduped.len(),
                    symbols = ?symbols,
                    "Monitoring filtered Exchange wallets"
                );
                Ok(deduped)
            }
            _ => {
                // local fallback: derive the wallet set from stored addresses
                let symbol_set: HashSet<&str> =
                    asset_configs.iter().map(|a| a.symbol.as_str()).collect();
                let users = self.store.users().await?;

                let mut wallet_map: HashMap<String, WalletInfo> = HashMap::new();
                for user in &users {
                    let addresses = match self.store.all_user_addresses(&user.id).await {
                        Ok(addresses) => addresses,
                        Err(e) => {
                            error!(user_id = %user.id, error = %e, "Failed to get addresses for user");
                            continue;
                        }
                    };
                    for addr in addresses {
                        if symbol_set.contains(addr.asset.as_str()) && !addr.wallet_id.is_empty() {
                            wallet_map.insert(
                                addr.wallet_id.clone(),
                                WalletInfo {
                                    id: addr.wallet_id,
                                    asset_symbol: addr.asset,
                                },
                            );
                        }
                    }
                }

                let wallets: Vec<WalletInfo> = wallet_map.into_values().collect();
                info!(count = wallets.len(), "Loaded monitored wallets from local store (fallback)");
                Ok(wallets)
            }
        }
    }

    /// Re-inspects the lookback window once before steady state, healing any
    /// gap left by downtime. Individual wallet failures are tolerated; a
    /// majority failing aborts the startup.
    pub(crate) async fn startup_recovery(&self, wallets: &[WalletInfo]) -> Result<()> {
        info!("Starting startup recovery");

        if let Ok(Some(most_recent)) = self.store.most_recent_transaction_time().await {
            debug!(most_recent_tx = %most_recent, "Most recent recorded transaction");
        }

        let since = Utc::now() - self.config.lookback_window;
        let mut recovered = 0usize;
        let mut failed: Vec<String> = Vec::new();

        for wallet in wallets {
            match self.poll_wallet(wallet, since).await {
                Ok(count) => recovered += count,
                Err(e) => {
                    error!(
                        wallet_id = %wallet.id,
                        asset = %wallet.asset_symbol,
                        error = %e,
                        "Failed to recover transactions for wallet"
                    );
                    failed.push(format!("{}({})", wallet.asset_symbol, wallet.id));
                }
            }
        }

        if !failed.is_empty() {
            warn!(
                recovered = recovered,
                total_wallets = wallets.len(),
                failed_wallets = failed.len(),
                details = ?failed,
                "Startup recovery completed with some failures"
            );
            if failed.len() > wallets.len() / 2 {
                return Err(SyncError::RecoveryFailed {
                    failed: failed.len(),
                    total: wallets.len(),
                    details: failed.join(", "),
                });
            }
        } else {
            info!(
                recovered = recovered,
                total_wallets = wallets.len(),
                "Startup recovery completed"
            );
        }

        Ok(())
    }

    /// One polling cycle: fan out one task per monitored wallet, join all of
    /// them, then log the cycle summary.
    pub async fn poll_wallets(self: &Arc<Self>, wallets: &[WalletInfo]) {
        let since = Utc::now() - self.config.lookback_window;

        info!(
            wallets = wallets.len(),
            lookback = ?self.config.lookback_window,
            "Polling wallets"
        );

        let mut tasks = JoinSet::new();
        for wallet in wallets {
            let this = Arc::clone(self);
            let wallet = wallet.clone();
            tasks.spawn(async move {
                match this.poll_wallet(&wallet, since).await {
                    Ok(count) => (count, 0usize),
                    Err(e) => {
                        error!(
                            wallet_id = %wallet.id,
                            asset = %wallet.asset_symbol,
                            error = %e,
                            "Failed to poll wallet"
                        );
                        (0, 1)
                    }
                }
            });
        }

        let mut new_transactions = 0usize;
        let mut failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            if let Ok((count, failed)) = joined {
                new_transactions += count;
                failures += failed;
            }
        }

        info!(
            new_transactions = new_transactions,
            failed_wallets = failures,
            "Polling cycle complete"
        );
    }

    /// Polls one wallet and processes its new transactions in the order the
    /// Exchange returned them. A single transaction's failure never halts
    /// the rest of the wallet.
    pub(crate) async fn poll_wallet(
        &self,
        wallet: &WalletInfo,
        since: chrono::DateTime<Utc>,
    ) -> Result<usize> {
        let transactions = self
            .exchange
            .list_wallet_transactions(&self.portfolio_id, &wallet.id, since)
            .await?;

        let mut processed = 0usize;
        for tx in transactions {
            if self.cache.contains(&tx.id) {
                continue;
            }

            match self.process_transaction(&tx, wallet).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    error!(
                        transaction_id = %tx.id,
                        wallet_id = %wallet.id,
                        error = %e,
                        "Failed to process transaction"
                    );
                }
            }
        }

        Ok(processed)
    }

    /// Classifies and dispatches a single Exchange transaction.
    pub(crate) async fn process_transaction(
        &self,
        tx: &PrimeTransaction,
        wallet: &WalletInfo,
    ) -> Result<()> {
        if self.cache.contains(&tx.id) {
            return Ok(());
        }

        match tx.r#type.as_str() {
            "DEPOSIT" => self.process_deposit_event(tx, wallet).await,
            "WITHDRAWAL" => self.process_withdrawal_event(tx, wallet).await,
            "CONVERSION" => self.process_conversion_event(tx, wallet).await,
            other => {
                self.store
                    .record_platform_transaction(PlatformTransactionParams {
                        transaction_id: tx.id.clone(),
                        transaction_type: other.to_string(),
                        status: tx.status.clone(),
                        symbol: tx.symbol.clone(),
                        amount: tx.amount.clone(),
                        network: tx.network.clone(),
                        wallet_id: wallet.id.clone(),
                        transaction_time: tx.effective_time(),
                        metadata: vec![
                            ("idempotency_key".to_string(), tx.idempotency_key.clone()),
                            ("transaction_id".to_string(), tx.transaction_id.clone()),
                        ],
                    })
                    .await?;
                self.cache.mark(&tx.id);
                Ok(())
            }
        }
    }
}

fn dedup_wallets(wallets: impl Iterator<Item = WalletInfo>) -> Vec<WalletInfo> {
    let mut seen = HashSet::new();
    wallets
        .filter(|w| seen.insert(w.id.clone()))
        .collect()
}

fn unique_symbols(configs: &[AssetConfig]) -> Vec<String> {
    let mut seen = HashSet::new();
    configs
        .iter()
        .filter(|c| seen.insert(c.symbol.clone()))
        .map(|c| c.symbol.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        deposit_tx, reconciler_fixture, seed_user_with_funds, withdrawal_tx, ALICE_DEPOSIT_ADDRESS,
        ALICE_ID, PORTFOLIO_ID, WALLET_ID,
    };
    use rust_decimal::Decimal;
    use subledger_core::idempotency;
    use subledger_core::types::WalletInfo;

    fn usdc_wallet() -> Vec<WalletInfo> {
        vec![WalletInfo {
            id: WALLET_ID.to_string(),
            asset_symbol: "USDC".to_string(),
        }]
    }

    fn dec(raw: &str) -> Decimal {
        raw.parse().unwrap()
    }

    #[tokio::test]
    async fn single_phase_deposit_credits_user_exactly_once() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "0").await;

        exchange.stage(
            WALLET_ID,
            deposit_tx("tx-A", "TRANSACTION_IMPORTED", "USDC", "1.50", ALICE_DEPOSIT_ADDRESS),
        );

        reconciler.poll_wallets(&usdc_wallet()).await;
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("1.50"));

        // second cycle sees the same page; the cache short-circuits it
        reconciler.poll_wallets(&usdc_wallet()).await;
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("1.50"));
        assert!(reconciler.cache().contains("tx-A"));

        // a fresh reconciler (restart: empty cache) still cannot double-credit
        let restarted = Reconciler::new(
            exchange.clone() as Arc<dyn subledger_prime::PrimeApi>,
            store.clone() as Arc<dyn LedgerStore>,
            PORTFOLIO_ID,
            crate::testutil::test_config(),
        );
        restarted.poll_wallets(&usdc_wallet()).await;
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("1.50"));

        let history = store
            .transaction_history(ALICE_ID, "USDC", 10, 0)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].external_transaction_id, "tx-A");
    }

    #[tokio::test]
    async fn network_variant_symbol_normalizes_through_address_index() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "0").await;

        exchange.stage(
            WALLET_ID,
            deposit_tx("tx-B", "TRANSACTION_IMPORTED", "BASEUSDC", "2", ALICE_DEPOSIT_ADDRESS),
        );
        reconciler.poll_wallets(&usdc_wallet()).await;

        // balance keyed by the canonical symbol, not the variant
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("2"));
        assert!(store.user_balance(ALICE_ID, "BASEUSDC").await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn unattributed_deposit_is_marked_without_crediting_anyone() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "0").await;

        exchange.stage(
            WALLET_ID,
            deposit_tx("tx-C", "TRANSACTION_IMPORTED", "USDC", "3", "0xnobody"),
        );
        reconciler.poll_wallets(&usdc_wallet()).await;

        assert!(store.user_balance(ALICE_ID, "USDC").await.unwrap().is_zero());
        assert!(reconciler.cache().contains("tx-C"));

        // next cycle makes no further ledger calls for it
        reconciler.poll_wallets(&usdc_wallet()).await;
        assert!(store
            .transaction_history(ALICE_ID, "USDC", 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn completed_withdrawal_settles_reservation_without_double_debit() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "5").await;

        // the CLI reserved 2 USDC under Alice's idempotency key
        let key = idempotency::generate_key(ALICE_ID);
        store
            .process_withdrawal(ALICE_ID, "USDC", dec("2"), &key)
            .await
            .unwrap();
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("3"));

        // the reconciler later observes the same withdrawal settled
        exchange.stage(
            WALLET_ID,
            withdrawal_tx("act-1", "TRANSACTION_DONE", "USDC", "2", &key, "0xdest"),
        );
        reconciler.poll_wallets(&usdc_wallet()).await;

        // settlement is not a second debit
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("3"));
        let history = store
            .transaction_history(ALICE_ID, "USDC", 10, 0)
            .await
            .unwrap();
        let reservations = history
            .iter()
            .filter(|r| r.external_transaction_id == key)
            .count();
        assert_eq!(reservations, 1);
    }

    #[tokio::test]
    async fn terminal_failure_restores_reserved_funds_exactly_once() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "5").await;

        let key = idempotency::generate_key(ALICE_ID);
        store
            .process_withdrawal(ALICE_ID, "USDC", dec("2"), &key)
            .await
            .unwrap();

        exchange.stage(
            WALLET_ID,
            withdrawal_tx("act-2", "TRANSACTION_REJECTED", "USDC", "2", &key, "0xdest"),
        );
        reconciler.poll_wallets(&usdc_wallet()).await;
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("5"));

        // restart replay: compensating credit deduplicates on {key}-reversal
        let restarted = Reconciler::new(
            exchange.clone() as Arc<dyn subledger_prime::PrimeApi>,
            store.clone() as Arc<dyn LedgerStore>,
            PORTFOLIO_ID,
            crate::testutil::test_config(),
        );
        restarted.poll_wallets(&usdc_wallet()).await;
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("5"));

        let history = store
            .transaction_history(ALICE_ID, "USDC", 10, 0)
            .await
            .unwrap();
        let reversals = history
            .iter()
            .filter(|r| r.external_transaction_id == format!("{key}-reversal"))
            .count();
        assert_eq!(reversals, 1);
    }

    #[tokio::test]
    async fn terminal_failure_without_reservation_compensates_nothing() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "5").await;

        // matched by prefix, but no reservation was ever made locally
        let key = idempotency::generate_key(ALICE_ID);
        exchange.stage(
            WALLET_ID,
            withdrawal_tx("act-3", "TRANSACTION_FAILED", "USDC", "2", &key, "0xdest"),
        );
        reconciler.poll_wallets(&usdc_wallet()).await;

        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("5"));
        assert!(reconciler.cache().contains("act-3"));
    }

    #[tokio::test]
    async fn completed_withdrawal_without_reservation_debits_directly() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "5").await;

        let key = idempotency::generate_key(ALICE_ID);
        exchange.stage(
            WALLET_ID,
            withdrawal_tx("act-4", "TRANSACTION_DONE", "USDC", "2", &key, "0xdest"),
        );
        reconciler.poll_wallets(&usdc_wallet()).await;

        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("3"));
        let history = store
            .transaction_history(ALICE_ID, "USDC", 10, 0)
            .await
            .unwrap();
        assert!(history
            .iter()
            .any(|r| r.external_transaction_id == "act-4"));
    }

    #[tokio::test]
    async fn unmatched_terminal_failure_records_platform_round_trip() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "5").await;

        exchange.stage(
            WALLET_ID,
            withdrawal_tx("act-5", "TRANSACTION_EXPIRED", "USDC", "4", "", "0xstranger"),
        );
        reconciler.poll_wallets(&usdc_wallet()).await;

        let platform = format!("platform-{PORTFOLIO_ID}");
        assert!(store.user_balance(&platform, "USDC").await.unwrap().is_zero());
        let history = store
            .transaction_history(&platform, "USDC", 10, 0)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("5"));
    }

    #[tokio::test]
    async fn external_pending_withdrawal_debits_wallet_into_pending() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "5").await;

        exchange.stage(
            WALLET_ID,
            withdrawal_tx("act-6", "OTHER_TRANSACTION_STATUS", "USDC", "1", "", "0xstranger"),
        );
        reconciler.poll_wallets(&usdc_wallet()).await;

        let platform = format!("platform-{PORTFOLIO_ID}");
        assert_eq!(store.user_balance(&platform, "USDC").await.unwrap(), dec("-1"));
        assert!(reconciler.cache().contains("act-6"));
        // the user's reservation-free balance is untouched
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("5"));
    }

    #[tokio::test]
    async fn own_pending_withdrawal_waits_for_terminal_state() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "5").await;

        let key = idempotency::generate_key(ALICE_ID);
        store
            .process_withdrawal(ALICE_ID, "USDC", dec("2"), &key)
            .await
            .unwrap();

        exchange.stage(
            WALLET_ID,
            withdrawal_tx("act-7", "OTHER_TRANSACTION_STATUS", "USDC", "2", &key, "0xdest"),
        );
        reconciler.poll_wallets(&usdc_wallet()).await;

        // no double debit, and the event stays unmarked so the terminal
        // state is still observed later
        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("3"));
        assert!(!reconciler.cache().contains("act-7"));
    }

    #[tokio::test]
    async fn unknown_event_types_land_on_the_platform_account() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "0").await;

        let mut tx = deposit_tx("tx-R", "TRANSACTION_DONE", "USDC", "0.25", "");
        tx.r#type = "REWARD".to_string();
        exchange.stage(WALLET_ID, tx);

        reconciler.poll_wallets(&usdc_wallet()).await;

        let platform = format!("platform-{PORTFOLIO_ID}");
        assert_eq!(store.user_balance(&platform, "USDC").await.unwrap(), dec("0.25"));
        assert!(reconciler.cache().contains("tx-R"));
    }

    #[tokio::test]
    async fn recovery_tolerates_minority_failures_only() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "0").await;

        // single wallet failing = majority -> startup aborts
        exchange.fail_transactions();
        let err = reconciler.startup_recovery(&usdc_wallet()).await.unwrap_err();
        assert!(matches!(err, SyncError::RecoveryFailed { failed: 1, total: 1, .. }));
    }

    #[tokio::test]
    async fn start_and_stop_round_trip() {
        let (reconciler, store, exchange) = reconciler_fixture().await;
        seed_user_with_funds(store.as_ref(), "0").await;
        exchange.stage(
            WALLET_ID,
            deposit_tx("tx-S", "TRANSACTION_IMPORTED", "USDC", "1", ALICE_DEPOSIT_ADDRESS),
        );

        // discovery goes through the mock Exchange (no assets filter)
        let handle = reconciler.start(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop(Duration::from_secs(5)).await;

        assert_eq!(store.user_balance(ALICE_ID, "USDC").await.unwrap(), dec("1"));
    }
}
