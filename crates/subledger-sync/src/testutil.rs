use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use subledger_core::types::{DepositAddress, Portfolio, Wallet, Withdrawal};
use subledger_core::ReconcilerConfig;
use subledger_db::{DatabasePool, RelationalStore};
use subledger_ledger::{LedgerStore, StoreAddressParams};
use subledger_prime::{
    AddressBookEntry, CreateWithdrawalParams, PrimeApi, PrimeError, PrimeTransaction,
};

use crate::reconciler::Reconciler;

pub const ALICE_ID: &str = "a1b2c3d4-0000-4000-8000-000000000001";
pub const ALICE_DEPOSIT_ADDRESS: &str = "0xalice";
pub const WALLET_ID: &str = "w1";
pub const PORTFOLIO_ID: &str = "port-1";

/// Scripted Exchange: transactions are staged per wallet; withdrawal
/// submissions are recorded and can be made to fail.
pub struct MockExchange {
    pub transactions: Mutex<HashMap<String, Vec<PrimeTransaction>>>,
    pub wallets: Mutex<Vec<Wallet>>,
    pub created_withdrawals: Mutex<Vec<CreateWithdrawalParams>>,
    fail_withdrawals: AtomicBool,
    fail_transactions: AtomicBool,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            transactions: Mutex::new(HashMap::new()),
            wallets: Mutex::new(vec![Wallet {
                id: WALLET_ID.to_string(),
                name: "USDC Trading Wallet".to_string(),
                symbol: "USDC".to_string(),
                wallet_type: "TRADING".to_string(),
            }]),
            created_withdrawals: Mutex::new(Vec::new()),
            fail_withdrawals: AtomicBool::new(false),
            fail_transactions: AtomicBool::new(false),
        }
    }

    pub fn stage(&self, wallet_id: &str, tx: PrimeTransaction) {
        self.transactions
            .lock()
            .unwrap()
            .entry(wallet_id.to_string())
            .or_default()
            .push(tx);
    }

    pub fn fail_withdrawals(&self) {
        self.fail_withdrawals.store(true, Ordering::SeqCst);
    }

    pub fn fail_transactions(&self) {
        self.fail_transactions.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PrimeApi for MockExchange {
    async fn list_portfolios(&self) -> subledger_prime::Result<Vec<Portfolio>> {
        Ok(vec![Portfolio {
            id: PORTFOLIO_ID.to_string(),
            name: "Default Portfolio".to_string(),
        }])
    }

    async fn list_wallets(
        &self,
        _portfolio_id: &str,
        _wallet_type: &str,
        symbols: &[String],
    ) -> subledger_prime::Result<Vec<Wallet>> {
        let wallets = self.wallets.lock().unwrap();
        Ok(wallets
            .iter()
            .filter(|w| symbols.is_empty() || symbols.contains(&w.symbol))
            .cloned()
            .collect())
    }

    async fn create_wallet(
        &self,
        _portfolio_id: &str,
        name: &str,
        symbol: &str,
        wallet_type: &str,
    ) -> subledger_prime::Result<Wallet> {
        Ok(Wallet {
            id: format!("wallet-{symbol}"),
            name: name.to_string(),
            symbol: symbol.to_string(),
            wallet_type: wallet_type.to_string(),
        })
    }

    async fn create_deposit_address(
        &self,
        _portfolio_id: &str,
        wallet_id: &str,
        asset: &str,
        network: &str,
    ) -> subledger_prime::Result<DepositAddress> {
        Ok(DepositAddress {
            id: format!("acct-{wallet_id}"),
            address: format!("0xgen-{asset}"),
            network: network.to_string(),
            asset: asset.to_string(),
        })
    }

    async fn list_wallet_addresses(
        &self,
        _portfolio_id: &str,
        _wallet_id: &str,
        _network: &str,
    ) -> subledger_prime::Result<Vec<DepositAddress>> {
        Ok(Vec::new())
    }

    async fn lookup_address_book(
        &self,
        _portfolio_id: &str,
        _address: &str,
    ) -> subledger_prime::Result<Option<AddressBookEntry>> {
        Ok(None)
    }

    async fn create_withdrawal(
        &self,
        params: CreateWithdrawalParams,
    ) -> subledger_prime::Result<Withdrawal> {
        if self.fail_withdrawals.load(Ordering::SeqCst) {
            return Err(PrimeError::Http("connection reset by peer".to_string()));
        }

        self.created_withdrawals.lock().unwrap().push(params.clone());
        Ok(Withdrawal {
            activity_id: "act-1".to_string(),
            asset: params.asset,
            amount: params.amount,
            destination: params.destination_address,
            idempotency_key: params.idempotency_key,
        })
    }

    async fn list_wallet_transactions(
        &self,
        _portfolio_id: &str,
        wallet_id: &str,
        _since: DateTime<Utc>,
    ) -> subledger_prime::Result<Vec<PrimeTransaction>> {
        if self.fail_transactions.load(Ordering::SeqCst) {
            return Err(PrimeError::Http("connection timed out".to_string()));
        }
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .get(wallet_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Creates Alice with a provisioned USDC deposit address and an optional
/// starting balance.
pub async fn seed_user_with_funds(store: &RelationalStore, amount: &str) {
    store
        .create_user(ALICE_ID, "Alice Johnson", "alice@example.com")
        .await
        .unwrap();
    store
        .store_address(StoreAddressParams {
            user_id: ALICE_ID.to_string(),
            asset: "USDC".to_string(),
            network: "base-mainnet".to_string(),
            address: ALICE_DEPOSIT_ADDRESS.to_string(),
            wallet_id: WALLET_ID.to_string(),
            account_identifier: "acct-alice".to_string(),
        })
        .await
        .unwrap();

    if amount != "0" {
        store
            .process_deposit(
                ALICE_DEPOSIT_ADDRESS,
                "USDC",
                amount.parse().unwrap(),
                "tx-seed",
                None,
            )
            .await
            .unwrap();
    }
}

pub fn test_config() -> ReconcilerConfig {
    ReconcilerConfig {
        lookback_window: Duration::from_secs(6 * 3600),
        polling_interval: Duration::from_millis(50),
        cleanup_interval: Duration::from_secs(900),
        assets_file: "assets.yaml".to_string(),
    }
}

/// Reconciler wired to an in-memory relational store and the mock Exchange.
pub async fn reconciler_fixture() -> (Arc<Reconciler>, Arc<RelationalStore>, Arc<MockExchange>) {
    let db = DatabasePool::connect_in_memory().await.unwrap();
    let store = Arc::new(RelationalStore::new(db).with_portfolio(PORTFOLIO_ID));
    let exchange = Arc::new(MockExchange::new());

    let reconciler = Reconciler::new(
        exchange.clone() as Arc<dyn PrimeApi>,
        store.clone() as Arc<dyn LedgerStore>,
        PORTFOLIO_ID,
        test_config(),
    );
    (reconciler, store, exchange)
}

pub fn deposit_tx(id: &str, status: &str, symbol: &str, amount: &str, to: &str) -> PrimeTransaction {
    PrimeTransaction {
        id: id.to_string(),
        wallet_id: WALLET_ID.to_string(),
        r#type: "DEPOSIT".to_string(),
        status: status.to_string(),
        symbol: symbol.to_string(),
        amount: amount.to_string(),
        created_at: Some(Utc::now()),
        transfer_to: subledger_prime::TransferInfo {
            address: to.to_string(),
            ..Default::default()
        },
        network: "base-mainnet".to_string(),
        ..Default::default()
    }
}

pub fn withdrawal_tx(
    id: &str,
    status: &str,
    symbol: &str,
    amount: &str,
    idempotency_key: &str,
    destination: &str,
) -> PrimeTransaction {
    PrimeTransaction {
        id: id.to_string(),
        wallet_id: WALLET_ID.to_string(),
        r#type: "WITHDRAWAL".to_string(),
        status: status.to_string(),
        symbol: symbol.to_string(),
        amount: amount.to_string(),
        created_at: Some(Utc::now()),
        transfer_to: subledger_prime::TransferInfo {
            address: destination.to_string(),
            ..Default::default()
        },
        idempotency_key: idempotency_key.to_string(),
        network: "base-mainnet".to_string(),
        ..Default::default()
    }
}
