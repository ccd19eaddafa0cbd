mod client;
mod types;

pub use client::PrimeClient;
pub use types::{AddressBookEntry, PrimeTransaction, TransferInfo};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use subledger_core::types::{DepositAddress, Portfolio, Wallet, Withdrawal};

#[derive(Error, Debug)]
pub enum PrimeError {
    #[error("exchange request failed: {0}")]
    Http(String),

    #[error("exchange returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to decode exchange response: {0}")]
    Decode(String),

    #[error("default portfolio not found")]
    NoDefaultPortfolio,
}

pub type Result<T> = std::result::Result<T, PrimeError>;

/// Parameters for submitting a withdrawal to the Exchange.
#[derive(Debug, Clone, Default)]
pub struct CreateWithdrawalParams {
    pub portfolio_id: String,
    pub wallet_id: String,
    pub destination_address: String,
    pub amount: String,
    /// `SYMBOL` or `SYMBOL-network-type` (network forwarded when present).
    pub asset: String,
    pub idempotency_key: String,
}

/// The named interface to the Exchange (prime brokerage transaction API).
/// The reconciler and the withdrawal coordinator depend only on this trait;
/// [`PrimeClient`] is the production implementation.
#[async_trait]
pub trait PrimeApi: Send + Sync {
    async fn list_portfolios(&self) -> Result<Vec<Portfolio>>;

    async fn find_default_portfolio(&self) -> Result<Portfolio> {
        self.list_portfolios()
            .await?
            .into_iter()
            .find(|p| p.name == "Default Portfolio")
            .ok_or(PrimeError::NoDefaultPortfolio)
    }

    /// Lists wallets, optionally restricted to the given symbols.
    async fn list_wallets(
        &self,
        portfolio_id: &str,
        wallet_type: &str,
        symbols: &[String],
    ) -> Result<Vec<Wallet>>;

    async fn create_wallet(
        &self,
        portfolio_id: &str,
        name: &str,
        symbol: &str,
        wallet_type: &str,
    ) -> Result<Wallet>;

    async fn create_deposit_address(
        &self,
        portfolio_id: &str,
        wallet_id: &str,
        asset: &str,
        network: &str,
    ) -> Result<DepositAddress>;

    async fn list_wallet_addresses(
        &self,
        portfolio_id: &str,
        wallet_id: &str,
        network: &str,
    ) -> Result<Vec<DepositAddress>>;

    /// Looks up an external address in the portfolio's address book.
    async fn lookup_address_book(
        &self,
        portfolio_id: &str,
        address: &str,
    ) -> Result<Option<AddressBookEntry>>;

    async fn create_withdrawal(&self, params: CreateWithdrawalParams) -> Result<Withdrawal>;

    /// Lists a wallet's deposit/withdrawal activity since the given time,
    /// following pagination transparently.
    async fn list_wallet_transactions(
        &self,
        portfolio_id: &str,
        wallet_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PrimeTransaction>>;
}
