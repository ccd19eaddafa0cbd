use chrono::{DateTime, Utc};
use serde::Deserialize;

/// The transfer_from / transfer_to legs of an Exchange transaction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferInfo {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub account_identifier: String,
}

/// One transaction from the Exchange's wallet activity stream. Statuses and
/// types arrive as plain strings (e.g. "TRANSACTION_IMPORTED", "DEPOSIT");
/// classification happens in the reconciler.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrimeTransaction {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub wallet_id: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub destination_symbol: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transfer_from: TransferInfo,
    #[serde(default)]
    pub transfer_to: TransferInfo,
    /// On-chain transaction hash, when the Exchange knows it.
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub network_fees: String,
    #[serde(default)]
    pub fees: String,
    #[serde(default)]
    pub fee_symbol: String,
    #[serde(default)]
    pub blockchain_ids: Vec<String>,
    #[serde(default)]
    pub idempotency_key: String,
}

impl PrimeTransaction {
    /// Effective time of the transaction: completion when known, else
    /// creation.
    pub fn effective_time(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.created_at)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PortfolioDto {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListPortfoliosResponse {
    #[serde(default)]
    pub portfolios: Vec<PortfolioDto>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WalletDto {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub r#type: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListWalletsResponse {
    #[serde(default)]
    pub wallets: Vec<WalletDto>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Pagination {
    #[serde(default)]
    pub next_cursor: String,
    #[serde(default)]
    pub has_next: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateWalletResponse {
    #[serde(default)]
    pub activity_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub r#type: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateAddressResponse {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub account_identifier: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WalletAddressDto {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub account_identifier: String,
    #[serde(default)]
    pub network: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListAddressesResponse {
    #[serde(default)]
    pub addresses: Vec<WalletAddressDto>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListTransactionsResponse {
    #[serde(default)]
    pub transactions: Vec<PrimeTransaction>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateWithdrawalResponse {
    #[serde(default)]
    pub activity_id: String,
}

/// An entry in the Exchange's withdrawal address book.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressBookEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub currency_symbol: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListAddressBookResponse {
    #[serde(default)]
    pub addresses: Vec<AddressBookEntry>,
}
