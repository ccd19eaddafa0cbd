use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A subledger user. Created once, soft-addressable by id or email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A deposit address provisioned on the Exchange, or an external withdrawal
/// destination registered for attribution (asset "WITHDRAWAL" / network
/// "external" unless the address book resolved the symbol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub id: String,
    pub user_id: String,
    pub asset: String,
    pub network: String,
    pub address: String,
    pub wallet_id: String,
    pub account_identifier: String,
    pub created_at: DateTime<Utc>,
}

/// Current balance state for a (user, asset) pair.
///
/// `network` is empty for aggregated rows (the relational backend and the
/// double-entry backend both key balances by symbol only); callers that
/// receive a per-network dimension may use it, but must never treat it as a
/// balance key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub id: String,
    pub user_id: String,
    pub asset: String,
    #[serde(default)]
    pub network: String,
    pub balance: Decimal,
    pub last_transaction_id: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Immutable transaction history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub user_id: String,
    pub asset: String,
    pub transaction_type: String,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub external_transaction_id: String,
    pub address: String,
    pub reference: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

/// A custodial trading wallet monitored by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub id: String,
    pub asset_symbol: String,
}

/// An Exchange-side portfolio (the grouping that owns wallets).
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub id: String,
    pub name: String,
}

/// An Exchange-side wallet.
#[derive(Debug, Clone)]
pub struct Wallet {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub wallet_type: String,
}

/// A deposit address as reported by the Exchange.
#[derive(Debug, Clone)]
pub struct DepositAddress {
    pub id: String,
    pub address: String,
    pub network: String,
    pub asset: String,
}

/// The receipt returned by the Exchange for a submitted withdrawal.
#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub activity_id: String,
    pub asset: String,
    pub amount: String,
    pub destination: String,
    pub idempotency_key: String,
}
