use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use subledger_core::types::{AccountBalance, Address, TransactionRecord, User};

use crate::error::Result;

/// Parameters for storing a deposit address or withdrawal destination.
#[derive(Debug, Clone, Default)]
pub struct StoreAddressParams {
    pub user_id: String,
    pub asset: String,
    pub network: String,
    pub address: String,
    pub wallet_id: String,
    pub account_identifier: String,
}

/// Supplementary Exchange data attached to deposit transactions when
/// available. The double-entry backend stores it as transaction metadata;
/// the relational backend ignores it.
#[derive(Debug, Clone, Default)]
pub struct DepositMeta {
    pub prime_tx_id: String,
    pub source_address: String,
    pub source_type: String,
    pub network_fees: String,
    pub fees: String,
    pub blockchain_ids: Vec<String>,
    pub network: String,
    pub prime_api_symbol: String,
    pub wallet_id: String,
    pub created_at: String,
    pub completed_at: String,
    /// Effective ledger timestamp for the entry.
    pub transaction_time: Option<DateTime<Utc>>,
}

/// A pending withdrawal debited straight from the custodial wallet, for
/// withdrawals initiated outside this system (W2).
#[derive(Debug, Clone, Default)]
pub struct WalletWithdrawalParams {
    pub transaction_id: String,
    pub status: String,
    pub symbol: String,
    pub prime_api_symbol: String,
    pub amount: Decimal,
    pub wallet_id: String,
    pub destination_address: String,
    pub idempotency_key: String,
    pub transaction_time: Option<DateTime<Utc>>,
}

/// A terminal-failure withdrawal that could not be matched to any user (W6).
/// Both the synthetic initiation and its reversal are recorded so the ledger
/// keeps a complete audit trail with zero net balance impact.
#[derive(Debug, Clone, Default)]
pub struct FailedWithdrawalPlatformParams {
    pub transaction_id: String,
    pub status: String,
    pub symbol: String,
    pub prime_api_symbol: String,
    pub amount: Decimal,
    pub wallet_id: String,
    pub destination_address: String,
    pub idempotency_key: String,
    pub transaction_time: Option<DateTime<Utc>>,
}

/// A confirmed withdrawal debited directly from the user (with overdraft)
/// when no prior pending phase exists (W4).
#[derive(Debug, Clone, Default)]
pub struct ConfirmWithdrawalDirectParams {
    pub user_id: String,
    pub asset: String,
    pub amount: Decimal,
    pub wallet_id: String,
    pub external_tx_id: String,
    pub withdrawal_ref: String,
    pub destination_address: String,
    pub network: String,
    pub prime_tx_id: String,
    pub idempotency_key: String,
    pub transaction_time: Option<DateTime<Utc>>,
}

/// Any Exchange transaction type the reconciler does not classify
/// (transfers, rewards, internal movements, ...), recorded against the
/// portfolio's catch-all account.
#[derive(Debug, Clone, Default)]
pub struct PlatformTransactionParams {
    pub transaction_id: String,
    pub transaction_type: String,
    pub status: String,
    pub symbol: String,
    pub amount: String,
    pub network: String,
    pub wallet_id: String,
    pub transaction_time: Option<DateTime<Utc>>,
    pub metadata: Vec<(String, String)>,
}

/// A cross-asset conversion reported by the Exchange (C1).
#[derive(Debug, Clone, Default)]
pub struct ConversionParams {
    pub transaction_id: String,
    pub status: String,
    pub source_symbol: String,
    pub source_amount: String,
    pub destination_symbol: String,
    pub destination_amount: String,
    pub source_wallet_id: String,
    pub dest_wallet_id: String,
    pub network: String,
    pub fees: String,
    pub fee_symbol: String,
    pub transaction_time: Option<DateTime<Utc>>,
}

/// The contract every backend must satisfy. Every mutating operation is
/// idempotent by external id (a second call with the same id yields
/// [`LedgerError::Duplicate`](crate::LedgerError::Duplicate)) and atomic:
/// either the whole event is durable or none of it is.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // --- Users ---
    async fn users(&self) -> Result<Vec<User>>;
    async fn user_by_id(&self, user_id: &str) -> Result<User>;
    async fn user_by_email(&self, email: &str) -> Result<User>;
    async fn create_user(&self, user_id: &str, name: &str, email: &str) -> Result<User>;

    // --- Addresses ---
    async fn store_address(&self, params: StoreAddressParams) -> Result<Address>;
    async fn addresses(&self, user_id: &str, asset: &str, network: &str) -> Result<Vec<Address>>;
    async fn all_user_addresses(&self, user_id: &str) -> Result<Vec<Address>>;
    /// Case-insensitive lookup of the user owning a deposit address or
    /// registered withdrawal destination. `Ok(None)` when nobody owns it.
    async fn find_user_by_address(&self, address: &str) -> Result<Option<(User, Address)>>;

    // --- Balances ---
    async fn user_balance(&self, user_id: &str, asset: &str) -> Result<Decimal>;
    async fn all_user_balances(&self, user_id: &str) -> Result<Vec<AccountBalance>>;

    // --- Deposits ---
    /// D1: park incoming funds in the pending-deposits account. No-op on
    /// backends without a pending phase.
    async fn process_deposit_pending(
        &self,
        asset: &str,
        wallet_id: &str,
        amount: Decimal,
        transaction_id: &str,
        deposit_address: &str,
        transaction_time: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// D2: settle a previously-parked deposit into the user's account.
    /// Returns [`LedgerError::PendingNotFound`](crate::LedgerError::PendingNotFound)
    /// when no pending phase exists, directing the caller to
    /// [`process_deposit`](Self::process_deposit).
    async fn confirm_deposit(
        &self,
        address: &str,
        asset: &str,
        amount: Decimal,
        transaction_id: &str,
        transaction_time: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// D3: credit the user (or the catch-all account) directly.
    async fn process_deposit(
        &self,
        address: &str,
        asset: &str,
        amount: Decimal,
        transaction_id: &str,
        meta: Option<&DepositMeta>,
    ) -> Result<()>;

    // --- Withdrawals ---
    /// W1: reserve funds for a user-initiated withdrawal.
    async fn process_withdrawal(
        &self,
        user_id: &str,
        asset: &str,
        amount: Decimal,
        transaction_id: &str,
    ) -> Result<()>;

    /// W2: wallet -> pending for withdrawals not initiated by this system.
    async fn process_withdrawal_from_wallet(&self, params: WalletWithdrawalParams) -> Result<()>;

    /// W3: settle a reservation once the Exchange reports completion.
    async fn confirm_withdrawal(
        &self,
        user_id: &str,
        asset: &str,
        amount: Decimal,
        withdrawal_ref: &str,
        external_tx_id: &str,
    ) -> Result<()>;

    /// W4: confirmed withdrawal with no prior reservation.
    async fn confirm_withdrawal_direct(&self, params: ConfirmWithdrawalDirectParams) -> Result<()>;

    /// W5: compensating credit restoring a failed withdrawal's reservation.
    async fn reverse_withdrawal(
        &self,
        user_id: &str,
        asset: &str,
        amount: Decimal,
        original_tx_id: &str,
    ) -> Result<()>;

    /// True when a non-reverted W1 or W2 exists for the reference.
    async fn has_pending_withdrawal(&self, withdrawal_ref: &str) -> Result<bool>;

    /// Native revert of the transaction carrying the reference. A second
    /// revert of an already-reverted transaction succeeds as a no-op.
    /// Backends without native revert return
    /// [`LedgerError::NotSupported`](crate::LedgerError::NotSupported).
    async fn revert_transaction(&self, reference: &str) -> Result<()>;

    /// W6: unmatched terminal-failure round trip on the platform accounts.
    async fn record_failed_withdrawal_platform(
        &self,
        params: FailedWithdrawalPlatformParams,
    ) -> Result<()>;

    // --- Platform ---
    async fn record_platform_transaction(&self, params: PlatformTransactionParams) -> Result<()>;
    async fn record_conversion(&self, params: ConversionParams) -> Result<()>;

    // --- Queries ---
    async fn transaction_history(
        &self,
        user_id: &str,
        asset: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TransactionRecord>>;

    /// Timestamp of the most recent recorded transaction, if any. Used to
    /// size the startup recovery window.
    async fn most_recent_transaction_time(&self) -> Result<Option<DateTime<Utc>>>;

    /// Verifies the stored balance equals the signed sum of confirmed
    /// transactions for the pair. No-op on derived-balance backends.
    async fn reconcile_user_balance(&self, user_id: &str, asset: &str) -> Result<()>;
}
