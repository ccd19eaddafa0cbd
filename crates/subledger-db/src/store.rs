use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use subledger_core::types::{AccountBalance, Address, TransactionRecord, User};
use subledger_ledger::{
    ConfirmWithdrawalDirectParams, ConversionParams, DepositMeta,
    FailedWithdrawalPlatformParams, LedgerError, LedgerStore, PlatformTransactionParams, Result,
    StoreAddressParams, WalletWithdrawalParams,
};

use crate::models::{DbAddress, DbBalance, DbUser};
use crate::pool::DatabasePool;
use crate::subledger::{self, ApplyParams};
use crate::storage;

/// Single-writer relational Ledger Store: balance row per (user, asset) with
/// a monotonic version counter, append-only journal, duplicate detection via
/// a unique external-id index.
///
/// The deposit pending phase and withdrawal settlement are no-ops here (the
/// balance moves at the single crediting/debiting step), and native revert is
/// unsupported; callers use the compensating-entry path instead.
pub struct RelationalStore {
    db: DatabasePool,
    platform_user: String,
}

impl RelationalStore {
    pub fn new(db: DatabasePool) -> Self {
        Self {
            db,
            platform_user: "platform".to_string(),
        }
    }

    /// Scopes the catch-all platform user to a portfolio.
    pub fn with_portfolio(&self, portfolio_id: &str) -> Self {
        Self {
            db: self.db.clone(),
            platform_user: format!("platform-{portfolio_id}"),
        }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.db
    }

    async fn apply(&self, params: ApplyParams) -> Result<TransactionRecord> {
        subledger::apply_transaction(self.db.inner(), params).await
    }

    /// Runs a mutation whose duplicate outcome counts as success.
    async fn apply_idempotent(&self, params: ApplyParams) -> Result<()> {
        match self.apply(params).await {
            Ok(_) => Ok(()),
            Err(LedgerError::Duplicate(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl LedgerStore for RelationalStore {
    async fn users(&self) -> Result<Vec<User>> {
        let rows: Vec<DbUser> = sqlx::query_as(
            "SELECT id, name, email, created_at, updated_at \
             FROM users WHERE active = 1 ORDER BY created_at",
        )
        .fetch_all(self.db.inner())
        .await
        .map_err(storage)?;

        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn user_by_id(&self, user_id: &str) -> Result<User> {
        let row: Option<DbUser> = sqlx::query_as(
            "SELECT id, name, email, created_at, updated_at \
             FROM users WHERE id = ?1 AND active = 1",
        )
        .bind(user_id)
        .fetch_optional(self.db.inner())
        .await
        .map_err(storage)?;

        row.map(User::from)
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        let row: Option<DbUser> = sqlx::query_as(
            "SELECT id, name, email, created_at, updated_at \
             FROM users WHERE email = ?1 AND active = 1",
        )
        .bind(email)
        .fetch_optional(self.db.inner())
        .await
        .map_err(storage)?;

        row.map(User::from)
            .ok_or_else(|| LedgerError::UserNotFound(email.to_string()))
    }

    async fn create_user(&self, user_id: &str, name: &str, email: &str) -> Result<User> {
        info!(id = %user_id, name = name, email = email, "Creating user");

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO users (id, name, email, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4)",
        )
        .bind(user_id)
        .bind(name)
        .bind(email)
        .bind(now)
        .execute(self.db.inner())
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::Storage(format!(
                "user with email {email} already exists"
            )));
        }

        self.user_by_email(email).await
    }

    async fn store_address(&self, params: StoreAddressParams) -> Result<Address> {
        info!(
            user_id = %params.user_id,
            asset = %params.asset,
            network = %params.network,
            address = %params.address,
            "Storing address"
        );

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO addresses \
             (id, user_id, asset, network, address, wallet_id, account_identifier, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&id)
        .bind(&params.user_id)
        .bind(&params.asset)
        .bind(&params.network)
        .bind(&params.address)
        .bind(&params.wallet_id)
        .bind(&params.account_identifier)
        .bind(now)
        .execute(self.db.inner())
        .await
        .map_err(storage)?;

        Ok(Address {
            id,
            user_id: params.user_id,
            asset: params.asset,
            network: params.network,
            address: params.address,
            wallet_id: params.wallet_id,
            account_identifier: params.account_identifier,
            created_at: now,
        })
    }

    async fn addresses(&self, user_id: &str, asset: &str, network: &str) -> Result<Vec<Address>> {
        let rows: Vec<DbAddress> = sqlx::query_as(
            "SELECT id, user_id, asset, network, address, wallet_id, account_identifier, created_at \
             FROM addresses \
             WHERE user_id = ?1 AND asset = ?2 AND network = ?3 \
             ORDER BY created_at DESC",
        )
        .bind(user_id)
        .bind(asset)
        .bind(network)
        .fetch_all(self.db.inner())
        .await
        .map_err(storage)?;

        Ok(rows.into_iter().map(Address::from).collect())
    }

    async fn all_user_addresses(&self, user_id: &str) -> Result<Vec<Address>> {
        let rows: Vec<DbAddress> = sqlx::query_as(
            "SELECT id, user_id, asset, network, address, wallet_id, account_identifier, created_at \
             FROM addresses \
             WHERE user_id = ?1 \
             ORDER BY asset, created_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.db.inner())
        .await
        .map_err(storage)?;

        Ok(rows.into_iter().map(Address::from).collect())
    }

    async fn find_user_by_address(&self, address: &str) -> Result<Option<(User, Address)>> {
        type JoinedRow = (
            String,
            String,
            String,
            DateTime<Utc>,
            DateTime<Utc>,
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            DateTime<Utc>,
        );

        let row: Option<JoinedRow> = sqlx::query_as(
            "SELECT u.id, u.name, u.email, u.created_at, u.updated_at, \
                    a.id, a.user_id, a.asset, a.network, a.address, a.wallet_id, \
                    a.account_identifier, a.created_at \
             FROM users u \
             JOIN addresses a ON u.id = a.user_id \
             WHERE LOWER(a.address) = LOWER(?1) AND u.active = 1 \
             LIMIT 1",
        )
        .bind(address)
        .fetch_optional(self.db.inner())
        .await
        .map_err(storage)?;

        Ok(row.map(
            |(
                user_id,
                name,
                email,
                user_created,
                user_updated,
                addr_id,
                owner_id,
                asset,
                network,
                addr,
                wallet_id,
                account_identifier,
                addr_created,
            )| {
                (
                    User {
                        id: user_id,
                        name,
                        email,
                        created_at: user_created,
                        updated_at: user_updated,
                    },
                    Address {
                        id: addr_id,
                        user_id: owner_id,
                        asset,
                        network,
                        address: addr,
                        wallet_id,
                        account_identifier,
                        created_at: addr_created,
                    },
                )
            },
        ))
    }

    async fn user_balance(&self, user_id: &str, asset: &str) -> Result<Decimal> {
        subledger::get_balance(self.db.inner(), user_id, asset).await
    }

    async fn all_user_balances(&self, user_id: &str) -> Result<Vec<AccountBalance>> {
        let rows: Vec<DbBalance> = sqlx::query_as(
            "SELECT id, user_id, asset, balance, last_transaction_id, version, updated_at \
             FROM account_balances WHERE user_id = ?1 ORDER BY asset",
        )
        .bind(user_id)
        .fetch_all(self.db.inner())
        .await
        .map_err(storage)?;

        let mut balances = Vec::with_capacity(rows.len());
        for row in rows {
            let balance = AccountBalance::try_from(row)?;
            if !balance.balance.is_zero() {
                balances.push(balance);
            }
        }
        Ok(balances)
    }

    async fn process_deposit_pending(
        &self,
        _asset: &str,
        _wallet_id: &str,
        _amount: Decimal,
        _transaction_id: &str,
        _deposit_address: &str,
        _transaction_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        // no pending phase here: the single crediting step is the import
        Ok(())
    }

    async fn confirm_deposit(
        &self,
        address: &str,
        asset: &str,
        amount: Decimal,
        transaction_id: &str,
        _transaction_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.process_deposit(address, asset, amount, transaction_id, None)
            .await
    }

    async fn process_deposit(
        &self,
        address: &str,
        asset: &str,
        amount: Decimal,
        transaction_id: &str,
        _meta: Option<&DepositMeta>,
    ) -> Result<()> {
        let Some((user, addr)) = self.find_user_by_address(address).await? else {
            warn!(address = %address, "Deposit to unknown address");
            return Err(LedgerError::UserNotFound(address.to_string()));
        };

        // The address index holds the canonical symbol fixed at provisioning
        // time; the Exchange-reported symbol may be a network variant.
        let canonical_symbol = addr.asset.clone();
        if canonical_symbol != asset {
            info!(
                address = %address,
                reported_symbol = %asset,
                canonical_symbol = %canonical_symbol,
                network = %addr.network,
                "Using canonical symbol from address index"
            );
        }

        self.apply(ApplyParams {
            user_id: user.id.clone(),
            asset: canonical_symbol.clone(),
            transaction_type: "deposit".to_string(),
            amount,
            external_tx_id: transaction_id.to_string(),
            address: address.to_string(),
            ..Default::default()
        })
        .await?;

        info!(
            user_id = %user.id,
            asset = %canonical_symbol,
            amount = %amount,
            "Deposit processed"
        );
        Ok(())
    }

    async fn process_withdrawal(
        &self,
        user_id: &str,
        asset: &str,
        amount: Decimal,
        transaction_id: &str,
    ) -> Result<()> {
        let user = self.user_by_id(user_id).await?;
        let current = self.user_balance(user_id, asset).await?;

        info!(
            user_id = %user_id,
            asset = %asset,
            current_balance = %current,
            withdrawal_amount = %amount,
            "Processing withdrawal"
        );

        self.apply(ApplyParams {
            user_id: user.id,
            asset: asset.to_string(),
            transaction_type: "withdrawal".to_string(),
            amount: -amount,
            external_tx_id: transaction_id.to_string(),
            ..Default::default()
        })
        .await?;

        Ok(())
    }

    async fn process_withdrawal_from_wallet(&self, params: WalletWithdrawalParams) -> Result<()> {
        self.apply_idempotent(ApplyParams {
            user_id: self.platform_user.clone(),
            asset: params.symbol.clone(),
            transaction_type: "withdrawal".to_string(),
            amount: -params.amount,
            external_tx_id: params.transaction_id,
            reference: format!("WITHDRAWAL_PENDING: {} {}", params.amount, params.symbol),
            ..Default::default()
        })
        .await
    }

    async fn confirm_withdrawal(
        &self,
        _user_id: &str,
        _asset: &str,
        _amount: Decimal,
        _withdrawal_ref: &str,
        _external_tx_id: &str,
    ) -> Result<()> {
        // the balance already moved at the reservation step
        Ok(())
    }

    async fn confirm_withdrawal_direct(&self, params: ConfirmWithdrawalDirectParams) -> Result<()> {
        self.apply_idempotent(ApplyParams {
            user_id: params.user_id,
            asset: params.asset,
            transaction_type: "withdrawal".to_string(),
            amount: -params.amount,
            external_tx_id: params.external_tx_id,
            address: params.destination_address,
            ..Default::default()
        })
        .await
    }

    async fn reverse_withdrawal(
        &self,
        user_id: &str,
        asset: &str,
        amount: Decimal,
        original_tx_id: &str,
    ) -> Result<()> {
        let reversal_tx_id = format!("{original_tx_id}-reversal");

        info!(
            user_id = %user_id,
            asset = %asset,
            amount = %amount,
            original_tx = %original_tx_id,
            reversal_tx = %reversal_tx_id,
            "Reversing failed withdrawal"
        );

        self.apply(ApplyParams {
            user_id: user_id.to_string(),
            asset: asset.to_string(),
            transaction_type: "deposit".to_string(),
            amount,
            external_tx_id: reversal_tx_id,
            reference: "Reversal of failed withdrawal".to_string(),
            ..Default::default()
        })
        .await?;

        Ok(())
    }

    async fn has_pending_withdrawal(&self, withdrawal_ref: &str) -> Result<bool> {
        if withdrawal_ref.is_empty() {
            return Ok(false);
        }
        let row: Option<(String,)> =
            sqlx::query_as("SELECT id FROM transactions WHERE external_transaction_id = ?1 LIMIT 1")
                .bind(withdrawal_ref)
                .fetch_optional(self.db.inner())
                .await
                .map_err(storage)?;
        Ok(row.is_some())
    }

    async fn revert_transaction(&self, _reference: &str) -> Result<()> {
        Err(LedgerError::NotSupported(
            "native revert; use the compensating-entry path",
        ))
    }

    async fn record_failed_withdrawal_platform(
        &self,
        params: FailedWithdrawalPlatformParams,
    ) -> Result<()> {
        // synthetic initiation (debit) ...
        self.apply_idempotent(ApplyParams {
            user_id: self.platform_user.clone(),
            asset: params.symbol.clone(),
            transaction_type: "withdrawal".to_string(),
            amount: -params.amount,
            external_tx_id: params.transaction_id.clone(),
            reference: format!(
                "FAILED_WITHDRAWAL: {} {} [{}]",
                params.amount, params.symbol, params.status
            ),
            ..Default::default()
        })
        .await?;

        // ... then the compensating credit, so net balance impact is zero
        self.apply_idempotent(ApplyParams {
            user_id: self.platform_user.clone(),
            asset: params.symbol.clone(),
            transaction_type: "deposit".to_string(),
            amount: params.amount,
            external_tx_id: format!("{}-failed-reversal", params.transaction_id),
            reference: format!(
                "FAILED_WITHDRAWAL_REVERSAL: {} {} [{}]",
                params.amount, params.symbol, params.status
            ),
            ..Default::default()
        })
        .await?;

        info!(
            transaction_id = %params.transaction_id,
            status = %params.status,
            asset = %params.symbol,
            amount = %params.amount,
            "Recorded failed withdrawal platform round-trip"
        );
        Ok(())
    }

    async fn record_platform_transaction(&self, params: PlatformTransactionParams) -> Result<()> {
        let amount: Decimal = params
            .amount
            .parse()
            .map_err(|_| LedgerError::InvalidAmount(params.amount.clone()))?;

        self.apply_idempotent(ApplyParams {
            user_id: self.platform_user.clone(),
            asset: params.symbol.clone(),
            transaction_type: params.transaction_type.clone(),
            amount,
            external_tx_id: params.transaction_id,
            reference: format!(
                "{}: {} {} {}",
                params.transaction_type, params.amount, params.symbol, params.network
            ),
            ..Default::default()
        })
        .await
    }

    async fn record_conversion(&self, params: ConversionParams) -> Result<()> {
        let src: Decimal = params
            .source_amount
            .parse::<Decimal>()
            .map_err(|_| LedgerError::InvalidAmount(params.source_amount.clone()))?
            .abs();

        let dst_raw = if params.destination_amount.is_empty() {
            &params.source_amount
        } else {
            &params.destination_amount
        };
        let dst: Decimal = dst_raw
            .parse::<Decimal>()
            .map_err(|_| LedgerError::InvalidAmount(dst_raw.clone()))?
            .abs();

        self.apply_idempotent(ApplyParams {
            user_id: self.platform_user.clone(),
            asset: params.source_symbol.clone(),
            transaction_type: "conversion-out".to_string(),
            amount: -src,
            external_tx_id: format!("{}-src", params.transaction_id),
            reference: format!(
                "CONVERSION: -{} {} -> {}",
                params.source_amount, params.source_symbol, params.destination_symbol
            ),
            ..Default::default()
        })
        .await?;

        self.apply_idempotent(ApplyParams {
            user_id: self.platform_user.clone(),
            asset: params.destination_symbol.clone(),
            transaction_type: "conversion-in".to_string(),
            amount: dst,
            external_tx_id: format!("{}-dst", params.transaction_id),
            reference: format!(
                "CONVERSION: +{} {} <- {}",
                dst_raw, params.destination_symbol, params.source_symbol
            ),
            ..Default::default()
        })
        .await
    }

    async fn transaction_history(
        &self,
        user_id: &str,
        asset: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TransactionRecord>> {
        subledger::transaction_history(self.db.inner(), user_id, asset, limit, offset).await
    }

    async fn most_recent_transaction_time(&self) -> Result<Option<DateTime<Utc>>> {
        subledger::most_recent_transaction_time(self.db.inner()).await
    }

    async fn reconcile_user_balance(&self, user_id: &str, asset: &str) -> Result<()> {
        subledger::reconcile_balance(self.db.inner(), user_id, asset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_user() -> (RelationalStore, User) {
        let db = DatabasePool::connect_in_memory().await.unwrap();
        let store = RelationalStore::new(db);
        let user = store
            .create_user(
                "a1b2c3d4-0000-0000-0000-000000000001",
                "Alice",
                "alice@example.com",
            )
            .await
            .unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn create_user_rejects_duplicate_email() {
        let (store, _user) = store_with_user().await;
        let err = store
            .create_user("other-id", "Alice Again", "alice@example.com")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn deposit_resolves_user_and_canonical_symbol_via_address() {
        let (store, user) = store_with_user().await;

        store
            .store_address(StoreAddressParams {
                user_id: user.id.clone(),
                asset: "USDC".to_string(),
                network: "base-mainnet".to_string(),
                address: "0xAbCd".to_string(),
                wallet_id: "w1".to_string(),
                account_identifier: "acct-1".to_string(),
            })
            .await
            .unwrap();

        // Exchange reports the network variant; the address index wins.
        store
            .process_deposit("0xabcd", "BASEUSDC", "1.50".parse().unwrap(), "tx-A", None)
            .await
            .unwrap();

        let balance = store.user_balance(&user.id, "USDC").await.unwrap();
        assert_eq!(balance, "1.50".parse::<Decimal>().unwrap());

        // replay is rejected as a duplicate, balance unchanged
        let err = store
            .process_deposit("0xabcd", "BASEUSDC", "1.50".parse().unwrap(), "tx-A", None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Duplicate(_)));
        assert_eq!(
            store.user_balance(&user.id, "USDC").await.unwrap(),
            "1.50".parse::<Decimal>().unwrap()
        );
    }

    #[tokio::test]
    async fn deposit_to_unknown_address_credits_nobody() {
        let (store, user) = store_with_user().await;

        let err = store
            .process_deposit("0xnobody", "USDC", "3".parse().unwrap(), "tx-B", None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UserNotFound(_)));
        assert!(store.all_user_balances(&user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn withdrawal_then_reverse_restores_balance() {
        let (store, user) = store_with_user().await;

        store
            .store_address(StoreAddressParams {
                user_id: user.id.clone(),
                asset: "USDC".to_string(),
                network: "base-mainnet".to_string(),
                address: "0x1".to_string(),
                wallet_id: "w1".to_string(),
                account_identifier: String::new(),
            })
            .await
            .unwrap();
        store
            .process_deposit("0x1", "USDC", "5".parse().unwrap(), "tx-dep", None)
            .await
            .unwrap();

        store
            .process_withdrawal(&user.id, "USDC", "2".parse().unwrap(), "key-1")
            .await
            .unwrap();
        assert_eq!(
            store.user_balance(&user.id, "USDC").await.unwrap(),
            "3".parse::<Decimal>().unwrap()
        );
        assert!(store.has_pending_withdrawal("key-1").await.unwrap());

        store
            .reverse_withdrawal(&user.id, "USDC", "2".parse().unwrap(), "key-1")
            .await
            .unwrap();
        assert_eq!(
            store.user_balance(&user.id, "USDC").await.unwrap(),
            "5".parse::<Decimal>().unwrap()
        );

        store.reconcile_user_balance(&user.id, "USDC").await.unwrap();
    }

    #[tokio::test]
    async fn revert_is_not_supported() {
        let (store, _user) = store_with_user().await;
        assert!(matches!(
            store.revert_transaction("anything").await.unwrap_err(),
            LedgerError::NotSupported(_)
        ));
    }

    #[tokio::test]
    async fn failed_platform_round_trip_nets_to_zero() {
        let (store, _user) = store_with_user().await;

        let params = FailedWithdrawalPlatformParams {
            transaction_id: "tx-fail".to_string(),
            status: "TRANSACTION_REJECTED".to_string(),
            symbol: "USDC".to_string(),
            amount: "7".parse().unwrap(),
            wallet_id: "w1".to_string(),
            ..Default::default()
        };
        store
            .record_failed_withdrawal_platform(params.clone())
            .await
            .unwrap();
        // replay is a no-op
        store.record_failed_withdrawal_platform(params).await.unwrap();

        let balance = store.user_balance("platform", "USDC").await.unwrap();
        assert!(balance.is_zero());

        let history = store
            .transaction_history("platform", "USDC", 10, 0)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn conversion_records_both_legs() {
        let (store, _user) = store_with_user().await;

        store
            .record_conversion(ConversionParams {
                transaction_id: "tx-conv".to_string(),
                status: "TRANSACTION_DONE".to_string(),
                source_symbol: "USD".to_string(),
                source_amount: "100".to_string(),
                destination_symbol: "USDC".to_string(),
                destination_amount: "100".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            store.user_balance("platform", "USD").await.unwrap(),
            "-100".parse::<Decimal>().unwrap()
        );
        assert_eq!(
            store.user_balance("platform", "USDC").await.unwrap(),
            "100".parse::<Decimal>().unwrap()
        );
    }

    #[tokio::test]
    async fn find_user_by_address_is_case_insensitive() {
        let (store, user) = store_with_user().await;

        store
            .store_address(StoreAddressParams {
                user_id: user.id.clone(),
                asset: "ETH".to_string(),
                network: "ethereum-mainnet".to_string(),
                address: "0xDeAdBeEf".to_string(),
                wallet_id: "w2".to_string(),
                account_identifier: String::new(),
            })
            .await
            .unwrap();

        let (found, addr) = store
            .find_user_by_address("0XDEADBEEF")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(addr.asset, "ETH");
    }
}
