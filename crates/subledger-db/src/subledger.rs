use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use subledger_core::types::TransactionRecord;
use subledger_ledger::{LedgerError, Result};

use crate::models::{parse_decimal, DbTransaction};
use crate::storage;

/// Parameters for one balance-moving journal entry.
#[derive(Debug, Clone, Default)]
pub(crate) struct ApplyParams {
    pub user_id: String,
    pub asset: String,
    pub transaction_type: String,
    pub amount: Decimal,
    pub external_tx_id: String,
    pub address: String,
    pub reference: String,
}

/// Atomically appends a journal row and updates the balance row for the
/// (user, asset) pair.
///
/// Within one SQL transaction: the balance row is read (or created at
/// version 1), the journal row is inserted with balance_before/after, and
/// the balance row is updated only if its version still matches the
/// read-time version. A version mismatch surfaces as
/// `ConcurrentModification`; a reused non-empty external id surfaces as
/// `Duplicate` before any mutation (and is also enforced by a partial
/// unique index as a backstop against racing writers).
pub(crate) async fn apply_transaction(
    pool: &SqlitePool,
    params: ApplyParams,
) -> Result<TransactionRecord> {
    info!(
        user_id = %params.user_id,
        asset = %params.asset,
        transaction_type = %params.transaction_type,
        amount = %params.amount,
        external_tx_id = %params.external_tx_id,
        "Processing transaction"
    );

    if !params.external_tx_id.is_empty() {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM transactions WHERE external_transaction_id = ?1 LIMIT 1")
                .bind(&params.external_tx_id)
                .fetch_optional(pool)
                .await
                .map_err(storage)?;

        if let Some((internal_id,)) = existing {
            warn!(
                external_tx_id = %params.external_tx_id,
                existing_internal_tx_id = %internal_id,
                "Duplicate external transaction id detected, skipping"
            );
            return Err(LedgerError::Duplicate(params.external_tx_id));
        }
    }

    let mut tx = pool.begin().await.map_err(storage)?;

    let row: Option<(String, String, i64)> =
        sqlx::query_as("SELECT id, balance, version FROM account_balances WHERE user_id = ?1 AND asset = ?2")
            .bind(&params.user_id)
            .bind(&params.asset)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;

    let now = Utc::now();
    let (current_balance, version) = match row {
        Some((_, balance, version)) => (parse_decimal(&balance)?, version),
        None => {
            let account_id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO account_balances (id, user_id, asset, balance, version, updated_at) \
                 VALUES (?1, ?2, ?3, '0', 1, ?4)",
            )
            .bind(&account_id)
            .bind(&params.user_id)
            .bind(&params.asset)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
            (Decimal::ZERO, 1)
        }
    };

    let new_balance = current_balance + params.amount;
    let transaction_id = Uuid::new_v4().to_string();

    sqlx::query(
        "INSERT INTO transactions \
         (id, user_id, asset, transaction_type, amount, balance_before, balance_after, \
          external_transaction_id, address, reference, status, created_at, processed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'confirmed', ?11, ?11)",
    )
    .bind(&transaction_id)
    .bind(&params.user_id)
    .bind(&params.asset)
    .bind(&params.transaction_type)
    .bind(params.amount.to_string())
    .bind(current_balance.to_string())
    .bind(new_balance.to_string())
    .bind(&params.external_tx_id)
    .bind(&params.address)
    .bind(&params.reference)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        // racing writers land on the partial unique index
        if let Some(db) = e.as_database_error() {
            if db.is_unique_violation() {
                return LedgerError::Duplicate(params.external_tx_id.clone());
            }
        }
        storage(e)
    })?;

    let updated = sqlx::query(
        "UPDATE account_balances \
         SET balance = ?1, last_transaction_id = ?2, version = version + 1, updated_at = ?3 \
         WHERE user_id = ?4 AND asset = ?5 AND version = ?6",
    )
    .bind(new_balance.to_string())
    .bind(&transaction_id)
    .bind(now)
    .bind(&params.user_id)
    .bind(&params.asset)
    .bind(version)
    .execute(&mut *tx)
    .await
    .map_err(storage)?;

    if updated.rows_affected() == 0 {
        return Err(LedgerError::ConcurrentModification);
    }

    tx.commit().await.map_err(storage)?;

    info!(
        transaction_id = %transaction_id,
        user_id = %params.user_id,
        asset = %params.asset,
        old_balance = %current_balance,
        new_balance = %new_balance,
        "Transaction processed"
    );

    Ok(TransactionRecord {
        id: transaction_id,
        user_id: params.user_id,
        asset: params.asset,
        transaction_type: params.transaction_type,
        amount: params.amount,
        balance_before: current_balance,
        balance_after: new_balance,
        external_transaction_id: params.external_tx_id,
        address: params.address,
        reference: params.reference,
        status: "confirmed".to_string(),
        created_at: now,
        processed_at: now,
    })
}

pub(crate) async fn get_balance(pool: &SqlitePool, user_id: &str, asset: &str) -> Result<Decimal> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT balance FROM account_balances WHERE user_id = ?1 AND asset = ?2")
            .bind(user_id)
            .bind(asset)
            .fetch_optional(pool)
            .await
            .map_err(storage)?;

    match row {
        Some((balance,)) => parse_decimal(&balance),
        // no balance row means zero balance
        None => Ok(Decimal::ZERO),
    }
}

pub(crate) async fn transaction_history(
    pool: &SqlitePool,
    user_id: &str,
    asset: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<TransactionRecord>> {
    let rows: Vec<DbTransaction> = sqlx::query_as(
        "SELECT id, user_id, asset, transaction_type, amount, balance_before, balance_after, \
                external_transaction_id, address, reference, status, created_at, processed_at \
         FROM transactions \
         WHERE user_id = ?1 AND asset = ?2 \
         ORDER BY created_at DESC \
         LIMIT ?3 OFFSET ?4",
    )
    .bind(user_id)
    .bind(asset)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(storage)?;

    rows.into_iter().map(TransactionRecord::try_from).collect()
}

pub(crate) async fn most_recent_transaction_time(
    pool: &SqlitePool,
) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT created_at FROM transactions \
         WHERE external_transaction_id IS NOT NULL AND external_transaction_id != '' \
         ORDER BY created_at DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .map_err(storage)?;

    Ok(row.map(|(t,)| t))
}

/// Verifies the stored balance equals the signed sum of confirmed
/// transactions for the pair. Amounts are summed in Rust so TEXT-stored
/// decimals are never coerced to floats. Negative balances are legal
/// (historical replay); only disagreement fails.
pub(crate) async fn reconcile_balance(pool: &SqlitePool, user_id: &str, asset: &str) -> Result<()> {
    let current = get_balance(pool, user_id, asset).await?;

    let amounts: Vec<(String,)> = sqlx::query_as(
        "SELECT amount FROM transactions \
         WHERE user_id = ?1 AND asset = ?2 AND status = 'confirmed'",
    )
    .bind(user_id)
    .bind(asset)
    .fetch_all(pool)
    .await
    .map_err(storage)?;

    let mut calculated = Decimal::ZERO;
    for (raw,) in &amounts {
        calculated += parse_decimal(raw)?;
    }

    if current != calculated {
        warn!(
            user_id = %user_id,
            asset = %asset,
            current_balance = %current,
            calculated_balance = %calculated,
            difference = %(current - calculated),
            "Balance reconciliation failed"
        );
        return Err(LedgerError::Storage(format!(
            "balance mismatch: current={current}, calculated={calculated}"
        )));
    }

    info!(user_id = %user_id, asset = %asset, balance = %current, "Balance reconciliation successful");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DatabasePool;

    fn params(
        user_id: &str,
        asset: &str,
        transaction_type: &str,
        amount: Decimal,
        external: &str,
    ) -> ApplyParams {
        ApplyParams {
            user_id: user_id.to_string(),
            asset: asset.to_string(),
            transaction_type: transaction_type.to_string(),
            amount,
            external_tx_id: external.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn deposit_creates_balance_and_journal_row() {
        let db = DatabasePool::connect_in_memory().await.unwrap();
        let amount: Decimal = "1.5".parse().unwrap();

        let record = apply_transaction(db.inner(), params("user1", "BTC", "deposit", amount, "tx1"))
            .await
            .unwrap();

        assert_eq!(record.user_id, "user1");
        assert_eq!(record.balance_before, Decimal::ZERO);
        assert_eq!(record.balance_after, amount);
        assert_eq!(get_balance(db.inner(), "user1", "BTC").await.unwrap(), amount);
    }

    #[tokio::test]
    async fn withdrawal_debits_balance() {
        let db = DatabasePool::connect_in_memory().await.unwrap();

        apply_transaction(
            db.inner(),
            params("user1", "BTC", "deposit", "2".parse().unwrap(), "tx1"),
        )
        .await
        .unwrap();

        let record = apply_transaction(
            db.inner(),
            params("user1", "BTC", "withdrawal", "-0.5".parse().unwrap(), "tx2"),
        )
        .await
        .unwrap();

        assert_eq!(record.balance_after, "1.5".parse::<Decimal>().unwrap());
    }

    #[tokio::test]
    async fn duplicate_external_id_rejected() {
        let db = DatabasePool::connect_in_memory().await.unwrap();
        let amount: Decimal = "1".parse().unwrap();

        apply_transaction(db.inner(), params("user1", "BTC", "deposit", amount, "dup-tx"))
            .await
            .unwrap();

        let err = apply_transaction(db.inner(), params("user1", "BTC", "deposit", amount, "dup-tx"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Duplicate(_)));

        // balance unchanged by the rejected write
        assert_eq!(get_balance(db.inner(), "user1", "BTC").await.unwrap(), amount);
    }

    #[tokio::test]
    async fn empty_external_ids_do_not_collide() {
        let db = DatabasePool::connect_in_memory().await.unwrap();

        apply_transaction(
            db.inner(),
            params("user1", "BTC", "deposit", "1".parse().unwrap(), ""),
        )
        .await
        .unwrap();
        apply_transaction(
            db.inner(),
            params("user1", "BTC", "deposit", "1".parse().unwrap(), ""),
        )
        .await
        .unwrap();

        assert_eq!(
            get_balance(db.inner(), "user1", "BTC").await.unwrap(),
            "2".parse::<Decimal>().unwrap()
        );
    }

    #[tokio::test]
    async fn negative_balance_allowed_for_historical_replay() {
        let db = DatabasePool::connect_in_memory().await.unwrap();

        let record = apply_transaction(
            db.inner(),
            params("user1", "BTC", "withdrawal", "-1".parse().unwrap(), "tx1"),
        )
        .await
        .unwrap();

        assert_eq!(record.balance_after, "-1".parse::<Decimal>().unwrap());
        // negative balances still reconcile cleanly
        reconcile_balance(db.inner(), "user1", "BTC").await.unwrap();
    }

    #[tokio::test]
    async fn version_counter_increments_per_mutation() {
        let db = DatabasePool::connect_in_memory().await.unwrap();

        for i in 0..3 {
            apply_transaction(
                db.inner(),
                params("user1", "BTC", "deposit", "1".parse().unwrap(), &format!("tx{i}")),
            )
            .await
            .unwrap();
        }

        let (version,): (i64,) = sqlx::query_as(
            "SELECT version FROM account_balances WHERE user_id = 'user1' AND asset = 'BTC'",
        )
        .fetch_one(db.inner())
        .await
        .unwrap();
        assert_eq!(version, 4);
    }

    #[tokio::test]
    async fn reconcile_detects_tampered_balance() {
        let db = DatabasePool::connect_in_memory().await.unwrap();

        apply_transaction(
            db.inner(),
            params("user1", "BTC", "deposit", "5".parse().unwrap(), "tx1"),
        )
        .await
        .unwrap();

        sqlx::query("UPDATE account_balances SET balance = '9' WHERE user_id = 'user1'")
            .execute(db.inner())
            .await
            .unwrap();

        assert!(reconcile_balance(db.inner(), "user1", "BTC").await.is_err());
    }

    #[tokio::test]
    async fn history_is_paginated_newest_first() {
        let db = DatabasePool::connect_in_memory().await.unwrap();

        for i in 0..5 {
            apply_transaction(
                db.inner(),
                params("user1", "BTC", "deposit", "1".parse().unwrap(), &format!("tx{i}")),
            )
            .await
            .unwrap();
        }

        let page = transaction_history(db.inner(), "user1", "BTC", 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        let rest = transaction_history(db.inner(), "user1", "BTC", 10, 2).await.unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[tokio::test]
    async fn most_recent_time_ignores_rows_without_external_id() {
        let db = DatabasePool::connect_in_memory().await.unwrap();

        assert!(most_recent_transaction_time(db.inner()).await.unwrap().is_none());

        apply_transaction(
            db.inner(),
            params("user1", "BTC", "deposit", "1".parse().unwrap(), "tx1"),
        )
        .await
        .unwrap();

        assert!(most_recent_transaction_time(db.inner()).await.unwrap().is_some());
    }
}
