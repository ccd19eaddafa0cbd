use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;

use subledger_core::types::{AccountBalance, Address, TransactionRecord, User};
use subledger_ledger::{LedgerError, Result};

/// Row types: decimals live as TEXT in SQLite and are parsed on the way out
/// so floats never touch money.

#[derive(Debug, FromRow)]
pub struct DbUser {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbUser> for User {
    fn from(row: DbUser) -> Self {
        User {
            id: row.id,
            name: row.name,
            email: row.email,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct DbAddress {
    pub id: String,
    pub user_id: String,
    pub asset: String,
    pub network: String,
    pub address: String,
    pub wallet_id: String,
    pub account_identifier: String,
    pub created_at: DateTime<Utc>,
}

impl From<DbAddress> for Address {
    fn from(row: DbAddress) -> Self {
        Address {
            id: row.id,
            user_id: row.user_id,
            asset: row.asset,
            network: row.network,
            address: row.address,
            wallet_id: row.wallet_id,
            account_identifier: row.account_identifier,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct DbBalance {
    pub id: String,
    pub user_id: String,
    pub asset: String,
    pub balance: String,
    pub last_transaction_id: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbBalance> for AccountBalance {
    type Error = LedgerError;

    fn try_from(row: DbBalance) -> Result<Self> {
        Ok(AccountBalance {
            id: row.id,
            user_id: row.user_id,
            asset: row.asset,
            network: String::new(),
            balance: parse_decimal(&row.balance)?,
            last_transaction_id: row.last_transaction_id.unwrap_or_default(),
            version: row.version,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct DbTransaction {
    pub id: String,
    pub user_id: String,
    pub asset: String,
    pub transaction_type: String,
    pub amount: String,
    pub balance_before: String,
    pub balance_after: String,
    pub external_transaction_id: Option<String>,
    pub address: Option<String>,
    pub reference: Option<String>,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl TryFrom<DbTransaction> for TransactionRecord {
    type Error = LedgerError;

    fn try_from(row: DbTransaction) -> Result<Self> {
        Ok(TransactionRecord {
            id: row.id,
            user_id: row.user_id,
            asset: row.asset,
            transaction_type: row.transaction_type,
            amount: parse_decimal(&row.amount)?,
            balance_before: parse_decimal(&row.balance_before)?,
            balance_after: parse_decimal(&row.balance_after)?,
            external_transaction_id: row.external_transaction_id.unwrap_or_default(),
            address: row.address.unwrap_or_default(),
            reference: row.reference.unwrap_or_default(),
            status: row.status.unwrap_or_default(),
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

pub fn parse_decimal(raw: &str) -> Result<Decimal> {
    raw.parse::<Decimal>()
        .map_err(|e| LedgerError::Storage(format!("failed to parse decimal {raw:?}: {e}")))
}
