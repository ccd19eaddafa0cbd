use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;
use uuid::Uuid;

use subledger_core::DatabaseConfig;
use subledger_ledger::{LedgerError, Result};

use crate::storage;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TIMESTAMP,
    updated_at TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);
CREATE INDEX IF NOT EXISTS idx_users_active ON users(active);

CREATE TABLE IF NOT EXISTS addresses (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    asset TEXT NOT NULL,
    network TEXT NOT NULL,
    address TEXT NOT NULL,
    wallet_id TEXT NOT NULL,
    account_identifier TEXT NOT NULL,
    created_at TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_addresses_user_asset ON addresses(user_id, asset);
CREATE INDEX IF NOT EXISTS idx_addresses_address ON addresses(address);
CREATE INDEX IF NOT EXISTS idx_addresses_wallet_id ON addresses(wallet_id);

CREATE TABLE IF NOT EXISTS account_balances (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    asset TEXT NOT NULL,
    balance TEXT NOT NULL DEFAULT '0',
    last_transaction_id TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    updated_at TIMESTAMP,
    UNIQUE(user_id, asset)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_account_balances_user_asset
    ON account_balances(user_id, asset);

CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    asset TEXT NOT NULL,
    transaction_type TEXT NOT NULL,
    amount TEXT NOT NULL,
    balance_before TEXT NOT NULL,
    balance_after TEXT NOT NULL,
    external_transaction_id TEXT,
    address TEXT,
    reference TEXT,
    status TEXT DEFAULT 'confirmed',
    created_at TIMESTAMP,
    processed_at TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_transactions_user_asset ON transactions(user_id, asset);
CREATE INDEX IF NOT EXISTS idx_transactions_created_at ON transactions(created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_external_id
    ON transactions(external_transaction_id)
    WHERE external_transaction_id IS NOT NULL AND external_transaction_id != '';
"#;

/// SQLite connection pool wrapper.
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens the database file (creating it if missing), applies the schema,
    /// and optionally seeds a few dummy users for local testing.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if config.path.is_empty() {
            return Err(LedgerError::Storage("database path cannot be empty".into()));
        }
        if config.max_open_conns == 0 {
            return Err(LedgerError::Storage(
                "max open connections must be positive".into(),
            ));
        }

        info!(path = %config.path, "Opening SQLite database");

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.ping_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns.min(config.max_open_conns))
            .max_lifetime(config.conn_max_lifetime)
            .idle_timeout(config.conn_max_idle_time)
            .acquire_timeout(config.ping_timeout)
            .connect_with(options)
            .await
            .map_err(storage)?;

        let db = Self { pool };
        db.init_schema(config.create_dummy_users).await?;

        info!("Database service initialized");
        Ok(db)
    }

    /// A single-connection in-memory database, used by tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;

        let db = Self { pool };
        db.init_schema(false).await?;
        Ok(db)
    }

    pub fn inner(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    async fn init_schema(&self, create_dummy_users: bool) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        if create_dummy_users {
            let now = chrono::Utc::now();
            for (name, email) in [
                ("Alice Johnson", "alice.johnson@example.com"),
                ("Bob Smith", "bob.smith@example.com"),
                ("Carol Williams", "carol.williams@example.com"),
            ] {
                let id = Uuid::new_v4().to_string();
                let result = sqlx::query(
                    "INSERT OR IGNORE INTO users (id, name, email, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                )
                .bind(&id)
                .bind(name)
                .bind(email)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(storage)?;

                if result.rows_affected() > 0 {
                    info!(id = %id, name = name, "Dummy user created");
                }
            }
        } else {
            info!("Skipping dummy user creation");
        }

        Ok(())
    }
}
