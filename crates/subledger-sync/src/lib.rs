mod cache;
mod conversion;
mod coordinator;
mod deposit;
mod reconciler;
mod withdrawal;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::ProcessedCache;
pub use coordinator::{
    CoordinatorError, WithdrawalCoordinator, WithdrawalOutcome, WithdrawalRequest,
};
pub use reconciler::{Reconciler, ReconcilerHandle};

use rust_decimal::Decimal;
use thiserror::Error;

/// Exchange transaction statuses the reconciler classifies on.
pub(crate) mod status {
    pub const IMPORT_PENDING: &str = "TRANSACTION_IMPORT_PENDING";
    pub const IMPORTED: &str = "TRANSACTION_IMPORTED";
    pub const DONE: &str = "TRANSACTION_DONE";

    /// Terminal failures that require compensating the reservation.
    pub const TERMINAL_FAILURES: [&str; 4] = [
        "TRANSACTION_CANCELLED",
        "TRANSACTION_REJECTED",
        "TRANSACTION_FAILED",
        "TRANSACTION_EXPIRED",
    ];

    pub fn is_terminal_failure(status: &str) -> bool {
        TERMINAL_FAILURES.contains(&status)
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no wallets to monitor - make sure addresses have been created")]
    NoWallets,

    #[error("startup recovery failed for majority of wallets ({failed}/{total}): {details}")]
    RecoveryFailed {
        failed: usize,
        total: usize,
        details: String,
    },

    #[error("invalid amount: {0:?}")]
    InvalidAmount(String),

    #[error(transparent)]
    Assets(#[from] subledger_core::CoreError),

    #[error(transparent)]
    Exchange(#[from] subledger_prime::PrimeError),

    #[error(transparent)]
    Ledger(#[from] subledger_ledger::LedgerError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Parses an Exchange-reported amount string.
pub(crate) fn parse_amount(raw: &str) -> Result<Decimal> {
    raw.trim()
        .parse::<Decimal>()
        .map_err(|_| SyncError::InvalidAmount(raw.to_string()))
}
