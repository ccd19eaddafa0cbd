mod models;
mod pool;
mod store;
mod subledger;

pub use pool::DatabasePool;
pub use store::RelationalStore;

use subledger_ledger::LedgerError;

/// Maps any displayable error into the ledger's catch-all storage variant.
pub(crate) fn storage<E: std::fmt::Display>(err: E) -> LedgerError {
    LedgerError::Storage(err.to_string())
}
