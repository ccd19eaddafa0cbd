use thiserror::Error;

/// Errors shared across every Ledger Store backend.
///
/// The first five variants are sentinels callers are expected to match on;
/// everything else surfaces as `Storage`.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The same external transaction id was seen before. Reconciler callers
    /// treat this as success and mark the transaction processed.
    #[error("duplicate transaction: external id {0} already exists")]
    Duplicate(String),

    /// A balance row changed between read and write (version mismatch).
    /// Surfaced to the caller with a retry hint; never auto-retried.
    #[error("concurrent modification detected")]
    ConcurrentModification,

    /// No user owns the given address / id / email.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// The operation is unavailable on this backend (e.g. native revert on
    /// the relational store). Callers fall back to the compensating path.
    #[error("not supported by this backend: {0}")]
    NotSupported(&'static str),

    /// No matching pending-phase transaction exists for the reference.
    /// Drives the D2 -> D3 deposit fallback and the nothing-reserved revert
    /// short-circuit.
    #[error("no pending transaction found for reference {0}")]
    PendingNotFound(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
