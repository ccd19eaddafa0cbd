use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{error, info, warn};

use subledger_core::idempotency;
use subledger_ledger::{LedgerError, LedgerStore};
use subledger_prime::{CreateWithdrawalParams, PrimeApi};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("invalid asset format {0:?}, expected SYMBOL-network (e.g. USDC-base-mainnet)")]
    InvalidAsset(String),

    #[error("amount must be greater than zero")]
    InvalidAmount,

    #[error("user not found for email {0}")]
    UnknownUser(String),

    #[error("insufficient balance: current={available}, requested={requested}, shortfall={shortfall}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
        shortfall: Decimal,
    },

    #[error("no wallet found for asset {symbol}-{network}")]
    NoWallet { symbol: String, network: String },

    /// The reservation lost a race; safe to retry.
    #[error("withdrawal reservation conflicted, please retry: {0}")]
    Retryable(String),

    /// Submission failed and the reservation was rolled back.
    #[error("exchange submission failed (funds restored): {0}")]
    SubmissionFailed(String),

    /// Submission failed AND the rollback failed. The ledger still holds the
    /// reservation; the two identifiers reconstruct the state.
    #[error(
        "CRITICAL: rollback failed - manual intervention required \
         (reservation id {reservation_ref}, reversal id {reversal_ref}): {source}"
    )]
    RollbackFailed {
        reservation_ref: String,
        reversal_ref: String,
        source: LedgerError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// A user-initiated withdrawal request from the command surface.
#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub email: String,
    /// `SYMBOL-NETWORK`, e.g. `USDC-base-mainnet`.
    pub asset: String,
    pub amount: Decimal,
    pub destination: String,
}

/// The outcome of a coordinated withdrawal.
#[derive(Debug, Clone)]
pub enum WithdrawalOutcome {
    /// The idempotency key was already used; the prior record is returned
    /// without any mutation.
    AlreadyProcessed {
        transaction_id: String,
        amount: Decimal,
        processed_at: DateTime<Utc>,
    },
    /// Reserved locally and accepted by the Exchange. Settlement (W3) or
    /// reversal (W5) happens asynchronously through the reconciler.
    Submitted {
        activity_id: String,
        idempotency_key: String,
        user_id: String,
        remaining_balance: Decimal,
    },
}

/// Synchronous command path for user-initiated withdrawals: validate ->
/// reserve -> submit -> reverse on failure. Stateless between invocations;
/// all durable state lives in the Ledger Store.
pub struct WithdrawalCoordinator {
    store: Arc<dyn LedgerStore>,
    exchange: Arc<dyn PrimeApi>,
    portfolio_id: String,
}

impl WithdrawalCoordinator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        exchange: Arc<dyn PrimeApi>,
        portfolio_id: &str,
    ) -> Self {
        Self {
            store,
            exchange,
            portfolio_id: portfolio_id.to_string(),
        }
    }

    pub async fn run(&self, request: &WithdrawalRequest) -> Result<WithdrawalOutcome> {
        let user = self
            .store
            .user_by_email(&request.email)
            .await
            .map_err(|_| CoordinatorError::UnknownUser(request.email.clone()))?;

        let key = idempotency::generate_key(&user.id);
        self.run_with_key(request, &key).await
    }

    /// The full flow with an explicit idempotency key. `run` generates a
    /// fresh key per invocation; retries of a known key short-circuit to
    /// the original record.
    pub async fn run_with_key(
        &self,
        request: &WithdrawalRequest,
        idempotency_key: &str,
    ) -> Result<WithdrawalOutcome> {
        let (symbol, network) = parse_asset(&request.asset)?;
        if request.amount <= Decimal::ZERO {
            return Err(CoordinatorError::InvalidAmount);
        }

        let user = self
            .store
            .user_by_email(&request.email)
            .await
            .map_err(|_| CoordinatorError::UnknownUser(request.email.clone()))?;

        info!(
            user_id = %user.id,
            asset = %request.asset,
            amount = %request.amount,
            destination = %request.destination,
            "Starting withdrawal"
        );

        let available = self
            .verify_balance(&user.id, symbol, network, request.amount)
            .await?;

        let wallet_id = self.wallet_for_asset(&user.id, symbol, network).await?;

        if let Some(existing) = self
            .existing_withdrawal(&user.id, symbol, idempotency_key)
            .await?
        {
            return Ok(existing);
        }

        // Reserve (W1). A conflict here means another invocation raced us:
        // surface it for the operator to retry, never auto-retry.
        info!(
            user_id = %user.id,
            asset = symbol,
            amount = %request.amount,
            idempotency_key = idempotency_key,
            "Reserving funds"
        );
        match self
            .store
            .process_withdrawal(&user.id, symbol, request.amount, idempotency_key)
            .await
        {
            Ok(()) => {}
            Err(LedgerError::ConcurrentModification) => {
                return Err(CoordinatorError::Retryable(
                    "balance was modified by another withdrawal".to_string(),
                ));
            }
            Err(LedgerError::Duplicate(_)) => {
                return Err(CoordinatorError::Retryable(
                    "a withdrawal with this idempotency key is already in flight".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        // Submit to the Exchange with the same idempotency key.
        let submission = self
            .exchange
            .create_withdrawal(CreateWithdrawalParams {
                portfolio_id: self.portfolio_id.clone(),
                wallet_id,
                destination_address: request.destination.clone(),
                amount: request.amount.to_string(),
                asset: request.asset.clone(),
                idempotency_key: idempotency_key.to_string(),
            })
            .await;

        let receipt = match submission {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(
                    user_id = %user.id,
                    asset = symbol,
                    amount = %request.amount,
                    error = %e,
                    "Exchange withdrawal failed - rolling back reservation"
                );
                self.rollback(&user.id, symbol, request.amount, idempotency_key)
                    .await?;
                return Err(CoordinatorError::SubmissionFailed(e.to_string()));
            }
        };

        info!(
            user_id = %user.id,
            activity_id = %receipt.activity_id,
            asset = symbol,
            amount = %request.amount,
            "Withdrawal completed"
        );

        Ok(WithdrawalOutcome::Submitted {
            activity_id: receipt.activity_id,
            idempotency_key: idempotency_key.to_string(),
            user_id: user.id,
            remaining_balance: available - request.amount,
        })
    }

    /// Prefers the per-network balance when the backend reports one,
    /// otherwise the symbol aggregate. Balance keys stay symbol-only; the
    /// network dimension is advisory.
    async fn verify_balance(
        &self,
        user_id: &str,
        symbol: &str,
        network: &str,
        amount: Decimal,
    ) -> Result<Decimal> {
        let balances = self.store.all_user_balances(user_id).await?;

        let mut total = Decimal::ZERO;
        let mut network_balance: Option<Decimal> = None;
        for balance in &balances {
            if balance.asset == symbol {
                total += balance.balance;
                if balance.network == network && !balance.network.is_empty() {
                    network_balance = Some(balance.balance);
                }
            }
        }

        let available = network_balance.unwrap_or(total);
        if available < amount {
            return Err(CoordinatorError::InsufficientBalance {
                available,
                requested: amount,
                shortfall: amount - available,
            });
        }

        info!(
            user_id = %user_id,
            symbol = symbol,
            network = network,
            balance = %available,
            total_across_networks = %total,
            "Balance verification successful"
        );
        Ok(available)
    }

    async fn wallet_for_asset(&self, user_id: &str, symbol: &str, network: &str) -> Result<String> {
        let addresses = self.store.addresses(user_id, symbol, network).await?;
        addresses
            .into_iter()
            .find(|a| !a.wallet_id.is_empty())
            .map(|a| a.wallet_id)
            .ok_or_else(|| CoordinatorError::NoWallet {
                symbol: symbol.to_string(),
                network: network.to_string(),
            })
    }

    /// A withdrawal record already carrying this external id means a retry
    /// of a completed submission: return it untouched.
    async fn existing_withdrawal(
        &self,
        user_id: &str,
        symbol: &str,
        idempotency_key: &str,
    ) -> Result<Option<WithdrawalOutcome>> {
        let history = self
            .store
            .transaction_history(user_id, symbol, 1000, 0)
            .await?;

        for record in history {
            if record.external_transaction_id == idempotency_key
                && record.transaction_type == "withdrawal"
            {
                info!(
                    idempotency_key = idempotency_key,
                    transaction_id = %record.id,
                    amount = %record.amount,
                    "Idempotency key already used - returning existing withdrawal"
                );
                return Ok(Some(WithdrawalOutcome::AlreadyProcessed {
                    transaction_id: record.id,
                    amount: record.amount,
                    processed_at: record.processed_at,
                }));
            }
        }
        Ok(None)
    }

    /// Undoes the reservation after a failed submission. Native revert
    /// first; the compensating credit keyed `{key}-reversal` where revert
    /// is unsupported. A rollback failure is fatal for the operator.
    async fn rollback(
        &self,
        user_id: &str,
        symbol: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<()> {
        match self.store.revert_transaction(idempotency_key).await {
            Ok(()) => {
                info!(idempotency_key = idempotency_key, "Reservation reverted natively");
                return Ok(());
            }
            Err(LedgerError::NotSupported(_)) | Err(LedgerError::PendingNotFound(_)) => {
                warn!("Native revert unavailable, using compensating transaction");
            }
            Err(source) => {
                return Err(CoordinatorError::RollbackFailed {
                    reservation_ref: idempotency_key.to_string(),
                    reversal_ref: format!("{idempotency_key}-reversal"),
                    source,
                });
            }
        }

        match self
            .store
            .reverse_withdrawal(user_id, symbol, amount, idempotency_key)
            .await
        {
            Ok(()) | Err(LedgerError::Duplicate(_)) => {
                info!("Balance restored (rollback successful)");
                Ok(())
            }
            Err(source) => Err(CoordinatorError::RollbackFailed {
                reservation_ref: idempotency_key.to_string(),
                reversal_ref: format!("{idempotency_key}-reversal"),
                source,
            }),
        }
    }
}

/// Splits `SYMBOL-NETWORK` on the first hyphen.
fn parse_asset(asset: &str) -> Result<(&str, &str)> {
    match asset.split_once('-') {
        Some((symbol, network)) if !symbol.is_empty() && !network.is_empty() => {
            Ok((symbol, network))
        }
        _ => Err(CoordinatorError::InvalidAsset(asset.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_user_with_funds, MockExchange, ALICE_ID};
    use subledger_db::{DatabasePool, RelationalStore};

    async fn coordinator() -> (WithdrawalCoordinator, Arc<RelationalStore>, Arc<MockExchange>) {
        let db = DatabasePool::connect_in_memory().await.unwrap();
        let store = Arc::new(RelationalStore::new(db));
        seed_user_with_funds(store.as_ref(), "5").await;

        let exchange = Arc::new(MockExchange::new());
        let coordinator = WithdrawalCoordinator::new(
            store.clone() as Arc<dyn LedgerStore>,
            exchange.clone() as Arc<dyn PrimeApi>,
            "port-1",
        );
        (coordinator, store, exchange)
    }

    fn request(amount: &str) -> WithdrawalRequest {
        WithdrawalRequest {
            email: "alice@example.com".to_string(),
            asset: "USDC-base-mainnet".to_string(),
            amount: amount.parse().unwrap(),
            destination: "0xdest".to_string(),
        }
    }

    #[tokio::test]
    async fn successful_withdrawal_reserves_and_submits() {
        let (coordinator, store, exchange) = coordinator().await;

        let outcome = coordinator.run(&request("2")).await.unwrap();
        let WithdrawalOutcome::Submitted {
            activity_id,
            idempotency_key,
            remaining_balance,
            ..
        } = outcome
        else {
            panic!("expected submission");
        };

        assert_eq!(activity_id, "act-1");
        assert_eq!(remaining_balance, "3".parse::<Decimal>().unwrap());
        // the key carries the user's id prefix for later correlation
        assert!(idempotency_key.starts_with("a1b2c3d4-"));

        // reserved locally
        assert_eq!(
            store.user_balance(ALICE_ID, "USDC").await.unwrap(),
            "3".parse::<Decimal>().unwrap()
        );
        assert!(store.has_pending_withdrawal(&idempotency_key).await.unwrap());

        // submitted with the same key
        let submitted = exchange.created_withdrawals.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].idempotency_key, idempotency_key);
        assert_eq!(submitted[0].amount, "2");
    }

    #[tokio::test]
    async fn exact_balance_withdrawal_succeeds() {
        let (coordinator, store, _exchange) = coordinator().await;

        coordinator.run(&request("5")).await.unwrap();
        assert!(store
            .user_balance(ALICE_ID, "USDC")
            .await
            .unwrap()
            .is_zero());
    }

    #[tokio::test]
    async fn over_balance_withdrawal_fails_before_any_write() {
        let (coordinator, store, exchange) = coordinator().await;

        let err = coordinator.run(&request("5.01")).await.unwrap_err();
        let CoordinatorError::InsufficientBalance { shortfall, .. } = err else {
            panic!("expected insufficient balance");
        };
        assert_eq!(shortfall, "0.01".parse::<Decimal>().unwrap());

        assert_eq!(
            store.user_balance(ALICE_ID, "USDC").await.unwrap(),
            "5".parse::<Decimal>().unwrap()
        );
        assert!(exchange.created_withdrawals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_failure_rolls_back_reservation() {
        let (coordinator, store, exchange) = coordinator().await;
        exchange.fail_withdrawals();

        let err = coordinator.run(&request("1")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::SubmissionFailed(_)));

        // balance restored; the audit trail shows reserve + reversal
        assert_eq!(
            store.user_balance(ALICE_ID, "USDC").await.unwrap(),
            "5".parse::<Decimal>().unwrap()
        );
        let history = store
            .transaction_history(ALICE_ID, "USDC", 10, 0)
            .await
            .unwrap();
        let withdrawals = history
            .iter()
            .filter(|r| r.transaction_type == "withdrawal")
            .count();
        let reversals = history
            .iter()
            .filter(|r| r.external_transaction_id.ends_with("-reversal"))
            .count();
        assert_eq!(withdrawals, 1);
        assert_eq!(reversals, 1);
    }

    #[tokio::test]
    async fn reused_idempotency_key_returns_existing_record() {
        let (coordinator, store, exchange) = coordinator().await;

        let key = "a1b2c3d4-1111-2222-3333-444455556666";
        coordinator.run_with_key(&request("2"), key).await.unwrap();

        let outcome = coordinator.run_with_key(&request("2"), key).await.unwrap();
        assert!(matches!(outcome, WithdrawalOutcome::AlreadyProcessed { .. }));

        // no second reservation, no second submission
        assert_eq!(
            store.user_balance(ALICE_ID, "USDC").await.unwrap(),
            "3".parse::<Decimal>().unwrap()
        );
        assert_eq!(exchange.created_withdrawals.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_asset_is_rejected() {
        let (coordinator, _store, _exchange) = coordinator().await;

        let mut req = request("1");
        req.asset = "USDC".to_string();
        assert!(matches!(
            coordinator.run(&req).await.unwrap_err(),
            CoordinatorError::InvalidAsset(_)
        ));
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let (coordinator, _store, _exchange) = coordinator().await;

        let mut req = request("1");
        req.email = "nobody@example.com".to_string();
        assert!(matches!(
            coordinator.run(&req).await.unwrap_err(),
            CoordinatorError::UnknownUser(_)
        ));
    }
}
