use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use subledger_core::assets::canonical_symbol;
use subledger_core::types::WalletInfo;
use subledger_ledger::{DepositMeta, LedgerError, PlatformTransactionParams};
use subledger_prime::PrimeTransaction;

use crate::reconciler::Reconciler;
use crate::{parse_amount, status, Result};

impl Reconciler {
    /// Deposit dispatch: D1 on "import pending", D2 (with D3 fallback) on
    /// "imported", platform catch-all for anything else.
    pub(crate) async fn process_deposit_event(
        &self,
        tx: &PrimeTransaction,
        wallet: &WalletInfo,
    ) -> Result<()> {
        match tx.status.as_str() {
            status::IMPORT_PENDING => self.deposit_pending(tx, wallet).await,
            status::IMPORTED => self.deposit_imported(tx, wallet).await,
            other => {
                debug!(
                    transaction_id = %tx.id,
                    status = other,
                    "Deposit in unclassified status, recording as platform transaction"
                );
                self.store()
                    .record_platform_transaction(PlatformTransactionParams {
                        transaction_id: tx.id.clone(),
                        transaction_type: tx.r#type.clone(),
                        status: tx.status.clone(),
                        symbol: tx.symbol.clone(),
                        amount: tx.amount.clone(),
                        network: tx.network.clone(),
                        wallet_id: wallet.id.clone(),
                        transaction_time: tx.effective_time(),
                        metadata: Vec::new(),
                    })
                    .await?;
                self.cache().mark(&tx.id);
                Ok(())
            }
        }
    }

    /// D1: park the funds in the pending-deposits account. The Exchange
    /// transaction id is NOT marked processed here: the confirmed phase
    /// arrives under the same id, and marking now would starve it for a
    /// whole lookback window. Replays are absorbed by the backend's
    /// `{tx}-pending` reference.
    async fn deposit_pending(&self, tx: &PrimeTransaction, wallet: &WalletInfo) -> Result<()> {
        let amount = parse_amount(&tx.amount)?;
        if amount <= Decimal::ZERO {
            debug!(transaction_id = %tx.id, amount = %tx.amount, "Skipping zero/negative pending deposit");
            return Ok(());
        }

        let Some(lookup_address) = deposit_lookup_address(tx) else {
            debug!(transaction_id = %tx.id, "No address or account identifier in transfer_to");
            return Ok(());
        };

        let symbol = canonical_symbol(&tx.symbol);

        info!(
            transaction_id = %tx.id,
            lookup_address = %lookup_address,
            symbol = symbol,
            amount = %amount,
            "Processing pending deposit"
        );

        match self
            .store()
            .process_deposit_pending(
                symbol,
                &wallet.id,
                amount,
                &tx.id,
                lookup_address,
                tx.effective_time(),
            )
            .await
        {
            Ok(()) | Err(LedgerError::Duplicate(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// D2 with D3 fallback: settle the pending phase when it exists,
    /// otherwise credit directly from the wallet.
    async fn deposit_imported(&self, tx: &PrimeTransaction, wallet: &WalletInfo) -> Result<()> {
        let amount = parse_amount(&tx.amount)?;
        if amount <= Decimal::ZERO {
            debug!(transaction_id = %tx.id, amount = %tx.amount, "Skipping zero/negative deposit");
            return Ok(());
        }

        let Some(lookup_address) = deposit_lookup_address(tx) else {
            debug!(
                transaction_id = %tx.id,
                transfer_to_type = %tx.transfer_to.r#type,
                "No address or account identifier in transfer_to"
            );
            return Ok(());
        };

        info!(
            transaction_id = %tx.id,
            lookup_address = %lookup_address,
            reported_symbol = %tx.symbol,
            network = %tx.network,
            amount = %amount,
            "Processing imported deposit"
        );

        match self
            .store()
            .confirm_deposit(lookup_address, &tx.symbol, amount, &tx.id, tx.effective_time())
            .await
        {
            Ok(()) => {
                self.cache().mark(&tx.id);
                info!(transaction_id = %tx.id, "Deposit confirmed from pending");
                Ok(())
            }
            Err(LedgerError::PendingNotFound(_)) => {
                // no pending phase was observed (restart, race, or
                // single-phase backend): credit directly
                self.deposit_received(tx, wallet, lookup_address, amount).await
            }
            Err(LedgerError::Duplicate(_)) => {
                info!(transaction_id = %tx.id, "Deposit already processed, marking as handled");
                self.cache().mark(&tx.id);
                Ok(())
            }
            Err(LedgerError::UserNotFound(_)) => {
                warn!(
                    transaction_id = %tx.id,
                    address = %lookup_address,
                    "Deposit to unrecognized address - marking as processed to avoid repeated errors"
                );
                self.cache().mark(&tx.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// D3: direct wallet -> user credit, with full Exchange metadata.
    async fn deposit_received(
        &self,
        tx: &PrimeTransaction,
        wallet: &WalletInfo,
        lookup_address: &str,
        amount: Decimal,
    ) -> Result<()> {
        let meta = deposit_meta(tx, wallet);

        match self
            .store()
            .process_deposit(lookup_address, &tx.symbol, amount, &tx.id, Some(&meta))
            .await
        {
            Ok(()) => {
                self.cache().mark(&tx.id);
                info!(
                    transaction_id = %tx.id,
                    amount = %amount,
                    "Deposit processed - balance updated"
                );
                Ok(())
            }
            Err(LedgerError::Duplicate(_)) => {
                info!(transaction_id = %tx.id, "Duplicate deposit detected - already processed");
                self.cache().mark(&tx.id);
                Ok(())
            }
            Err(LedgerError::UserNotFound(_)) => {
                warn!(
                    transaction_id = %tx.id,
                    address = %lookup_address,
                    amount = %amount,
                    "Deposit to unrecognized address - marking as processed to avoid repeated errors"
                );
                self.cache().mark(&tx.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The account identifier is the more stable lookup key when the Exchange
/// reports one; the on-chain address otherwise.
fn deposit_lookup_address(tx: &PrimeTransaction) -> Option<&str> {
    if !tx.transfer_to.account_identifier.is_empty() {
        return Some(&tx.transfer_to.account_identifier);
    }
    if !tx.transfer_to.address.is_empty() {
        return Some(&tx.transfer_to.address);
    }
    None
}

fn deposit_meta(tx: &PrimeTransaction, wallet: &WalletInfo) -> DepositMeta {
    DepositMeta {
        prime_tx_id: tx.transaction_id.clone(),
        source_address: tx.transfer_from.address.clone(),
        source_type: tx.transfer_from.r#type.clone(),
        network_fees: tx.network_fees.clone(),
        fees: tx.fees.clone(),
        blockchain_ids: tx.blockchain_ids.clone(),
        network: tx.network.clone(),
        prime_api_symbol: tx.symbol.clone(),
        wallet_id: wallet.id.clone(),
        created_at: tx.created_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        completed_at: tx.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        transaction_time: tx.effective_time(),
    }
}
