use tracing::{debug, info, warn};

use subledger_core::assets::canonical_symbol;
use subledger_core::idempotency::match_user_by_prefix;
use subledger_core::types::WalletInfo;
use subledger_ledger::{
    ConfirmWithdrawalDirectParams, FailedWithdrawalPlatformParams, LedgerError,
    WalletWithdrawalParams,
};
use subledger_prime::PrimeTransaction;

use crate::reconciler::Reconciler;
use crate::{parse_amount, status, Result};

impl Reconciler {
    /// Withdrawal dispatch by status: terminal failure -> W5/W6, "done" ->
    /// W3/W4, anything else non-terminal -> W2 (or wait on a matched
    /// reservation).
    pub(crate) async fn process_withdrawal_event(
        &self,
        tx: &PrimeTransaction,
        wallet: &WalletInfo,
    ) -> Result<()> {
        if status::is_terminal_failure(&tx.status) {
            return self.withdrawal_failed(tx, wallet).await;
        }
        if tx.status != status::DONE {
            return self.withdrawal_pending(tx, wallet).await;
        }
        self.withdrawal_done(tx, wallet).await
    }

    /// W3/W4: the Exchange reports the withdrawal settled on-chain.
    async fn withdrawal_done(&self, tx: &PrimeTransaction, wallet: &WalletInfo) -> Result<()> {
        let amount = parse_amount(&tx.amount)?.abs();
        if amount.is_zero() {
            self.cache().mark(&tx.id);
            return Ok(());
        }

        let symbol = canonical_symbol(&tx.symbol);
        let destination = withdrawal_destination(tx);
        let user_id = match self.match_withdrawal_user(destination, &tx.idempotency_key).await? {
            Some(user_id) => user_id,
            None => self.platform_user_id(),
        };

        info!(
            transaction_id = %tx.id,
            user_id = %user_id,
            idempotency_key = %tx.idempotency_key,
            symbol = symbol,
            amount = %amount,
            destination = destination,
            "Processing completed withdrawal"
        );

        // A reservation may exist under the idempotency key (user-initiated)
        // or under the Exchange transaction id (W2).
        let mut withdrawal_ref = tx.idempotency_key.as_str();
        let mut has_pending = !withdrawal_ref.is_empty()
            && self.store().has_pending_withdrawal(withdrawal_ref).await?;
        if !has_pending {
            withdrawal_ref = tx.id.as_str();
            has_pending = self.store().has_pending_withdrawal(withdrawal_ref).await?;
        }

        if has_pending {
            info!(transaction_id = %tx.id, "Found pending withdrawal, confirming from pending");
            match self
                .store()
                .confirm_withdrawal(&user_id, symbol, amount, withdrawal_ref, &tx.id)
                .await
            {
                Ok(()) | Err(LedgerError::Duplicate(_)) => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            info!(
                transaction_id = %tx.id,
                user_id = %user_id,
                "No pending withdrawal found, debiting user directly"
            );
            self.store()
                .confirm_withdrawal_direct(ConfirmWithdrawalDirectParams {
                    user_id: user_id.clone(),
                    asset: symbol.to_string(),
                    amount,
                    wallet_id: wallet.id.clone(),
                    external_tx_id: tx.id.clone(),
                    withdrawal_ref: tx.idempotency_key.clone(),
                    destination_address: destination.to_string(),
                    network: tx.network.clone(),
                    prime_tx_id: tx.transaction_id.clone(),
                    idempotency_key: tx.idempotency_key.clone(),
                    transaction_time: tx.effective_time(),
                })
                .await?;
        }

        self.cache().mark(&tx.id);
        info!(
            transaction_id = %tx.id,
            user_id = %user_id,
            asset = symbol,
            amount = %amount,
            "Withdrawal confirmed"
        );
        Ok(())
    }

    /// W2: the Exchange has the withdrawal but it is not settled yet. A
    /// matched reservation means this is our own withdrawal still in
    /// flight: skip (without marking) and wait for the terminal state.
    async fn withdrawal_pending(&self, tx: &PrimeTransaction, wallet: &WalletInfo) -> Result<()> {
        let amount = parse_amount(&tx.amount)?.abs();
        if amount.is_zero() {
            self.cache().mark(&tx.id);
            return Ok(());
        }

        let reservation_ref = if tx.idempotency_key.is_empty() {
            tx.id.as_str()
        } else {
            tx.idempotency_key.as_str()
        };
        if self.store().has_pending_withdrawal(reservation_ref).await?
            || self.store().has_pending_withdrawal(&tx.id).await?
        {
            debug!(
                transaction_id = %tx.id,
                status = %tx.status,
                "Withdrawal already reserved, waiting for terminal state"
            );
            return Ok(());
        }

        let symbol = canonical_symbol(&tx.symbol);
        let destination = withdrawal_destination(tx);

        // Debit the matched user when there is one; otherwise debit the
        // custodial wallet (with overdraft) into the pending account.
        if let Some(user_id) = self.match_withdrawal_user(destination, &tx.idempotency_key).await? {
            info!(
                transaction_id = %tx.id,
                user_id = %user_id,
                symbol = symbol,
                amount = %amount,
                "Pending withdrawal - debiting matched user"
            );

            match self
                .store()
                .process_withdrawal(&user_id, symbol, amount, &tx.id)
                .await
            {
                Ok(()) | Err(LedgerError::Duplicate(_)) => {
                    self.cache().mark(&tx.id);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        error = %e,
                        "User debit failed (insufficient funds?), falling through to wallet debit"
                    );
                }
            }
        }

        info!(
            transaction_id = %tx.id,
            symbol = symbol,
            amount = %amount,
            wallet_id = %wallet.id,
            "Pending withdrawal - from wallet to pending"
        );

        self.store()
            .process_withdrawal_from_wallet(WalletWithdrawalParams {
                transaction_id: tx.id.clone(),
                status: tx.status.clone(),
                symbol: symbol.to_string(),
                prime_api_symbol: tx.symbol.clone(),
                amount,
                wallet_id: wallet.id.clone(),
                destination_address: destination.to_string(),
                idempotency_key: tx.idempotency_key.clone(),
                transaction_time: tx.effective_time(),
            })
            .await?;
        self.cache().mark(&tx.id);
        Ok(())
    }

    /// W5/W6: terminal failure. A matched user gets their reservation
    /// restored (native revert where available, compensating credit
    /// otherwise); an unmatched failure is recorded as a platform-level
    /// round trip.
    async fn withdrawal_failed(&self, tx: &PrimeTransaction, wallet: &WalletInfo) -> Result<()> {
        let amount = parse_amount(&tx.amount)?.abs();
        if amount.is_zero() {
            debug!(transaction_id = %tx.id, "Skipping zero amount failed withdrawal");
            return Ok(());
        }

        let symbol = canonical_symbol(&tx.symbol);
        let destination = withdrawal_destination(tx);

        let Some(user_id) = self.match_withdrawal_user(destination, &tx.idempotency_key).await?
        else {
            warn!(
                transaction_id = %tx.id,
                idempotency_key = %tx.idempotency_key,
                status = %tx.status,
                "Could not match failed withdrawal to a user - recording platform round trip"
            );

            self.store()
                .record_failed_withdrawal_platform(FailedWithdrawalPlatformParams {
                    transaction_id: tx.id.clone(),
                    status: tx.status.clone(),
                    symbol: symbol.to_string(),
                    prime_api_symbol: tx.symbol.clone(),
                    amount,
                    wallet_id: wallet.id.clone(),
                    destination_address: destination.to_string(),
                    idempotency_key: tx.idempotency_key.clone(),
                    transaction_time: tx.effective_time(),
                })
                .await?;
            self.cache().mark(&tx.id);
            return Ok(());
        };

        // One reference identifies the logical withdrawal: the idempotency
        // key when the Exchange carries one, the transaction id otherwise.
        let reference = if tx.idempotency_key.is_empty() {
            tx.id.as_str()
        } else {
            tx.idempotency_key.as_str()
        };

        info!(
            transaction_id = %tx.id,
            user_id = %user_id,
            status = %tx.status,
            reported_symbol = %tx.symbol,
            canonical_symbol = symbol,
            amount = %amount,
            "Processing failed withdrawal - crediting back"
        );

        match self.store().revert_transaction(reference).await {
            Ok(()) => {
                info!(
                    transaction_id = %tx.id,
                    withdrawal_ref = reference,
                    "Failed withdrawal reverted natively"
                );
                self.cache().mark(&tx.id);
                Ok(())
            }
            Err(LedgerError::PendingNotFound(_)) => {
                // nothing was reserved, so there is nothing to undo
                info!(
                    transaction_id = %tx.id,
                    withdrawal_ref = reference,
                    "No pending withdrawal to revert - skipping"
                );
                self.cache().mark(&tx.id);
                Ok(())
            }
            Err(LedgerError::NotSupported(_)) => {
                debug!("Native revert unavailable, using compensating transaction");

                if !self.store().has_pending_withdrawal(reference).await? {
                    info!(
                        transaction_id = %tx.id,
                        withdrawal_ref = reference,
                        "No reservation found to compensate - skipping"
                    );
                    self.cache().mark(&tx.id);
                    return Ok(());
                }

                match self
                    .store()
                    .reverse_withdrawal(&user_id, symbol, amount, reference)
                    .await
                {
                    Ok(()) => {
                        self.cache().mark(&tx.id);
                        info!(
                            transaction_id = %tx.id,
                            user_id = %user_id,
                            asset = symbol,
                            amount = %amount,
                            "Failed withdrawal credited back"
                        );
                        Ok(())
                    }
                    Err(LedgerError::Duplicate(_)) => {
                        info!(transaction_id = %tx.id, "Reversal already processed - skipping");
                        self.cache().mark(&tx.id);
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// User matching for withdrawals: the registered destination address is
    /// authoritative when present; the idempotency-key prefix is the
    /// fallback.
    pub(crate) async fn match_withdrawal_user(
        &self,
        destination: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>> {
        if !destination.is_empty() {
            if let Some((user, _)) = self.store().find_user_by_address(destination).await? {
                return Ok(Some(user.id));
            }
        }

        if !idempotency_key.is_empty() {
            let users = self.store().users().await?;
            if let Some(user) = match_user_by_prefix(idempotency_key, &users) {
                debug!(
                    user_id = %user.id,
                    idempotency_key = idempotency_key,
                    "Matched withdrawal to user by id prefix"
                );
                return Ok(Some(user.id.clone()));
            }
        }

        Ok(None)
    }
}

fn withdrawal_destination(tx: &PrimeTransaction) -> &str {
    if !tx.transfer_to.address.is_empty() {
        return &tx.transfer_to.address;
    }
    if !tx.transfer_to.value.is_empty() {
        return &tx.transfer_to.value;
    }
    &tx.transfer_to.account_identifier
}
