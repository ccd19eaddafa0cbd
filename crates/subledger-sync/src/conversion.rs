use tracing::{debug, info, warn};

use subledger_core::types::WalletInfo;
use subledger_ledger::ConversionParams;
use subledger_prime::PrimeTransaction;

use crate::reconciler::Reconciler;
use crate::{status, Result};

impl Reconciler {
    /// C1: a cross-asset conversion (e.g. USD -> USDC). Only completed
    /// conversions are recorded. The source and destination wallets are
    /// resolved by asset symbol; the polling wallet is not assumed to be
    /// either leg.
    pub(crate) async fn process_conversion_event(
        &self,
        tx: &PrimeTransaction,
        wallet: &WalletInfo,
    ) -> Result<()> {
        if tx.status != status::DONE {
            debug!(
                transaction_id = %tx.id,
                status = %tx.status,
                "Skipping non-completed conversion"
            );
            return Ok(());
        }

        let source_symbol = tx.symbol.clone();
        let dest_symbol = if tx.destination_symbol.is_empty() {
            source_symbol.clone()
        } else {
            tx.destination_symbol.clone()
        };

        let source_wallet_id = self.resolve_conversion_wallet(&source_symbol, wallet).await;
        let dest_wallet_id = self.resolve_conversion_wallet(&dest_symbol, wallet).await;

        info!(
            transaction_id = %tx.id,
            source = %source_symbol,
            destination = %dest_symbol,
            source_wallet = %source_wallet_id,
            dest_wallet = %dest_wallet_id,
            amount = %tx.amount,
            "Processing conversion"
        );

        self.store()
            .record_conversion(ConversionParams {
                transaction_id: tx.id.clone(),
                status: tx.status.clone(),
                source_symbol,
                source_amount: tx.amount.clone(),
                destination_symbol: dest_symbol,
                destination_amount: tx.amount.clone(),
                source_wallet_id,
                dest_wallet_id,
                network: tx.network.clone(),
                fees: tx.fees.clone(),
                fee_symbol: tx.fee_symbol.clone(),
                transaction_time: tx.effective_time(),
            })
            .await?;

        self.cache().mark(&tx.id);
        Ok(())
    }

    /// The polling wallet serves the leg that shares its asset; other legs
    /// are resolved through the Exchange's wallet listing, defaulting back
    /// to the polling wallet when the lookup fails.
    async fn resolve_conversion_wallet(&self, symbol: &str, polling_wallet: &WalletInfo) -> String {
        if symbol == polling_wallet.asset_symbol {
            return polling_wallet.id.clone();
        }

        match self
            .exchange()
            .list_wallets(self.portfolio_id(), "TRADING", &[symbol.to_string()])
            .await
        {
            Ok(wallets) if !wallets.is_empty() => wallets[0].id.clone(),
            _ => {
                warn!(symbol = symbol, "Could not resolve wallet for conversion leg");
                polling_wallet.id.clone()
            }
        }
    }
}
