use anyhow::Context;
use rust_decimal::Decimal;
use tracing::error;

use subledger_core::Config;
use subledger_sync::{WithdrawalCoordinator, WithdrawalOutcome, WithdrawalRequest};

use crate::output::{print_footer, print_header, DEFAULT_WIDTH};
use crate::services;

pub async fn run(
    config: &Config,
    email: &str,
    asset: &str,
    amount: &str,
    destination: &str,
) -> anyhow::Result<()> {
    let amount: Decimal = amount
        .parse()
        .with_context(|| format!("invalid amount format: {amount}"))?;

    let services = services::init(config).await?;
    let coordinator = WithdrawalCoordinator::new(
        services.store.clone(),
        services.exchange.clone(),
        &services.default_portfolio.id,
    );

    let request = WithdrawalRequest {
        email: email.to_string(),
        asset: asset.to_string(),
        amount,
        destination: destination.to_string(),
    };

    let symbol = asset.split('-').next().unwrap_or(asset);
    print_header("WITHDRAWAL REQUEST", DEFAULT_WIDTH);
    println!("User:              {email}");
    println!("Asset:             {asset}");
    println!("Withdrawal Amount: {amount} {symbol}");
    println!("Destination:       {destination}");

    match coordinator.run(&request).await {
        Ok(WithdrawalOutcome::Submitted {
            activity_id,
            idempotency_key,
            remaining_balance,
            ..
        }) => {
            println!("\nWithdrawal created");
            println!("  Activity ID:       {activity_id}");
            println!("  Idempotency key:   {idempotency_key}");
            println!("  Remaining balance: {remaining_balance} {symbol}");
            print_footer("Withdrawal submitted", DEFAULT_WIDTH);
            Ok(())
        }
        Ok(WithdrawalOutcome::AlreadyProcessed {
            transaction_id,
            amount,
            processed_at,
        }) => {
            println!("\nWithdrawal already processed (idempotent)");
            println!("  Original transaction ID: {transaction_id}");
            println!("  Amount:                  {amount} {symbol}");
            println!("  Processed at:            {}", processed_at.format("%Y-%m-%d %H:%M:%S"));
            print_footer("No action taken", DEFAULT_WIDTH);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Withdrawal failed");
            print_footer(&format!("WITHDRAWAL FAILED: {e}"), DEFAULT_WIDTH);
            Err(e.into())
        }
    }
}
