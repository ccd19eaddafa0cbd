use anyhow::{bail, Context};
use tracing::info;
use uuid::Uuid;

use subledger_core::Config;
use subledger_ledger::{LedgerStore, StoreAddressParams};
use subledger_prime::PrimeApi;

use crate::output::{print_footer, print_header, DEFAULT_WIDTH};
use crate::services::{self, Services};

pub async fn run(
    config: &Config,
    name: &str,
    email: &str,
    deposit_addresses: Option<String>,
    withdrawal_addresses: Option<String>,
) -> anyhow::Result<()> {
    validate_name(name)?;
    validate_email(email)?;

    let services = services::init(config).await?;

    let user = services
        .store
        .create_user(&Uuid::new_v4().to_string(), name, email)
        .await
        .with_context(|| format!("failed to create user {email}"))?;

    print_header("USER CREATED", DEFAULT_WIDTH);
    println!("Name:  {}", user.name);
    println!("Email: {}", user.email);
    println!("Id:    {}", user.id);

    let mut assigned = 0usize;
    for address in split_addresses(deposit_addresses) {
        assign_deposit_address(&services, &user.id, &address).await?;
        assigned += 1;
    }

    let mut registered = 0usize;
    for address in split_addresses(withdrawal_addresses) {
        register_withdrawal_address(&services, &user.id, &address).await?;
        registered += 1;
    }

    print_footer(
        &format!(
            "User created ({assigned} deposit addresses assigned, {registered} withdrawal addresses registered)"
        ),
        DEFAULT_WIDTH,
    );
    Ok(())
}

fn split_addresses(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn validate_name(name: &str) -> anyhow::Result<()> {
    if name.trim().len() < 2 {
        bail!("name must be at least 2 characters");
    }
    Ok(())
}

fn validate_email(email: &str) -> anyhow::Result<()> {
    let Some((local, domain)) = email.split_once('@') else {
        bail!("invalid email format: {email}");
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') || domain.ends_with('.') {
        bail!("invalid email format: {email}");
    }
    Ok(())
}

/// Networks searched when locating an existing deposit address on the
/// Exchange.
const KNOWN_NETWORKS: &[&str] = &[
    "ethereum-mainnet",
    "base-mainnet",
    "bitcoin-mainnet",
    "solana-mainnet",
    "polygon-mainnet",
    "arbitrum-mainnet",
    "avalanche-mainnet",
];

/// Verifies an existing custodial deposit address on the Exchange and
/// assigns it to the user.
async fn assign_deposit_address(
    services: &Services,
    user_id: &str,
    address: &str,
) -> anyhow::Result<()> {
    println!("\nVerifying deposit address: {address}");

    if let Some((owner, _)) = services.store.find_user_by_address(address).await? {
        if owner.id == user_id {
            println!("  Address already assigned to this user");
            return Ok(());
        }
        bail!(
            "deposit address {address} already belongs to {} ({})",
            owner.name,
            owner.email
        );
    }

    println!("  Searching Exchange wallets for this address...");
    let wallets = services
        .exchange
        .list_wallets(&services.default_portfolio.id, "TRADING", &[])
        .await?;

    for wallet in &wallets {
        for network in KNOWN_NETWORKS {
            let Ok(addresses) = services
                .exchange
                .list_wallet_addresses(&services.default_portfolio.id, &wallet.id, network)
                .await
            else {
                continue;
            };

            if let Some(found) = addresses
                .iter()
                .find(|a| a.address.eq_ignore_ascii_case(address))
            {
                println!(
                    "  Found on Exchange: {} wallet on {network}",
                    wallet.symbol
                );
                services
                    .store
                    .store_address(StoreAddressParams {
                        user_id: user_id.to_string(),
                        asset: wallet.symbol.clone(),
                        network: network.to_string(),
                        address: found.address.clone(),
                        wallet_id: wallet.id.clone(),
                        account_identifier: found.id.clone(),
                    })
                    .await?;

                info!(
                    user_id = user_id,
                    address = address,
                    asset = %wallet.symbol,
                    network = network,
                    "Deposit address assigned"
                );
                println!("  Address assigned");
                return Ok(());
            }
        }
    }

    bail!("deposit address {address} not found on any Exchange trading wallet");
}

/// Registers an external withdrawal destination so outgoing transactions to
/// it can be attributed back to the user. The Exchange address book resolves
/// the asset symbol when it knows the address.
async fn register_withdrawal_address(
    services: &Services,
    user_id: &str,
    address: &str,
) -> anyhow::Result<()> {
    if let Some((owner, _)) = services.store.find_user_by_address(address).await? {
        if owner.id == user_id {
            println!("  {address} (already registered)");
            return Ok(());
        }
        bail!(
            "withdrawal address {address} already belongs to {} ({})",
            owner.name,
            owner.email
        );
    }

    let asset = match services
        .exchange
        .lookup_address_book(&services.default_portfolio.id, address)
        .await
    {
        Ok(Some(entry)) if !entry.currency_symbol.is_empty() => {
            println!(
                "  Found in address book: {} ({}, state: {})",
                entry.name, entry.currency_symbol, entry.state
            );
            entry.currency_symbol
        }
        _ => {
            println!("  Not found in Exchange address book, registering as generic withdrawal address");
            "WITHDRAWAL".to_string()
        }
    };

    services
        .store
        .store_address(StoreAddressParams {
            user_id: user_id.to_string(),
            asset: asset.clone(),
            network: "external".to_string(),
            address: address.to_string(),
            wallet_id: String::new(),
            account_identifier: String::new(),
        })
        .await?;

    info!(
        user_id = user_id,
        address = address,
        asset = %asset,
        "Withdrawal address registered"
    );
    println!("  {address} registered ({asset})");
    Ok(())
}
