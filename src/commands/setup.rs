use anyhow::bail;
use tracing::{error, info, warn};

use subledger_core::assets::{load_asset_config, AssetConfig};
use subledger_core::types::User;
use subledger_core::Config;
use subledger_ledger::{LedgerStore, StoreAddressParams};
use subledger_prime::PrimeApi;

use crate::output::{print_footer, print_header, DEFAULT_WIDTH};
use crate::services::{self, Services};

/// Provisions (or discovers) one deposit address per configured
/// (asset, network) for every user, keeping the local address index in sync
/// with the Exchange.
pub async fn run(config: &Config, email: Option<String>) -> anyhow::Result<()> {
    let services = services::init(config).await?;
    let assets = load_asset_config(&config.reconciler.assets_file)?;

    let users: Vec<User> = match email {
        Some(email) => vec![services.store.user_by_email(&email).await?],
        None => services.store.users().await?,
    };
    if users.is_empty() {
        bail!("no users found - create one with `subledger add-user` first");
    }

    print_header("ADDRESS SETUP", DEFAULT_WIDTH);
    println!(
        "Provisioning {} assets for {} user(s)",
        assets.len(),
        users.len()
    );

    let mut succeeded = 0usize;
    let mut failed: Vec<String> = Vec::new();

    for user in &users {
        println!("\n{} ({})", user.name, user.email);
        for asset in &assets {
            match provision_asset(&services, user, asset).await {
                Ok(summary) => {
                    println!("  + {}-{}: {summary}", asset.symbol, asset.network);
                    succeeded += 1;
                }
                Err(e) => {
                    error!(
                        user_id = %user.id,
                        asset = %asset.symbol,
                        network = %asset.network,
                        error = %e,
                        "Failed to provision address"
                    );
                    println!("  x {}-{}: {e}", asset.symbol, asset.network);
                    failed.push(format!("{}-{}", asset.symbol, asset.network));
                }
            }
        }
    }

    print_footer(
        &format!("Setup complete: {succeeded} provisioned, {} failed", failed.len()),
        DEFAULT_WIDTH,
    );

    if !failed.is_empty() && succeeded == 0 {
        bail!("address setup failed for every asset: {}", failed.join(", "));
    }
    Ok(())
}

async fn provision_asset(
    services: &Services,
    user: &User,
    asset: &AssetConfig,
) -> anyhow::Result<String> {
    let existing = services
        .store
        .addresses(&user.id, &asset.symbol, &asset.network)
        .await?;

    let wallet_id = get_or_create_wallet(services, &asset.symbol).await?;

    // Sync every address the Exchange already has for this wallet, so the
    // local index carries current wallet ids and account identifiers.
    match services
        .exchange
        .list_wallet_addresses(&services.default_portfolio.id, &wallet_id, &asset.network)
        .await
    {
        Ok(remote) if !remote.is_empty() => {
            let mut stored = 0usize;
            for addr in &remote {
                let already_known = services
                    .store
                    .find_user_by_address(&addr.address)
                    .await?
                    .is_some();
                if already_known {
                    continue;
                }
                match services
                    .store
                    .store_address(StoreAddressParams {
                        user_id: user.id.clone(),
                        asset: asset.symbol.clone(),
                        network: asset.network.clone(),
                        address: addr.address.clone(),
                        wallet_id: wallet_id.clone(),
                        account_identifier: addr.id.clone(),
                    })
                    .await
                {
                    Ok(_) => stored += 1,
                    Err(e) => {
                        warn!(address = %addr.address, error = %e, "Failed to store synced address")
                    }
                }
            }
            if stored > 0 || !existing.is_empty() {
                return Ok(format!("{} address(es) synced", remote.len()));
            }
        }
        Ok(_) => {}
        Err(e) => {
            warn!(
                wallet_id = %wallet_id,
                network = %asset.network,
                error = %e,
                "Could not list Exchange addresses"
            );
        }
    }

    if !existing.is_empty() {
        return Ok("address already exists".to_string());
    }

    // Nothing on either side: create a fresh deposit address.
    let created = services
        .exchange
        .create_deposit_address(
            &services.default_portfolio.id,
            &wallet_id,
            &asset.symbol,
            &asset.network,
        )
        .await?;

    services
        .store
        .store_address(StoreAddressParams {
            user_id: user.id.clone(),
            asset: asset.symbol.clone(),
            network: asset.network.clone(),
            address: created.address.clone(),
            wallet_id,
            account_identifier: created.id,
        })
        .await?;

    Ok(created.address)
}

async fn get_or_create_wallet(services: &Services, symbol: &str) -> anyhow::Result<String> {
    let wallets = services
        .exchange
        .list_wallets(
            &services.default_portfolio.id,
            "TRADING",
            &[symbol.to_string()],
        )
        .await?;

    if let Some(wallet) = wallets.first() {
        info!(asset = symbol, wallet_id = %wallet.id, "Using existing wallet");
        return Ok(wallet.id.clone());
    }

    let name = format!("{symbol} Trading Wallet");
    info!(asset = symbol, wallet_name = %name, "Creating new wallet");
    let wallet = services
        .exchange
        .create_wallet(&services.default_portfolio.id, &name, symbol, "TRADING")
        .await?;
    Ok(wallet.id)
}
