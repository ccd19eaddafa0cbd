use subledger_core::types::User;
use subledger_core::Config;
use subledger_ledger::LedgerStore;

use crate::output::{print_footer, print_header, DEFAULT_WIDTH};
use crate::services;

pub async fn run(config: &Config, email: Option<String>) -> anyhow::Result<()> {
    let store = services::init_store_only(config).await?;

    let users: Vec<User> = match email {
        Some(email) => vec![store.user_by_email(&email).await?],
        None => store.users().await?,
    };

    print_header("DEPOSIT ADDRESSES", DEFAULT_WIDTH);

    let mut total = 0usize;
    for user in &users {
        let addresses = store.all_user_addresses(&user.id).await?;
        println!("\n{} ({})", user.name, user.email);
        if addresses.is_empty() {
            println!("  (no addresses)");
            continue;
        }
        for addr in addresses {
            let network = if addr.network.is_empty() {
                "-".to_string()
            } else {
                addr.network.clone()
            };
            println!("  {:8} {:20} {}", addr.asset, network, addr.address);
            total += 1;
        }
    }

    print_footer(
        &format!("{total} address(es) across {} user(s)", users.len()),
        DEFAULT_WIDTH,
    );
    Ok(())
}
