use subledger_core::Config;
use subledger_ledger::LedgerStore;

use crate::output::{print_footer, print_header, DEFAULT_WIDTH};
use crate::services;

pub async fn run(config: &Config) -> anyhow::Result<()> {
    let store = services::init_store_only(config).await?;
    let users = store.users().await?;

    print_header("USER BALANCES", DEFAULT_WIDTH);

    let mut rows = 0usize;
    for user in &users {
        let balances = store.all_user_balances(&user.id).await?;
        println!("\n{} ({})", user.name, user.email);
        if balances.is_empty() {
            println!("  (no balances)");
            continue;
        }
        for balance in balances {
            println!("  {:8} {}", balance.asset, balance.balance);
            rows += 1;
        }
    }

    print_footer(
        &format!("{rows} balance(s) across {} user(s)", users.len()),
        DEFAULT_WIDTH,
    );
    Ok(())
}
