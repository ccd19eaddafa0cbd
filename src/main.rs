use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use subledger_core::Config;

mod commands;
mod output;
mod services;

#[derive(Parser, Debug)]
#[command(name = "subledger")]
#[command(about = "Custodial deposit/withdrawal reconciliation between a prime brokerage and a per-user subledger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a user, optionally assigning pre-existing deposit and withdrawal addresses
    AddUser {
        /// User's full name
        #[arg(long)]
        name: String,

        /// User's email address (unique)
        #[arg(long)]
        email: String,

        /// Comma-separated existing deposit addresses to assign
        #[arg(long = "deposit-addresses")]
        deposit_addresses: Option<String>,

        /// Comma-separated external withdrawal addresses for matching outgoing transactions
        #[arg(long = "withdrawal-addresses")]
        withdrawal_addresses: Option<String>,
    },

    /// Provision/discover deposit addresses for all configured assets
    SetupAddresses {
        /// Restrict to a single user
        #[arg(long)]
        email: Option<String>,
    },

    /// Initiate a withdrawal
    Withdraw {
        #[arg(long)]
        email: String,

        /// Asset as SYMBOL-network (e.g. USDC-base-mainnet)
        #[arg(long)]
        asset: String,

        #[arg(long)]
        amount: String,

        /// Destination address
        #[arg(long)]
        destination: String,
    },

    /// List deposit addresses
    Addresses {
        /// Filter by user email
        #[arg(long)]
        email: Option<String>,
    },

    /// List all user balances
    Balances,

    /// Run the polling reconciler until interrupted
    Listen {
        /// Optional assets file limiting monitored wallets
        #[arg(long)]
        assets: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Command::AddUser {
            name,
            email,
            deposit_addresses,
            withdrawal_addresses,
        } => {
            commands::add_user::run(&config, &name, &email, deposit_addresses, withdrawal_addresses)
                .await
        }
        Command::SetupAddresses { email } => commands::setup::run(&config, email).await,
        Command::Withdraw {
            email,
            asset,
            amount,
            destination,
        } => commands::withdraw::run(&config, &email, &asset, &amount, &destination).await,
        Command::Addresses { email } => commands::addresses::run(&config, email).await,
        Command::Balances => commands::balances::run(&config).await,
        Command::Listen { assets } => commands::listen::run(&config, assets).await,
    }
}
