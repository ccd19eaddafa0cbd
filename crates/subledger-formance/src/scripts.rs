//! Numscript templates, one per event kind. Metadata is set inside each
//! script so every ledger transaction is fully self-describing.
//!
//! Account scheme:
//!   platform:portfolio:{P}:wallets:{W}      omnibus wallet per asset
//!   platform:portfolio:{P}:deposits:pending
//!   platform:portfolio:{P}:withdrawals:pending
//!   platform:portfolio:{P}:conversions
//!   users:{U}                               one flat account per user
//!   users:platform-{P}                      catch-all

/// D1: wallet -> deposits pending.
pub const DEPOSIT_PENDING: &str = r#"vars {
  asset $asset
  number $amount
  account $portfolio_id
  account $wallet_id
  string $external_tx_id
  string $deposit_address
  string $asset_symbol
  string $prime_status
}

send [$asset $amount] (
  source = @platform:portfolio:$portfolio_id:wallets:$wallet_id allowing unbounded overdraft
  destination = @platform:portfolio:$portfolio_id:deposits:pending
)

set_tx_meta("event_type", "deposit_pending")
set_tx_meta("external_tx_id", $external_tx_id)
set_tx_meta("deposit_address", $deposit_address)
set_tx_meta("asset_symbol", $asset_symbol)
set_tx_meta("prime_status", $prime_status)
"#;

/// D2: deposits pending -> user.
pub const DEPOSIT_CONFIRMED: &str = r#"vars {
  asset $asset
  number $amount
  account $user_id
  account $portfolio_id
  string $external_tx_id
  string $deposit_address
  string $asset_symbol
  string $prime_status
}

send [$asset $amount] (
  source = @platform:portfolio:$portfolio_id:deposits:pending
  destination = @users:$user_id
)

set_tx_meta("event_type", "deposit_confirmed")
set_tx_meta("external_tx_id", $external_tx_id)
set_tx_meta("deposit_address", $deposit_address)
set_tx_meta("asset_symbol", $asset_symbol)
set_tx_meta("prime_status", $prime_status)
"#;

/// D3: wallet -> user directly, with full Exchange metadata.
pub const DEPOSIT_RECEIVED: &str = r#"vars {
  asset $asset
  number $amount
  account $user_id
  account $portfolio_id
  account $wallet_id
  string $external_tx_id
  string $deposit_address
  string $prime_status
  string $asset_symbol
  string $network
  string $user_name
  string $user_email
  string $prime_wallet_id
  string $account_identifier
  string $prime_api_symbol
  string $canonical_symbol
  string $amount_human
  string $prime_tx_id
  string $source_address
  string $source_type
  string $network_fees
  string $fees
  string $blockchain_ids
  string $prime_created_at
  string $prime_completed_at
}

send [$asset $amount] (
  source = @platform:portfolio:$portfolio_id:wallets:$wallet_id allowing unbounded overdraft
  destination = @users:$user_id
)

set_tx_meta("event_type", "deposit_received")
set_tx_meta("external_tx_id", $external_tx_id)
set_tx_meta("deposit_address", $deposit_address)
set_tx_meta("prime_status", $prime_status)
set_tx_meta("asset_symbol", $asset_symbol)
set_tx_meta("network", $network)
set_tx_meta("user_name", $user_name)
set_tx_meta("user_email", $user_email)
set_tx_meta("prime_wallet_id", $prime_wallet_id)
set_tx_meta("account_identifier", $account_identifier)
set_tx_meta("prime_api_symbol", $prime_api_symbol)
set_tx_meta("canonical_symbol", $canonical_symbol)
set_tx_meta("amount_human", $amount_human)
set_tx_meta("prime_tx_id", $prime_tx_id)
set_tx_meta("source_address", $source_address)
set_tx_meta("source_type", $source_type)
set_tx_meta("network_fees", $network_fees)
set_tx_meta("fees", $fees)
set_tx_meta("blockchain_ids", $blockchain_ids)
set_tx_meta("prime_created_at", $prime_created_at)
set_tx_meta("prime_completed_at", $prime_completed_at)
"#;

/// W1: user -> withdrawals pending (no overdraft: the ledger itself rejects
/// a reservation that would overdraw).
pub const WITHDRAWAL_INITIATED: &str = r#"vars {
  asset $asset
  number $amount
  account $user_id
  account $portfolio_id
  string $destination_address
  string $withdrawal_ref
  string $asset_symbol
}

send [$asset $amount] (
  source = @users:$user_id
  destination = @platform:portfolio:$portfolio_id:withdrawals:pending
)

set_tx_meta("event_type", "withdrawal_initiated")
set_tx_meta("destination_address", $destination_address)
set_tx_meta("withdrawal_ref", $withdrawal_ref)
set_tx_meta("asset_symbol", $asset_symbol)
"#;

/// W2: wallet -> withdrawals pending, for withdrawals initiated outside
/// this system. Stamps withdrawal_ref so pending checks find it.
pub const WITHDRAWAL_PENDING_FROM_WALLET: &str = r#"vars {
  asset $asset
  number $amount
  account $portfolio_id
  account $wallet_id
  string $external_tx_id
  string $prime_status
  string $asset_symbol
  string $destination_address
  string $withdrawal_ref
  string $idempotency_key
  string $prime_api_symbol
  string $amount_human
}

send [$asset $amount] (
  source = @platform:portfolio:$portfolio_id:wallets:$wallet_id allowing unbounded overdraft
  destination = @platform:portfolio:$portfolio_id:withdrawals:pending
)

set_tx_meta("event_type", "withdrawal_pending_from_wallet")
set_tx_meta("external_tx_id", $external_tx_id)
set_tx_meta("prime_status", $prime_status)
set_tx_meta("asset_symbol", $asset_symbol)
set_tx_meta("destination_address", $destination_address)
set_tx_meta("withdrawal_ref", $withdrawal_ref)
set_tx_meta("idempotency_key", $idempotency_key)
set_tx_meta("prime_api_symbol", $prime_api_symbol)
set_tx_meta("amount_human", $amount_human)
"#;

/// W3: withdrawals pending -> wallet (settles the reservation).
pub const WITHDRAWAL_CONFIRMED: &str = r#"vars {
  asset $asset
  number $amount
  account $portfolio_id
  account $wallet_id
  string $external_tx_id
  string $prime_status
  string $withdrawal_ref
  string $asset_symbol
  string $amount_human
  string $destination_address
  string $user_id
  string $network
  string $prime_tx_id
}

send [$asset $amount] (
  source = @platform:portfolio:$portfolio_id:withdrawals:pending
  destination = @platform:portfolio:$portfolio_id:wallets:$wallet_id
)

set_tx_meta("event_type", "withdrawal_confirmed")
set_tx_meta("external_tx_id", $external_tx_id)
set_tx_meta("prime_status", $prime_status)
set_tx_meta("withdrawal_ref", $withdrawal_ref)
set_tx_meta("asset_symbol", $asset_symbol)
set_tx_meta("amount_human", $amount_human)
set_tx_meta("destination_address", $destination_address)
set_tx_meta("user_id", $user_id)
set_tx_meta("network", $network)
set_tx_meta("prime_tx_id", $prime_tx_id)
"#;

/// W4: user -> wallet directly (with overdraft) when no reservation exists.
pub const WITHDRAWAL_CONFIRMED_DIRECT: &str = r#"vars {
  asset $asset
  number $amount
  account $user_id
  account $portfolio_id
  account $wallet_id
  string $external_tx_id
  string $prime_status
  string $withdrawal_ref
  string $asset_symbol
  string $amount_human
  string $destination_address
  string $network
  string $prime_tx_id
  string $idempotency_key
}

send [$asset $amount] (
  source = @users:$user_id allowing unbounded overdraft
  destination = @platform:portfolio:$portfolio_id:wallets:$wallet_id
)

set_tx_meta("event_type", "withdrawal_confirmed_direct")
set_tx_meta("external_tx_id", $external_tx_id)
set_tx_meta("prime_status", $prime_status)
set_tx_meta("withdrawal_ref", $withdrawal_ref)
set_tx_meta("asset_symbol", $asset_symbol)
set_tx_meta("amount_human", $amount_human)
set_tx_meta("destination_address", $destination_address)
set_tx_meta("user_id", $user_id)
set_tx_meta("network", $network)
set_tx_meta("prime_tx_id", $prime_tx_id)
set_tx_meta("idempotency_key", $idempotency_key)
"#;

/// W5: withdrawals pending -> user (restores a failed reservation).
pub const WITHDRAWAL_FAILED_REVERSAL: &str = r#"vars {
  asset $asset
  number $amount
  account $user_id
  account $portfolio_id
  string $external_tx_id
  string $prime_status
  string $withdrawal_ref
  string $reversal_ref
}

send [$asset $amount] (
  source = @platform:portfolio:$portfolio_id:withdrawals:pending allowing unbounded overdraft
  destination = @users:$user_id
)

set_tx_meta("event_type", "withdrawal_failed_reversal")
set_tx_meta("external_tx_id", $external_tx_id)
set_tx_meta("prime_status", $prime_status)
set_tx_meta("withdrawal_ref", $withdrawal_ref)
set_tx_meta("reversal_ref", $reversal_ref)
"#;

/// W6: one atomic transaction with two postings, wallet -> pending ->
/// wallet. Net zero; audit only.
pub const WITHDRAWAL_FAILED_PLATFORM_ROUND_TRIP: &str = r#"vars {
  asset $asset
  number $amount
  account $portfolio_id
  account $wallet_id
  string $external_tx_id
  string $prime_status
  string $asset_symbol
  string $amount_human
  string $destination_address
  string $idempotency_key
  string $prime_api_symbol
}

send [$asset $amount] (
  source = @platform:portfolio:$portfolio_id:wallets:$wallet_id allowing unbounded overdraft
  destination = @platform:portfolio:$portfolio_id:withdrawals:pending
)

send [$asset $amount] (
  source = @platform:portfolio:$portfolio_id:withdrawals:pending
  destination = @platform:portfolio:$portfolio_id:wallets:$wallet_id
)

set_tx_meta("event_type", "withdrawal_failed_platform_round_trip")
set_tx_meta("external_tx_id", $external_tx_id)
set_tx_meta("prime_status", $prime_status)
set_tx_meta("asset_symbol", $asset_symbol)
set_tx_meta("amount_human", $amount_human)
set_tx_meta("destination_address", $destination_address)
set_tx_meta("idempotency_key", $idempotency_key)
set_tx_meta("prime_api_symbol", $prime_api_symbol)
"#;

/// C1: two legs on the platform's own accounts; user balances unaffected.
pub const CONVERSION: &str = r#"vars {
  asset $source_asset
  number $source_amount
  asset $destination_asset
  number $destination_amount
  account $portfolio_id
  account $source_wallet_id
  account $destination_wallet_id
  string $external_tx_id
  string $prime_status
  string $source_symbol
  string $destination_symbol
  string $amount_human
  string $fees
  string $fee_symbol
}

send [$source_asset $source_amount] (
  source = @platform:portfolio:$portfolio_id:conversions allowing unbounded overdraft
  destination = @platform:portfolio:$portfolio_id:wallets:$source_wallet_id
)

send [$destination_asset $destination_amount] (
  source = @platform:portfolio:$portfolio_id:wallets:$destination_wallet_id allowing unbounded overdraft
  destination = @platform:portfolio:$portfolio_id:conversions
)

set_tx_meta("event_type", "conversion")
set_tx_meta("external_tx_id", $external_tx_id)
set_tx_meta("prime_status", $prime_status)
set_tx_meta("source_symbol", $source_symbol)
set_tx_meta("destination_symbol", $destination_symbol)
set_tx_meta("amount_human", $amount_human)
set_tx_meta("fees", $fees)
set_tx_meta("fee_symbol", $fee_symbol)
"#;

/// Catch-all: wallet -> platform user for unclassified Exchange events.
pub const PLATFORM_TRANSACTION: &str = r#"vars {
  asset $asset
  number $amount
  account $portfolio_id
  account $wallet_id
  account $platform_user_id
  string $external_tx_id
  string $event_type
  string $prime_status
  string $transaction_type
  string $asset_symbol
  string $amount_human
  string $network_raw
  string $prime_wallet_id
}

send [$asset $amount] (
  source = @platform:portfolio:$portfolio_id:wallets:$wallet_id allowing unbounded overdraft
  destination = @users:$platform_user_id
)

set_tx_meta("event_type", $event_type)
set_tx_meta("external_tx_id", $external_tx_id)
set_tx_meta("prime_status", $prime_status)
set_tx_meta("transaction_type", $transaction_type)
set_tx_meta("asset_symbol", $asset_symbol)
set_tx_meta("amount_human", $amount_human)
set_tx_meta("network", $network_raw)
set_tx_meta("prime_wallet_id", $prime_wallet_id)
"#;
