use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use subledger_core::assets::{canonical_symbol, precision_for};
use subledger_core::types::{AccountBalance, Address, TransactionRecord, User};
use subledger_core::FormanceConfig;
use subledger_ledger::{
    ConfirmWithdrawalDirectParams, ConversionParams, DepositMeta,
    FailedWithdrawalPlatformParams, LedgerError, LedgerStore, PlatformTransactionParams, Result,
    StoreAddressParams, WalletWithdrawalParams,
};

use crate::client::{ApiError, FormanceClient};
use crate::scripts;
use crate::types::{ApiAccount, ApiTransaction};

/// Remote double-entry Ledger Store. Every event is one atomic multi-posting
/// transaction between named accounts; balances are derived from postings;
/// idempotency and revert are native (reference collisions and mirror
/// postings respectively).
pub struct FormanceStore {
    client: Arc<FormanceClient>,
    portfolio_id: String,
}

impl FormanceStore {
    /// Connects to the stack and ensures the ledger exists.
    pub async fn connect(cfg: &FormanceConfig) -> Result<Self> {
        if cfg.stack_url.is_empty() || cfg.client_id.is_empty() || cfg.client_secret.is_empty() {
            return Err(LedgerError::Storage(
                "double-entry backend requires FORMANCE_STACK_URL, FORMANCE_CLIENT_ID and FORMANCE_CLIENT_SECRET".into(),
            ));
        }

        info!(stack_url = %cfg.stack_url, ledger = %cfg.ledger, "Connecting to ledger stack");

        let client = Arc::new(FormanceClient::new(
            &cfg.stack_url,
            &cfg.ledger,
            &cfg.client_id,
            &cfg.client_secret,
        ));
        client.ensure_ledger().await.map_err(to_storage)?;

        info!(ledger = %client.ledger(), "Double-entry ledger store initialized");
        Ok(Self {
            client,
            portfolio_id: String::new(),
        })
    }

    /// Sets the portfolio id used in account paths.
    pub fn set_portfolio(&mut self, portfolio_id: &str) {
        self.portfolio_id = portfolio_id.to_string();
    }

    /// Returns a copy scoped to a different portfolio. Shares the HTTP
    /// client; only the account namespace changes.
    pub fn with_portfolio(&self, portfolio_id: &str) -> Self {
        Self {
            client: Arc::clone(&self.client),
            portfolio_id: portfolio_id.to_string(),
        }
    }

    fn platform_user_id(&self) -> String {
        format!("platform-{}", self.portfolio_id)
    }

    async fn find_pending_reference(&self, reference: &str) -> Result<bool> {
        let filter = serde_json::json!({ "$match": { "reference": reference } });
        let txs = self
            .client
            .list_transactions(Some(filter), 1)
            .await
            .map_err(to_storage)?;
        Ok(!txs.is_empty())
    }

    async fn find_by_withdrawal_ref(&self, reference: &str) -> Result<Option<ApiTransaction>> {
        let filter = serde_json::json!({ "$match": { "metadata[withdrawal_ref]": reference } });
        let txs = self
            .client
            .list_transactions(Some(filter), 1)
            .await
            .map_err(to_storage)?;
        Ok(txs.into_iter().next())
    }

    /// Resolves the wallet id the user deposits through for an asset.
    async fn wallet_for(&self, user_id: &str, asset: &str) -> Result<String> {
        let addresses = self.all_user_addresses(user_id).await?;
        for addr in addresses {
            if addr.asset == asset && !addr.wallet_id.is_empty() {
                return Ok(addr.wallet_id);
            }
        }
        warn!(user_id = %user_id, asset = %asset, "No wallet id found, using fallback");
        Ok("unknown".to_string())
    }
}

// ---------- helpers ----------

fn to_storage(err: ApiError) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

/// Monetary notation for an asset, e.g. "USDC/6".
fn monetary_asset(symbol: &str) -> String {
    format!("{}/{}", symbol, precision_for(symbol))
}

/// Extracts the symbol from monetary notation ("USDC/6" -> "USDC").
fn asset_of(monetary: &str) -> &str {
    monetary.split('/').next().unwrap_or(monetary)
}

/// Shifts a human-readable decimal to the asset's smallest-unit integer.
fn to_minor(amount: Decimal, symbol: &str) -> String {
    let mut scaled = amount;
    scaled.rescale(precision_for(symbol));
    scaled.mantissa().to_string()
}

/// Shifts a smallest-unit integer back to a human-readable decimal.
fn from_minor(minor: i128, symbol: &str) -> Decimal {
    Decimal::from_i128_with_scale(minor, precision_for(symbol)).normalize()
}

fn deposit_addr_key(address: &str) -> String {
    format!("deposit_addr_{}", address.to_lowercase())
}

fn withdrawal_addr_key(address: &str) -> String {
    format!("withdrawal_addr_{}", address.to_lowercase())
}

fn parse_json_map(raw: &str) -> HashMap<String, String> {
    if raw.is_empty() {
        return HashMap::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

/// deposit_addresses can be either the current map-of-lists format
/// (`{"USDC": ["0xabc"]}`) or the legacy map format (`{"USDC": "0xabc"}`).
fn parse_json_map_list(raw: &str) -> HashMap<String, Vec<String>> {
    if raw.is_empty() {
        return HashMap::new();
    }
    if let Ok(list_map) = serde_json::from_str::<HashMap<String, Vec<String>>>(raw) {
        return list_map;
    }
    if let Ok(str_map) = serde_json::from_str::<HashMap<String, String>>(raw) {
        return str_map.into_iter().map(|(k, v)| (k, vec![v])).collect();
    }
    HashMap::new()
}

fn account_to_user(account: &ApiAccount) -> User {
    let user_id = account.address.strip_prefix("users:").unwrap_or(&account.address);
    let at = account
        .first_usage
        .or(account.updated_at)
        .unwrap_or_else(Utc::now);
    User {
        id: user_id.to_string(),
        name: account.metadata.get("name").cloned().unwrap_or_default(),
        email: account.metadata.get("email").cloned().unwrap_or_default(),
        created_at: at,
        updated_at: at,
    }
}

fn addresses_from_metadata(
    user_id: &str,
    asset_filter: &str,
    meta: &HashMap<String, String>,
) -> Vec<Address> {
    let deposit_addresses =
        parse_json_map_list(meta.get("deposit_addresses").map(String::as_str).unwrap_or(""));
    let wallet_ids = parse_json_map(meta.get("wallet_ids").map(String::as_str).unwrap_or(""));
    let account_identifier = meta
        .get("account_identifier")
        .cloned()
        .unwrap_or_default();

    let now = Utc::now();
    let mut result = Vec::new();
    for (asset, addrs) in deposit_addresses {
        if !asset_filter.is_empty() && asset != asset_filter {
            continue;
        }
        for addr in addrs {
            result.push(Address {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                asset: asset.clone(),
                // network is not part of the account structure
                network: String::new(),
                address: addr,
                wallet_id: wallet_ids.get(&asset).cloned().unwrap_or_default(),
                account_identifier: account_identifier.clone(),
                created_at: now,
            });
        }
    }
    result
}

#[async_trait]
impl LedgerStore for FormanceStore {
    async fn users(&self) -> Result<Vec<User>> {
        let filter = serde_json::json!({ "$match": { "metadata[entity_type]": "end_user" } });
        let accounts = self
            .client
            .list_accounts(filter, 100)
            .await
            .map_err(to_storage)?;

        Ok(accounts
            .iter()
            .filter(|a| {
                let parts: Vec<&str> = a.address.split(':').collect();
                parts.len() == 2 && parts[0] == "users"
            })
            .map(account_to_user)
            .collect())
    }

    async fn user_by_id(&self, user_id: &str) -> Result<User> {
        let address = format!("users:{user_id}");
        let account = self
            .client
            .get_account(&address, false)
            .await
            .map_err(to_storage)?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;

        if account.metadata.get("email").map(|e| e.is_empty()).unwrap_or(true) {
            return Err(LedgerError::UserNotFound(user_id.to_string()));
        }
        Ok(account_to_user(&account))
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        let filter = serde_json::json!({ "$match": { "metadata[email]": email } });
        let accounts = self
            .client
            .list_accounts(filter, 100)
            .await
            .map_err(to_storage)?;

        accounts
            .iter()
            .find(|a| {
                a.address.starts_with("users:") && !a.address["users:".len()..].contains(':')
            })
            .map(account_to_user)
            .ok_or_else(|| LedgerError::UserNotFound(email.to_string()))
    }

    async fn create_user(&self, user_id: &str, name: &str, email: &str) -> Result<User> {
        if let Ok(existing) = self.user_by_email(email).await {
            info!(existing_id = %existing.id, email = email, "User with this email already exists");
            return Err(LedgerError::Storage(format!(
                "user with email {email} already exists"
            )));
        }

        let address = format!("users:{user_id}");
        info!(account = %address, email = email, "Creating user account");

        let metadata = HashMap::from([
            ("entity_type".to_string(), "end_user".to_string()),
            ("active".to_string(), "true".to_string()),
            ("name".to_string(), name.to_string()),
            ("email".to_string(), email.to_string()),
        ]);
        self.client
            .add_account_metadata(&address, metadata)
            .await
            .map_err(to_storage)?;

        self.user_by_id(user_id).await
    }

    async fn store_address(&self, params: StoreAddressParams) -> Result<Address> {
        let account = format!("users:{}", params.user_id);
        let is_withdrawal = params.asset == "WITHDRAWAL" || params.network == "external";

        info!(
            account = %account,
            asset = %params.asset,
            network = %params.network,
            address = %params.address,
            is_withdrawal = is_withdrawal,
            "Storing address"
        );

        let mut metadata = HashMap::new();
        if is_withdrawal {
            // separate prefix; not part of the deposit_addresses map
            metadata.insert(withdrawal_addr_key(&params.address), params.asset.clone());
        } else {
            let existing = self
                .client
                .get_account(&account, false)
                .await
                .map_err(to_storage)?;
            let meta = existing.map(|a| a.metadata).unwrap_or_default();

            let mut deposit_addresses = parse_json_map_list(
                meta.get("deposit_addresses").map(String::as_str).unwrap_or(""),
            );
            let entry = deposit_addresses.entry(params.asset.clone()).or_default();
            if !entry.iter().any(|a| a.eq_ignore_ascii_case(&params.address)) {
                entry.push(params.address.clone());
            }

            let mut wallet_ids =
                parse_json_map(meta.get("wallet_ids").map(String::as_str).unwrap_or(""));
            if !params.wallet_id.is_empty() {
                wallet_ids.insert(params.asset.clone(), params.wallet_id.clone());
            }

            metadata.insert(
                "deposit_addresses".to_string(),
                serde_json::to_string(&deposit_addresses).unwrap_or_default(),
            );
            metadata.insert(
                "wallet_ids".to_string(),
                serde_json::to_string(&wallet_ids).unwrap_or_default(),
            );
            metadata.insert(deposit_addr_key(&params.address), params.asset.clone());
            if !params.account_identifier.is_empty() {
                metadata.insert(
                    "account_identifier".to_string(),
                    params.account_identifier.clone(),
                );
            }
        }

        self.client
            .add_account_metadata(&account, metadata)
            .await
            .map_err(to_storage)?;

        Ok(Address {
            id: Uuid::new_v4().to_string(),
            user_id: params.user_id,
            asset: params.asset,
            network: params.network,
            address: params.address,
            wallet_id: params.wallet_id,
            account_identifier: params.account_identifier,
            created_at: Utc::now(),
        })
    }

    async fn addresses(&self, user_id: &str, asset: &str, _network: &str) -> Result<Vec<Address>> {
        let account = format!("users:{user_id}");
        let Some(acct) = self
            .client
            .get_account(&account, false)
            .await
            .map_err(to_storage)?
        else {
            return Ok(Vec::new());
        };
        Ok(addresses_from_metadata(user_id, asset, &acct.metadata))
    }

    async fn all_user_addresses(&self, user_id: &str) -> Result<Vec<Address>> {
        let account = format!("users:{user_id}");
        let Some(acct) = self
            .client
            .get_account(&account, false)
            .await
            .map_err(to_storage)?
        else {
            return Ok(Vec::new());
        };
        Ok(addresses_from_metadata(user_id, "", &acct.metadata))
    }

    async fn find_user_by_address(&self, address: &str) -> Result<Option<(User, Address)>> {
        let deposit_key = deposit_addr_key(address);
        let withdrawal_key = withdrawal_addr_key(address);

        debug!(address = %address, "Looking up user by address metadata");

        let filter = serde_json::json!({
            "$or": [
                { "$exists": { "metadata": deposit_key } },
                { "$exists": { "metadata": withdrawal_key } },
            ]
        });
        let accounts = self
            .client
            .list_accounts(filter, 1)
            .await
            .map_err(to_storage)?;

        let Some(account) = accounts.first() else {
            return Ok(None);
        };
        let Some(user_id) = account.address.strip_prefix("users:") else {
            return Ok(None);
        };

        // asset from whichever key matched (deposit wins)
        let asset = account
            .metadata
            .get(&deposit_key)
            .or_else(|| account.metadata.get(&withdrawal_key))
            .cloned()
            .unwrap_or_default();
        let wallet_ids =
            parse_json_map(account.metadata.get("wallet_ids").map(String::as_str).unwrap_or(""));

        let user = self.user_by_id(user_id).await?;
        let addr = Address {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            asset: asset.clone(),
            network: String::new(),
            address: address.to_string(),
            wallet_id: wallet_ids.get(&asset).cloned().unwrap_or_default(),
            account_identifier: account
                .metadata
                .get("account_identifier")
                .cloned()
                .unwrap_or_default(),
            created_at: Utc::now(),
        };
        Ok(Some((user, addr)))
    }

    async fn user_balance(&self, user_id: &str, asset: &str) -> Result<Decimal> {
        let account = format!("users:{user_id}");
        let Some(acct) = self
            .client
            .get_account(&account, true)
            .await
            .map_err(to_storage)?
        else {
            return Ok(Decimal::ZERO);
        };

        match acct.volumes.get(&monetary_asset(asset)) {
            Some(vol) => Ok(from_minor(vol.net(), asset)),
            None => Ok(Decimal::ZERO),
        }
    }

    async fn all_user_balances(&self, user_id: &str) -> Result<Vec<AccountBalance>> {
        let account = format!("users:{user_id}");
        let Some(acct) = self
            .client
            .get_account(&account, true)
            .await
            .map_err(to_storage)?
        else {
            return Ok(Vec::new());
        };

        let updated_at = acct.updated_at.or(acct.first_usage).unwrap_or_else(Utc::now);

        // last transaction touching this account, for operator display
        let filter = serde_json::json!({
            "$or": [
                { "$match": { "source": account } },
                { "$match": { "destination": account } },
            ]
        });
        let last_tx_id = self
            .client
            .list_transactions(Some(filter), 1)
            .await
            .map_err(to_storage)?
            .first()
            .and_then(|tx| tx.reference.clone())
            .unwrap_or_default();

        let mut balances = Vec::new();
        for (monetary, vol) in &acct.volumes {
            let net = vol.net();
            if net == 0 {
                continue;
            }
            let symbol = asset_of(monetary);
            balances.push(AccountBalance {
                id: account.clone(),
                user_id: user_id.to_string(),
                asset: symbol.to_string(),
                network: String::new(),
                balance: from_minor(net, symbol),
                last_transaction_id: last_tx_id.clone(),
                version: 0,
                updated_at,
            });
        }
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(balances)
    }

    async fn process_deposit_pending(
        &self,
        asset: &str,
        wallet_id: &str,
        amount: Decimal,
        transaction_id: &str,
        deposit_address: &str,
        transaction_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let vars = HashMap::from([
            ("asset".to_string(), monetary_asset(asset)),
            ("amount".to_string(), to_minor(amount, asset)),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("wallet_id".to_string(), wallet_id.to_string()),
            ("external_tx_id".to_string(), transaction_id.to_string()),
            ("deposit_address".to_string(), deposit_address.to_string()),
            ("asset_symbol".to_string(), asset.to_string()),
            ("prime_status".to_string(), "TRANSACTION_IMPORT_PENDING".to_string()),
        ]);

        let reference = format!("{transaction_id}-pending");
        match self
            .client
            .create_transaction(&reference, scripts::DEPOSIT_PENDING, vars, transaction_time)
            .await
        {
            Ok(_) => {
                info!(asset = %asset, amount = %amount, tx_id = %transaction_id, "Deposit pending recorded");
                Ok(())
            }
            // idempotent
            Err(ApiError::Conflict) => Ok(()),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn confirm_deposit(
        &self,
        address: &str,
        asset: &str,
        amount: Decimal,
        transaction_id: &str,
        transaction_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        // Settling moves deposits:pending -> user; without a matching
        // pending phase the caller must fall back to the direct credit.
        let pending_ref = format!("{transaction_id}-pending");
        if !self.find_pending_reference(&pending_ref).await? {
            return Err(LedgerError::PendingNotFound(pending_ref));
        }

        let (user_id, symbol) = match self.find_user_by_address(address).await? {
            Some((user, addr)) => (user.id, addr.asset),
            None => {
                info!(address = %address, "Confirming deposit to platform account (unmapped address)");
                (
                    self.platform_user_id(),
                    canonical_symbol(asset).to_string(),
                )
            }
        };

        let vars = HashMap::from([
            ("asset".to_string(), monetary_asset(&symbol)),
            ("amount".to_string(), to_minor(amount, &symbol)),
            ("user_id".to_string(), user_id.clone()),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("external_tx_id".to_string(), transaction_id.to_string()),
            ("deposit_address".to_string(), address.to_string()),
            ("asset_symbol".to_string(), symbol.clone()),
            ("prime_status".to_string(), "TRANSACTION_IMPORTED".to_string()),
        ]);

        let reference = format!("{transaction_id}-confirmed");
        match self
            .client
            .create_transaction(&reference, scripts::DEPOSIT_CONFIRMED, vars, transaction_time)
            .await
        {
            Ok(_) => {
                info!(user_id = %user_id, asset = %symbol, amount = %amount, "Deposit confirmed (pending to user)");
                Ok(())
            }
            Err(ApiError::Conflict) => Err(LedgerError::Duplicate(reference)),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn process_deposit(
        &self,
        address: &str,
        asset: &str,
        amount: Decimal,
        transaction_id: &str,
        meta: Option<&DepositMeta>,
    ) -> Result<()> {
        let resolved = self.find_user_by_address(address).await?;

        let (user_id, symbol, network, mut wallet_id, account_identifier, user_name, user_email) =
            match resolved {
                Some((user, addr)) => {
                    if addr.asset != asset {
                        info!(
                            reported_symbol = %asset,
                            canonical_symbol = %addr.asset,
                            "Using canonical symbol from address index"
                        );
                    }
                    (
                        user.id.clone(),
                        addr.asset,
                        addr.network,
                        addr.wallet_id,
                        addr.account_identifier,
                        user.name,
                        user.email,
                    )
                }
                None => {
                    let platform = self.platform_user_id();
                    info!(address = %address, platform_user = %platform, "Deposit to unmapped address, crediting platform account");
                    (
                        platform,
                        canonical_symbol(asset).to_string(),
                        "platform".to_string(),
                        String::new(),
                        String::new(),
                        String::new(),
                        String::new(),
                    )
                }
            };

        if wallet_id.is_empty() {
            wallet_id = meta
                .map(|m| m.wallet_id.clone())
                .filter(|w| !w.is_empty())
                // placeholder keeps the account path segment non-empty
                .unwrap_or_else(|| "unknown".to_string());
        }
        let network = if network.is_empty() {
            "unknown".to_string()
        } else {
            network
        };

        let mut vars = HashMap::from([
            ("asset".to_string(), monetary_asset(&symbol)),
            ("amount".to_string(), to_minor(amount, &symbol)),
            ("user_id".to_string(), user_id.clone()),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("wallet_id".to_string(), wallet_id.clone()),
            ("external_tx_id".to_string(), transaction_id.to_string()),
            ("deposit_address".to_string(), address.to_string()),
            ("prime_status".to_string(), "TRANSACTION_IMPORTED".to_string()),
            ("asset_symbol".to_string(), symbol.clone()),
            ("network".to_string(), network),
            ("user_name".to_string(), user_name),
            ("user_email".to_string(), user_email),
            ("prime_wallet_id".to_string(), wallet_id),
            ("account_identifier".to_string(), account_identifier),
            ("prime_api_symbol".to_string(), asset.to_string()),
            ("canonical_symbol".to_string(), symbol.clone()),
            ("amount_human".to_string(), amount.to_string()),
            ("prime_tx_id".to_string(), String::new()),
            ("source_address".to_string(), String::new()),
            ("source_type".to_string(), String::new()),
            ("network_fees".to_string(), String::new()),
            ("fees".to_string(), String::new()),
            ("blockchain_ids".to_string(), String::new()),
            ("prime_created_at".to_string(), String::new()),
            ("prime_completed_at".to_string(), String::new()),
        ]);

        let mut timestamp = None;
        if let Some(m) = meta {
            vars.insert("prime_tx_id".to_string(), m.prime_tx_id.clone());
            vars.insert("source_address".to_string(), m.source_address.clone());
            vars.insert("source_type".to_string(), m.source_type.clone());
            vars.insert("network_fees".to_string(), m.network_fees.clone());
            vars.insert("fees".to_string(), m.fees.clone());
            vars.insert("prime_created_at".to_string(), m.created_at.clone());
            vars.insert("prime_completed_at".to_string(), m.completed_at.clone());
            if !m.blockchain_ids.is_empty() {
                vars.insert("blockchain_ids".to_string(), m.blockchain_ids.join(","));
            }
            timestamp = m.transaction_time;
        }

        match self
            .client
            .create_transaction(transaction_id, scripts::DEPOSIT_RECEIVED, vars, timestamp)
            .await
        {
            Ok(_) => {
                info!(user_id = %user_id, asset = %symbol, amount = %amount, "Deposit processed");
                Ok(())
            }
            Err(ApiError::Conflict) => Err(LedgerError::Duplicate(transaction_id.to_string())),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn process_withdrawal(
        &self,
        user_id: &str,
        asset: &str,
        amount: Decimal,
        transaction_id: &str,
    ) -> Result<()> {
        let vars = HashMap::from([
            ("asset".to_string(), monetary_asset(asset)),
            ("amount".to_string(), to_minor(amount, asset)),
            ("user_id".to_string(), user_id.to_string()),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("destination_address".to_string(), String::new()),
            ("withdrawal_ref".to_string(), transaction_id.to_string()),
            ("asset_symbol".to_string(), asset.to_string()),
        ]);

        match self
            .client
            .create_transaction(transaction_id, scripts::WITHDRAWAL_INITIATED, vars, None)
            .await
        {
            Ok(_) => {
                info!(user_id = %user_id, asset = %asset, amount = %amount, "Withdrawal reserved");
                Ok(())
            }
            Err(ApiError::Conflict) => Err(LedgerError::Duplicate(transaction_id.to_string())),
            Err(ApiError::InsufficientFund) => Err(LedgerError::Storage(format!(
                "insufficient funds: user {user_id} cannot reserve {amount} {asset}"
            ))),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn process_withdrawal_from_wallet(&self, params: WalletWithdrawalParams) -> Result<()> {
        let vars = HashMap::from([
            ("asset".to_string(), monetary_asset(&params.symbol)),
            ("amount".to_string(), to_minor(params.amount, &params.symbol)),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("wallet_id".to_string(), params.wallet_id.clone()),
            ("external_tx_id".to_string(), params.transaction_id.clone()),
            ("prime_status".to_string(), params.status.clone()),
            ("asset_symbol".to_string(), params.symbol.clone()),
            ("destination_address".to_string(), params.destination_address.clone()),
            ("withdrawal_ref".to_string(), params.transaction_id.clone()),
            ("idempotency_key".to_string(), params.idempotency_key.clone()),
            ("prime_api_symbol".to_string(), params.prime_api_symbol.clone()),
            ("amount_human".to_string(), params.amount.to_string()),
        ]);

        match self
            .client
            .create_transaction(
                &params.transaction_id,
                scripts::WITHDRAWAL_PENDING_FROM_WALLET,
                vars,
                params.transaction_time,
            )
            .await
        {
            Ok(_) => {
                info!(
                    asset = %params.symbol,
                    amount = %params.amount,
                    wallet_id = %params.wallet_id,
                    "Pending withdrawal from wallet recorded"
                );
                Ok(())
            }
            Err(ApiError::Conflict) => Ok(()),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn confirm_withdrawal(
        &self,
        user_id: &str,
        asset: &str,
        amount: Decimal,
        withdrawal_ref: &str,
        external_tx_id: &str,
    ) -> Result<()> {
        let wallet_id = self.wallet_for(user_id, asset).await?;

        let vars = HashMap::from([
            ("asset".to_string(), monetary_asset(asset)),
            ("amount".to_string(), to_minor(amount, asset)),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("wallet_id".to_string(), wallet_id),
            ("external_tx_id".to_string(), external_tx_id.to_string()),
            ("prime_status".to_string(), "TRANSACTION_DONE".to_string()),
            ("withdrawal_ref".to_string(), withdrawal_ref.to_string()),
            ("asset_symbol".to_string(), asset.to_string()),
            ("amount_human".to_string(), amount.to_string()),
            ("destination_address".to_string(), String::new()),
            ("user_id".to_string(), user_id.to_string()),
            ("network".to_string(), String::new()),
            ("prime_tx_id".to_string(), String::new()),
        ]);

        let reference = format!("{external_tx_id}-confirmed");
        match self
            .client
            .create_transaction(&reference, scripts::WITHDRAWAL_CONFIRMED, vars, None)
            .await
        {
            Ok(_) => {
                info!(
                    user_id = %user_id,
                    asset = %asset,
                    amount = %amount,
                    external_tx_id = %external_tx_id,
                    "Withdrawal confirmed (pending settled to wallet)"
                );
                Ok(())
            }
            Err(ApiError::Conflict) => Err(LedgerError::Duplicate(reference)),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn confirm_withdrawal_direct(&self, params: ConfirmWithdrawalDirectParams) -> Result<()> {
        let wallet_id = if params.wallet_id.is_empty() {
            "unknown".to_string()
        } else {
            params.wallet_id.clone()
        };

        let vars = HashMap::from([
            ("asset".to_string(), monetary_asset(&params.asset)),
            ("amount".to_string(), to_minor(params.amount, &params.asset)),
            ("user_id".to_string(), params.user_id.clone()),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("wallet_id".to_string(), wallet_id),
            ("external_tx_id".to_string(), params.external_tx_id.clone()),
            ("prime_status".to_string(), "TRANSACTION_DONE".to_string()),
            ("withdrawal_ref".to_string(), params.withdrawal_ref.clone()),
            ("asset_symbol".to_string(), params.asset.clone()),
            ("amount_human".to_string(), params.amount.to_string()),
            ("destination_address".to_string(), params.destination_address.clone()),
            ("network".to_string(), params.network.clone()),
            ("prime_tx_id".to_string(), params.prime_tx_id.clone()),
            ("idempotency_key".to_string(), params.idempotency_key.clone()),
        ]);

        let reference = format!("{}-direct", params.external_tx_id);
        match self
            .client
            .create_transaction(
                &reference,
                scripts::WITHDRAWAL_CONFIRMED_DIRECT,
                vars,
                params.transaction_time,
            )
            .await
        {
            Ok(_) => {
                info!(
                    user_id = %params.user_id,
                    asset = %params.asset,
                    amount = %params.amount,
                    destination = %params.destination_address,
                    "Withdrawal confirmed directly (user to wallet with overdraft)"
                );
                Ok(())
            }
            Err(ApiError::Conflict) => Ok(()),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn reverse_withdrawal(
        &self,
        user_id: &str,
        asset: &str,
        amount: Decimal,
        original_tx_id: &str,
    ) -> Result<()> {
        let reversal_ref = format!("{original_tx_id}-reversal");

        let vars = HashMap::from([
            ("asset".to_string(), monetary_asset(asset)),
            ("amount".to_string(), to_minor(amount, asset)),
            ("user_id".to_string(), user_id.to_string()),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("external_tx_id".to_string(), original_tx_id.to_string()),
            ("prime_status".to_string(), "TRANSACTION_FAILED".to_string()),
            ("withdrawal_ref".to_string(), original_tx_id.to_string()),
            ("reversal_ref".to_string(), reversal_ref.clone()),
        ]);

        match self
            .client
            .create_transaction(&reversal_ref, scripts::WITHDRAWAL_FAILED_REVERSAL, vars, None)
            .await
        {
            Ok(_) => {
                info!(
                    user_id = %user_id,
                    asset = %asset,
                    amount = %amount,
                    reversal_ref = %reversal_ref,
                    "Withdrawal reversed"
                );
                Ok(())
            }
            Err(ApiError::Conflict) => Err(LedgerError::Duplicate(reversal_ref)),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn has_pending_withdrawal(&self, withdrawal_ref: &str) -> Result<bool> {
        if withdrawal_ref.is_empty() {
            return Ok(false);
        }
        match self.find_by_withdrawal_ref(withdrawal_ref).await? {
            Some(tx) => {
                debug!(
                    withdrawal_ref = %withdrawal_ref,
                    event_type = %tx.metadata.get("event_type").cloned().unwrap_or_default(),
                    reverted = tx.reverted,
                    "Found existing withdrawal transaction"
                );
                // only counts while not reverted
                Ok(!tx.reverted)
            }
            None => Ok(false),
        }
    }

    async fn revert_transaction(&self, reference: &str) -> Result<()> {
        info!(withdrawal_ref = %reference, "Reverting transaction");

        let Some(tx) = self.find_by_withdrawal_ref(reference).await? else {
            return Err(LedgerError::PendingNotFound(reference.to_string()));
        };

        if tx.reverted {
            info!(withdrawal_ref = %reference, tx_id = tx.id, "Transaction already reverted");
            return Ok(());
        }

        match self.client.revert_transaction(tx.id).await {
            Ok(()) => {
                info!(withdrawal_ref = %reference, tx_id = tx.id, "Transaction reverted");
                Ok(())
            }
            // race between CLI and reconciler
            Err(ApiError::AlreadyReverted) | Err(ApiError::Conflict) => {
                info!(withdrawal_ref = %reference, "Transaction already reverted (race)");
                Ok(())
            }
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn record_failed_withdrawal_platform(
        &self,
        params: FailedWithdrawalPlatformParams,
    ) -> Result<()> {
        let vars = HashMap::from([
            ("asset".to_string(), monetary_asset(&params.symbol)),
            ("amount".to_string(), to_minor(params.amount, &params.symbol)),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("wallet_id".to_string(), params.wallet_id.clone()),
            ("external_tx_id".to_string(), params.transaction_id.clone()),
            ("prime_status".to_string(), params.status.clone()),
            ("asset_symbol".to_string(), params.symbol.clone()),
            ("amount_human".to_string(), params.amount.to_string()),
            ("destination_address".to_string(), params.destination_address.clone()),
            ("idempotency_key".to_string(), params.idempotency_key.clone()),
            ("prime_api_symbol".to_string(), params.prime_api_symbol.clone()),
        ]);

        match self
            .client
            .create_transaction(
                &params.transaction_id,
                scripts::WITHDRAWAL_FAILED_PLATFORM_ROUND_TRIP,
                vars,
                params.transaction_time,
            )
            .await
        {
            Ok(_) => {
                info!(
                    transaction_id = %params.transaction_id,
                    status = %params.status,
                    asset = %params.symbol,
                    amount = %params.amount,
                    "Failed withdrawal round-trip recorded (2 postings, 1 tx)"
                );
                Ok(())
            }
            Err(ApiError::Conflict) => Ok(()),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn record_platform_transaction(&self, params: PlatformTransactionParams) -> Result<()> {
        let amount: Decimal = params
            .amount
            .parse::<Decimal>()
            .map_err(|_| LedgerError::InvalidAmount(params.amount.clone()))?
            .abs();

        let vars = HashMap::from([
            ("asset".to_string(), monetary_asset(&params.symbol)),
            ("amount".to_string(), to_minor(amount, &params.symbol)),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("wallet_id".to_string(), params.wallet_id.clone()),
            ("platform_user_id".to_string(), self.platform_user_id()),
            ("external_tx_id".to_string(), params.transaction_id.clone()),
            ("event_type".to_string(), params.transaction_type.to_lowercase()),
            ("prime_status".to_string(), params.status.clone()),
            ("transaction_type".to_string(), params.transaction_type.clone()),
            ("asset_symbol".to_string(), params.symbol.clone()),
            ("amount_human".to_string(), params.amount.clone()),
            ("network_raw".to_string(), params.network.clone()),
            ("prime_wallet_id".to_string(), params.wallet_id.clone()),
        ]);

        match self
            .client
            .create_transaction(
                &params.transaction_id,
                scripts::PLATFORM_TRANSACTION,
                vars,
                params.transaction_time,
            )
            .await
        {
            Ok(_) => {
                info!(
                    transaction_type = %params.transaction_type,
                    symbol = %params.symbol,
                    amount = %params.amount,
                    tx_id = %params.transaction_id,
                    "Platform transaction recorded"
                );
                Ok(())
            }
            Err(ApiError::Conflict) => Ok(()),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn record_conversion(&self, params: ConversionParams) -> Result<()> {
        let src: Decimal = params
            .source_amount
            .parse::<Decimal>()
            .map_err(|_| LedgerError::InvalidAmount(params.source_amount.clone()))?
            .abs();

        let dst_raw = if params.destination_amount.is_empty() {
            params.source_amount.clone()
        } else {
            params.destination_amount.clone()
        };
        let dst: Decimal = dst_raw
            .parse::<Decimal>()
            .map_err(|_| LedgerError::InvalidAmount(dst_raw.clone()))?
            .abs();

        let vars = HashMap::from([
            ("source_asset".to_string(), monetary_asset(&params.source_symbol)),
            ("source_amount".to_string(), to_minor(src, &params.source_symbol)),
            (
                "destination_asset".to_string(),
                monetary_asset(&params.destination_symbol),
            ),
            (
                "destination_amount".to_string(),
                to_minor(dst, &params.destination_symbol),
            ),
            ("portfolio_id".to_string(), self.portfolio_id.clone()),
            ("source_wallet_id".to_string(), params.source_wallet_id.clone()),
            (
                "destination_wallet_id".to_string(),
                params.dest_wallet_id.clone(),
            ),
            ("external_tx_id".to_string(), params.transaction_id.clone()),
            ("prime_status".to_string(), params.status.clone()),
            ("source_symbol".to_string(), params.source_symbol.clone()),
            (
                "destination_symbol".to_string(),
                params.destination_symbol.clone(),
            ),
            ("amount_human".to_string(), params.source_amount.clone()),
            ("fees".to_string(), params.fees.clone()),
            ("fee_symbol".to_string(), params.fee_symbol.clone()),
        ]);

        match self
            .client
            .create_transaction(
                &params.transaction_id,
                scripts::CONVERSION,
                vars,
                params.transaction_time,
            )
            .await
        {
            Ok(_) => {
                info!(
                    source = %params.source_symbol,
                    destination = %params.destination_symbol,
                    amount = %params.source_amount,
                    "Conversion recorded"
                );
                Ok(())
            }
            Err(ApiError::Conflict) => Ok(()),
            Err(e) => Err(to_storage(e)),
        }
    }

    async fn transaction_history(
        &self,
        user_id: &str,
        asset: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TransactionRecord>> {
        let account = format!("users:{user_id}");
        let filter = serde_json::json!({
            "$or": [
                { "$match": { "source": account } },
                { "$match": { "destination": account } },
            ]
        });

        // fetch enough to skip the offset
        let page_size = (limit + offset).max(1) as u64;
        let txs = self
            .client
            .list_transactions(Some(filter), page_size)
            .await
            .map_err(to_storage)?;

        let mut result = Vec::new();
        let mut skipped = 0i64;
        for tx in txs {
            let tx_asset = tx.metadata.get("asset_symbol").cloned().unwrap_or_default();
            if !tx_asset.is_empty() && tx_asset != asset {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }

            let event_type = tx.metadata.get("event_type").cloned().unwrap_or_default();
            let transaction_type = if event_type.contains("withdrawal") {
                "withdrawal"
            } else {
                "deposit"
            };

            // signed amount from the postings touching this account
            let mut amount = Decimal::ZERO;
            for posting in &tx.postings {
                let symbol = asset_of(&posting.asset);
                if symbol != asset {
                    continue;
                }
                let value = from_minor(posting.amount, symbol);
                if posting.source.starts_with(account.as_str()) {
                    amount = -value;
                } else if posting.destination.starts_with(account.as_str()) {
                    amount = value;
                }
            }

            result.push(TransactionRecord {
                id: tx.id.to_string(),
                user_id: user_id.to_string(),
                asset: asset.to_string(),
                transaction_type: transaction_type.to_string(),
                amount,
                balance_before: Decimal::ZERO,
                balance_after: Decimal::ZERO,
                external_transaction_id: tx
                    .metadata
                    .get("external_tx_id")
                    .cloned()
                    .unwrap_or_default(),
                address: String::new(),
                reference: tx.reference.clone().unwrap_or_default(),
                status: "confirmed".to_string(),
                created_at: tx.timestamp,
                processed_at: tx.timestamp,
            });

            if result.len() as i64 >= limit {
                break;
            }
        }
        Ok(result)
    }

    async fn most_recent_transaction_time(&self) -> Result<Option<DateTime<Utc>>> {
        let txs = self
            .client
            .list_transactions(None, 1)
            .await
            .map_err(to_storage)?;
        Ok(txs.first().map(|tx| tx.timestamp))
    }

    async fn reconcile_user_balance(&self, user_id: &str, asset: &str) -> Result<()> {
        // balances are derived from postings; consistent by construction
        info!(user_id = %user_id, asset = %asset, "Reconciliation is a no-op on the double-entry backend");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_unit_round_trip() {
        let amount: Decimal = "1.5".parse().unwrap();
        assert_eq!(to_minor(amount, "USDC"), "1500000");
        assert_eq!(from_minor(1_500_000, "USDC"), amount);

        let amount: Decimal = "2".parse().unwrap();
        assert_eq!(to_minor(amount, "BTC"), "200000000");
        assert_eq!(from_minor(200_000_000, "BTC"), amount);

        // 18-decimals assets stay exact through i128
        let amount: Decimal = "1.000000000000000001".parse().unwrap();
        assert_eq!(to_minor(amount, "ETH"), "1000000000000000001");
        assert_eq!(from_minor(1_000_000_000_000_000_001i128, "ETH"), amount);
    }

    #[test]
    fn monetary_notation() {
        assert_eq!(monetary_asset("USDC"), "USDC/6");
        assert_eq!(monetary_asset("USD"), "USD/2");
        assert_eq!(monetary_asset("DOGE"), "DOGE/6");
        assert_eq!(asset_of("USDC/6"), "USDC");
        assert_eq!(asset_of("PLAIN"), "PLAIN");
    }

    #[test]
    fn address_metadata_keys_are_lowercased() {
        assert_eq!(deposit_addr_key("0xAbCd"), "deposit_addr_0xabcd");
        assert_eq!(withdrawal_addr_key("0xAbCd"), "withdrawal_addr_0xabcd");
    }

    #[test]
    fn deposit_addresses_parses_both_formats() {
        let current = r#"{"USDC": ["0xabc", "0xdef"]}"#;
        let parsed = parse_json_map_list(current);
        assert_eq!(parsed["USDC"], vec!["0xabc", "0xdef"]);

        let legacy = r#"{"USDC": "0xabc"}"#;
        let parsed = parse_json_map_list(legacy);
        assert_eq!(parsed["USDC"], vec!["0xabc"]);

        assert!(parse_json_map_list("").is_empty());
        assert!(parse_json_map_list("not json").is_empty());
    }

    #[test]
    fn metadata_addresses_expand_per_asset() {
        let meta = HashMap::from([
            (
                "deposit_addresses".to_string(),
                r#"{"USDC": ["0xa", "0xb"], "ETH": ["0xc"]}"#.to_string(),
            ),
            ("wallet_ids".to_string(), r#"{"USDC": "w1"}"#.to_string()),
        ]);

        let all = addresses_from_metadata("u1", "", &meta);
        assert_eq!(all.len(), 3);

        let usdc = addresses_from_metadata("u1", "USDC", &meta);
        assert_eq!(usdc.len(), 2);
        assert!(usdc.iter().all(|a| a.wallet_id == "w1"));
    }
}
