use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::types::{
    ApiAccount, ApiTransaction, CursorEnvelope, DataEnvelope, ErrorEnvelope, TokenResponse,
};

/// Errors surfaced by the ledger stack, decoded from its error envelope.
/// The store layer maps these onto the Ledger Store sentinels.
#[derive(Error, Debug)]
pub(crate) enum ApiError {
    #[error("conflict: reference already used")]
    Conflict,

    #[error("not found")]
    NotFound,

    #[error("transaction already reverted")]
    AlreadyReverted,

    #[error("insufficient funds")]
    InsufficientFund,

    #[error("http error: {0}")]
    Http(String),

    #[error("ledger stack error {code}: {message}")]
    Unexpected { code: String, message: String },
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Typed HTTP client for the ledger stack's V2 surface: OAuth2
/// client-credentials auth, transaction posting with Numscript, account and
/// transaction queries, native revert.
pub(crate) struct FormanceClient {
    http: reqwest::Client,
    stack_url: String,
    ledger: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<CachedToken>>,
}

impl FormanceClient {
    pub fn new(stack_url: &str, ledger: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client"),
            stack_url: stack_url.trim_end_matches('/').to_string(),
            ledger: ledger.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: RwLock::new(None),
        }
    }

    pub fn ledger(&self) -> &str {
        &self.ledger
    }

    async fn bearer(&self) -> Result<String, ApiError> {
        {
            let guard = self.token.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.value.clone());
                }
            }
        }

        let url = format!("{}/api/auth/oauth/token", self.stack_url);
        let resp = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        let token: TokenResponse = handle_response(resp).await?;
        let ttl = token.expires_in.max(60).saturating_sub(30);
        let value = token.access_token.clone();

        let mut guard = self.token.write().await;
        *guard = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });

        debug!("Refreshed ledger stack access token");
        Ok(value)
    }

    fn ledger_url(&self, path: &str) -> String {
        format!("{}/api/ledger/v2/{}{}", self.stack_url, self.ledger, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        let token = self.bearer().await?;
        let mut req = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;
        handle_response(resp).await
    }

    /// Creates the ledger if it does not already exist.
    pub async fn ensure_ledger(&self) -> Result<(), ApiError> {
        let url = format!("{}/api/ledger/v2/{}", self.stack_url, self.ledger);
        let body = serde_json::json!({ "metadata": { "application": "prime-subledger" } });

        match self.send::<Value>(Method::POST, url, Some(body)).await {
            Ok(_) => {
                info!(ledger = %self.ledger, "Ledger created");
                Ok(())
            }
            Err(ApiError::Conflict) => {
                info!(ledger = %self.ledger, "Ledger already exists");
                Ok(())
            }
            Err(ApiError::Unexpected { code, .. }) if code == "LEDGER_ALREADY_EXISTS" => {
                info!(ledger = %self.ledger, "Ledger already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Posts one atomic multi-posting transaction built from a Numscript
    /// template. The reference is the idempotency key: a reuse yields
    /// `ApiError::Conflict`.
    pub async fn create_transaction(
        &self,
        reference: &str,
        script: &str,
        vars: HashMap<String, String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<ApiTransaction, ApiError> {
        let mut body = serde_json::json!({
            "reference": reference,
            "script": { "plain": script, "vars": vars },
        });
        if let Some(ts) = timestamp {
            body["timestamp"] = Value::String(ts.to_rfc3339());
        }

        let resp: DataEnvelope<ApiTransaction> = self
            .send(Method::POST, self.ledger_url("/transactions"), Some(body))
            .await?;
        Ok(resp.data)
    }

    /// Fetches a single account; `Ok(None)` when it does not exist.
    pub async fn get_account(
        &self,
        address: &str,
        expand_volumes: bool,
    ) -> Result<Option<ApiAccount>, ApiError> {
        let mut url = self.ledger_url(&format!("/accounts/{address}"));
        if expand_volumes {
            url.push_str("?expand=volumes");
        }

        match self.send::<DataEnvelope<ApiAccount>>(Method::GET, url, None).await {
            Ok(resp) => Ok(Some(resp.data)),
            Err(ApiError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lists accounts matching a filter body.
    pub async fn list_accounts(
        &self,
        filter: Value,
        page_size: u64,
    ) -> Result<Vec<ApiAccount>, ApiError> {
        let url = self.ledger_url(&format!("/accounts?pageSize={page_size}"));
        let resp: CursorEnvelope<ApiAccount> =
            self.send(Method::GET, url, Some(filter)).await?;
        Ok(resp.cursor.data)
    }

    /// Lists transactions, newest first, optionally matching a filter body.
    pub async fn list_transactions(
        &self,
        filter: Option<Value>,
        page_size: u64,
    ) -> Result<Vec<ApiTransaction>, ApiError> {
        let url = self.ledger_url(&format!("/transactions?pageSize={page_size}"));
        let resp: CursorEnvelope<ApiTransaction> =
            self.send(Method::GET, url, filter).await?;
        Ok(resp.cursor.data)
    }

    /// Issues the native revert: an atomic compensating transaction that
    /// mirrors the original's postings.
    pub async fn revert_transaction(&self, id: u64) -> Result<(), ApiError> {
        let url = self.ledger_url(&format!("/transactions/{id}/revert?atEffectiveDate=true"));
        self.send::<Value>(Method::POST, url, None).await.map(|_| ())
    }

    /// Merges metadata keys onto an account (creating it implicitly).
    pub async fn add_account_metadata(
        &self,
        address: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), ApiError> {
        let url = self.ledger_url(&format!("/accounts/{address}/metadata"));
        let body = serde_json::to_value(metadata)
            .map_err(|e| ApiError::Http(e.to_string()))?;
        // the metadata endpoint returns 204 with no body
        let token = self.bearer().await?;
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(());
        }
        Err(decode_error(resp).await)
    }
}

async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let status = resp.status();
    if status.is_success() {
        // some endpoints return 204 with no body
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;
        if bytes.is_empty() {
            return serde_json::from_slice(b"null")
                .map_err(|e| ApiError::Http(format!("empty response body: {e}")));
        }
        return serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::Http(format!("failed to decode response: {e}")));
    }
    Err(decode_error_parts(status, resp.text().await.unwrap_or_default()))
}

async fn decode_error(resp: reqwest::Response) -> ApiError {
    let status = resp.status();
    decode_error_parts(status, resp.text().await.unwrap_or_default())
}

fn decode_error_parts(status: StatusCode, body: String) -> ApiError {
    let envelope: ErrorEnvelope = serde_json::from_str(&body).unwrap_or_default();

    match envelope.error_code.as_str() {
        "CONFLICT" => return ApiError::Conflict,
        "NOT_FOUND" => return ApiError::NotFound,
        "ALREADY_REVERT" => return ApiError::AlreadyReverted,
        "INSUFFICIENT_FUND" => return ApiError::InsufficientFund,
        "" => {}
        code => {
            warn!(code = code, message = %envelope.error_message, "Ledger stack error");
            return ApiError::Unexpected {
                code: code.to_string(),
                message: envelope.error_message,
            };
        }
    }

    match status {
        StatusCode::CONFLICT => ApiError::Conflict,
        StatusCode::NOT_FOUND => ApiError::NotFound,
        _ => ApiError::Unexpected {
            code: status.to_string(),
            message: body,
        },
    }
}
