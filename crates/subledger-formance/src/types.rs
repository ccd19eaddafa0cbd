use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Error envelope returned by the ledger stack on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "errorCode", default)]
    pub error_code: String,
    #[serde(rename = "errorMessage", default)]
    pub error_message: String,
}

#[derive(Debug, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub struct CursorEnvelope<T> {
    pub cursor: Cursor<T>,
}

#[derive(Debug, Deserialize)]
pub struct Cursor<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub struct ApiAccount {
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub volumes: HashMap<String, ApiVolume>,
    #[serde(rename = "firstUsage", default)]
    pub first_usage: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-asset volumes on an account. Amounts are smallest-unit integers and
/// exceed i64 for 18-decimals assets, so they decode through i128.
#[derive(Debug, Default, Deserialize)]
pub struct ApiVolume {
    #[serde(default, deserialize_with = "de_opt_i128")]
    pub input: Option<i128>,
    #[serde(default, deserialize_with = "de_opt_i128")]
    pub output: Option<i128>,
    #[serde(default, deserialize_with = "de_opt_i128")]
    pub balance: Option<i128>,
}

impl ApiVolume {
    /// Net balance: the server-computed balance when present, else
    /// input - output.
    pub fn net(&self) -> i128 {
        if let Some(balance) = self.balance {
            return balance;
        }
        self.input.unwrap_or(0) - self.output.unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiTransaction {
    pub id: u64,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub reverted: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub postings: Vec<ApiPosting>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPosting {
    #[serde(deserialize_with = "de_i128")]
    pub amount: i128,
    pub asset: String,
    pub source: String,
    pub destination: String,
}

fn de_i128<'de, D: Deserializer<'de>>(d: D) -> Result<i128, D::Error> {
    let n = serde_json::Number::deserialize(d)?;
    n.to_string()
        .parse::<i128>()
        .map_err(serde::de::Error::custom)
}

fn de_opt_i128<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i128>, D::Error> {
    let n = Option::<serde_json::Number>::deserialize(d)?;
    match n {
        None => Ok(None),
        Some(n) => n
            .to_string()
            .parse::<i128>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volumes_decode_beyond_i64() {
        // 100 ETH in 18-decimals smallest units, > i64::MAX
        let raw = r#"{"input": 100000000000000000000, "output": 0}"#;
        let vol: ApiVolume = serde_json::from_str(raw).unwrap();
        assert_eq!(vol.net(), 100_000_000_000_000_000_000i128);
    }

    #[test]
    fn net_prefers_server_balance() {
        let raw = r#"{"input": 10, "output": 3, "balance": 7}"#;
        let vol: ApiVolume = serde_json::from_str(raw).unwrap();
        assert_eq!(vol.net(), 7);

        let raw = r#"{"input": 10, "output": 3}"#;
        let vol: ApiVolume = serde_json::from_str(raw).unwrap();
        assert_eq!(vol.net(), 7);
    }

    #[test]
    fn posting_amount_decodes() {
        let raw = r#"{"amount": 1500000, "asset": "USDC/6", "source": "a", "destination": "b"}"#;
        let posting: ApiPosting = serde_json::from_str(raw).unwrap();
        assert_eq!(posting.amount, 1_500_000);
    }
}
