use std::env;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Which Ledger Store backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Single-writer relational store (SQLite file).
    #[default]
    Sqlite,
    /// Remote double-entry ledger.
    Formance,
}

/// Complete application configuration, loaded from environment variables.
/// A `.env` file is honored when present (loaded by the binary before this
/// runs).
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    pub database: DatabaseConfig,
    pub formance: FormanceConfig,
    pub reconciler: ReconcilerConfig,
}

/// Relational backend settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Duration,
    pub conn_max_idle_time: Duration,
    pub ping_timeout: Duration,
    pub create_dummy_users: bool,
}

/// Double-entry backend settings.
#[derive(Debug, Clone)]
pub struct FormanceConfig {
    pub stack_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub ledger: String,
}

/// Polling reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub lookback_window: Duration,
    pub polling_interval: Duration,
    pub cleanup_interval: Duration,
    pub assets_file: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let backend = match env_string("BACKEND_TYPE", "sqlite").to_lowercase().as_str() {
            "formance" | "double-entry" => BackendKind::Formance,
            _ => BackendKind::Sqlite,
        };

        Ok(Self {
            backend,
            database: DatabaseConfig {
                path: env_string("DATABASE_PATH", "subledger.db"),
                max_open_conns: env_u32("DB_MAX_OPEN_CONNS", 25),
                max_idle_conns: env_u32("DB_MAX_IDLE_CONNS", 5),
                conn_max_lifetime: env_duration("DB_CONN_MAX_LIFETIME", Duration::from_secs(300))?,
                conn_max_idle_time: env_duration("DB_CONN_MAX_IDLE_TIME", Duration::from_secs(30))?,
                ping_timeout: env_duration("DB_PING_TIMEOUT", Duration::from_secs(5))?,
                create_dummy_users: env_bool("CREATE_DUMMY_USERS", false),
            },
            formance: FormanceConfig {
                stack_url: env_string("FORMANCE_STACK_URL", ""),
                client_id: env_string("FORMANCE_CLIENT_ID", ""),
                client_secret: env_string("FORMANCE_CLIENT_SECRET", ""),
                ledger: env_string("FORMANCE_LEDGER", "prime-subledger"),
            },
            reconciler: ReconcilerConfig {
                lookback_window: env_duration("RECON_LOOKBACK_WINDOW", Duration::from_secs(6 * 3600))?,
                polling_interval: env_duration("RECON_POLLING_INTERVAL", Duration::from_secs(30))?,
                cleanup_interval: env_duration("RECON_CLEANUP_INTERVAL", Duration::from_secs(15 * 60))?,
                assets_file: env_string("ASSETS_FILE", "assets.yaml"),
            },
        })
    }
}

/// Exchange API credentials. Required only for commands that talk to the
/// Exchange, so they are loaded separately from `Config`.
#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub access_key: String,
    pub passphrase: String,
    pub signing_key: String,
}

impl ExchangeCredentials {
    pub fn load() -> Result<Self> {
        Ok(Self {
            access_key: env_required("PRIME_ACCESS_KEY")?,
            passphrase: env_required("PRIME_PASSPHRASE")?,
            signing_key: env_required("PRIME_SIGNING_KEY")?,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_required(key: &'static str) -> Result<String> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(CoreError::MissingEnvVar(key)),
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &'static str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => {
            parse_duration(&v).ok_or(CoreError::InvalidDuration { key, value: v })
        }
        _ => Ok(default),
    }
}

/// Parses durations of the form `500ms`, `30s`, `15m`, `6h`, `1d`, or a bare
/// number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };

    let n: f64 = number.parse().ok()?;
    if n < 0.0 {
        return None;
    }

    let millis = match unit {
        "ms" => n,
        "s" => n * 1_000.0,
        "m" => n * 60_000.0,
        "h" => n * 3_600_000.0,
        "d" => n * 86_400_000.0,
        _ => return None,
    };
    Some(Duration::from_millis(millis as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("6h"), Some(Duration::from_secs(21_600)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2d"), Some(Duration::from_secs(172_800)));
        // bare seconds
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        // fractional
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("10y"), None);
    }
}
