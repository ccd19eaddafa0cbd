pub mod assets;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod types;

pub use config::{
    BackendKind, Config, DatabaseConfig, ExchangeCredentials, FormanceConfig, ReconcilerConfig,
};
pub use error::{CoreError, Result};
