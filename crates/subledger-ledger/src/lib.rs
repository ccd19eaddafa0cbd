mod error;
mod store;

pub use error::{LedgerError, Result};
pub use store::{
    ConfirmWithdrawalDirectParams, ConversionParams, DepositMeta,
    FailedWithdrawalPlatformParams, LedgerStore, PlatformTransactionParams, StoreAddressParams,
    WalletWithdrawalParams,
};
