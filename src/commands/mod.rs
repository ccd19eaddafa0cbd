pub mod add_user;
pub mod addresses;
pub mod balances;
pub mod listen;
pub mod setup;
pub mod withdraw;
