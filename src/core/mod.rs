pub mod goal;
pub mod money;

mod account;
mod connection;
mod txn;

pub use account::{Account, BalanceSnapshot};
pub use connection::{Connection, ConnectionStatus};
pub use txn::{Category, CategoryRef, NewTransaction, PredefinedCategory, Transaction};
