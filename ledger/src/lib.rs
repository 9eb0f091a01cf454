//! SimpleBank ledger.
//!
//! Double-entry ledger over PostgreSQL (or an in-memory store for tests and
//! simulation) with an atomic, deadlock-free transfer operation.

pub mod account;
pub mod balance;
pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod store;
pub mod transfer;

pub use account::{Account, CreateAccountParams, ListAccountsParams, UpdateAccountParams};
pub use balance::{lock_order, AddAccountBalanceParams};
pub use config::LedgerConfig;
pub use engine::{TransferEngine, TransferParams, TransferResult};
pub use error::{Entity, LedgerError, Result};
pub use journal::{CreateEntryParams, Entry, ListEntriesParams, UpdateEntryParams};
pub use store::{
    exec_tx, exec_tx_within, MemoryStore, MemoryTx, PgStore, PgTx, Queries, Store, StoreFault,
    StoreTx,
};
pub use transfer::{CreateTransferParams, ListTransfersParams, Transfer, UpdateTransferParams};
