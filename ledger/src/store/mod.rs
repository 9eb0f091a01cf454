//! Ledger store: queries, transactions and the unit-of-work wrapper.
//!
//! A backend provides two handles with the same [`Queries`] method set: the
//! store itself, where every statement autocommits, and a transaction-scoped
//! handle obtained from [`Store::begin`], where every statement joins one
//! database transaction until [`StoreTx::commit`] or [`StoreTx::rollback`].

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use simplebank_common::{AccountId, EntryId, TransferId};

use crate::account::{Account, CreateAccountParams, ListAccountsParams, UpdateAccountParams};
use crate::balance::AddAccountBalanceParams;
use crate::error::{LedgerError, Result};
use crate::journal::{CreateEntryParams, Entry, ListEntriesParams, UpdateEntryParams};
use crate::transfer::{
    CreateTransferParams, ListTransfersParams, Transfer, UpdateTransferParams,
};

pub use memory::{MemoryStore, MemoryTx, StoreFault};
pub use postgres::{PgStore, PgTx};

/// CRUD over accounts, entries and transfers.
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account>;

    async fn get_account(&mut self, id: AccountId) -> Result<Account>;

    /// Read an account and hold its row lock until the transaction ends.
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account>;

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> Result<Vec<Account>>;

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account>;

    /// Add a signed delta to one balance in a single statement and return
    /// the updated row. Takes the row lock.
    async fn add_account_balance(&mut self, arg: AddAccountBalanceParams) -> Result<Account>;

    async fn delete_account(&mut self, id: AccountId) -> Result<()>;

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry>;

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry>;

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>>;

    async fn update_entry(&mut self, arg: UpdateEntryParams) -> Result<Entry>;

    async fn delete_entry(&mut self, id: EntryId) -> Result<()>;

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> Result<Transfer>;

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer>;

    async fn list_transfers(&mut self, arg: ListTransfersParams) -> Result<Vec<Transfer>>;

    async fn update_transfer(&mut self, arg: UpdateTransferParams) -> Result<Transfer>;

    async fn delete_transfer(&mut self, id: TransferId) -> Result<()>;
}

/// Transaction-scoped query handle.
#[async_trait]
pub trait StoreTx: Queries + Sized {
    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// A store that can open transactions. Cloning shares the underlying pool.
#[async_trait]
pub trait Store: Queries + Clone + Send + Sync + 'static {
    type Tx: StoreTx + 'static;

    async fn begin(&self) -> Result<Self::Tx>;
}

/// Run `work` inside one database transaction.
///
/// Commits when `work` succeeds. When it fails the transaction is rolled back
/// and the original error is returned; if the rollback fails too, both errors
/// are returned together as [`LedgerError::Rollback`].
pub async fn exec_tx<S, T, F>(store: &S, work: F) -> Result<T>
where
    S: Store,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T>> + Send,
{
    let mut tx = store.begin().await?;
    debug!("Transaction started");

    let outcome = work(&mut tx).await;
    finish(tx, outcome).await
}

/// Like [`exec_tx`], but `work` must finish within `limit`.
///
/// Only the statements are timed. When the limit passes the transaction is
/// rolled back and [`LedgerError::Timeout`] is returned, so a timeout always
/// means nothing was written. Commit and rollback run to completion once
/// started.
pub async fn exec_tx_within<S, T, F>(store: &S, limit: Duration, work: F) -> Result<T>
where
    S: Store,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T>> + Send,
{
    let mut tx = store.begin().await?;
    debug!("Transaction started");

    let timed = tokio::time::timeout(limit, work(&mut tx)).await;
    let outcome = timed.unwrap_or(Err(LedgerError::Timeout(limit)));
    finish(tx, outcome).await
}

async fn finish<X: StoreTx, T: Send>(tx: X, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            debug!("Transaction committed");
            Ok(value)
        }
        Err(err) => match tx.rollback().await {
            Ok(()) => {
                debug!(error = %err, "Transaction rolled back");
                Err(err)
            }
            Err(rb_err) => {
                warn!(error = %err, rollback_error = %rb_err, "Rollback failed");
                Err(LedgerError::Rollback {
                    source: Box::new(err),
                    rollback: Box::new(rb_err),
                })
            }
        },
    }
}
