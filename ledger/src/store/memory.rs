//! In-memory ledger store.
//!
//! Behaves like the PostgreSQL store where the transfer engine can tell the
//! difference:
//!
//! - read committed: plain reads see committed rows plus the transaction's own
//!   writes, never another transaction's uncommitted writes;
//! - row locks: updating or locking an account row takes a per-account async
//!   mutex held until commit, rollback or drop, so two transactions that lock
//!   the same rows in opposite order deadlock exactly as they would in the
//!   database;
//! - the same constraint names as the SQL schema.
//!
//! Faults can be injected to exercise the failure paths of callers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use simplebank_common::{AccountId, EntryId, TransferId};

use super::{exec_tx, Queries, Store, StoreTx};
use crate::account::{
    Account, CreateAccountParams, ListAccountsParams, UpdateAccountParams, BALANCE_NON_NEGATIVE,
    OWNER_CURRENCY_KEY,
};
use crate::balance::AddAccountBalanceParams;
use crate::error::{Entity, LedgerError, Result};
use crate::journal::{CreateEntryParams, Entry, ListEntriesParams, UpdateEntryParams};
use crate::transfer::{
    CreateTransferParams, ListTransfersParams, Transfer, UpdateTransferParams,
    TRANSFER_AMOUNT_POSITIVE,
};

const ENTRIES_ACCOUNT_FKEY: &str = "entries_account_id_fkey";
const TRANSFERS_FROM_FKEY: &str = "transfers_from_account_id_fkey";
const TRANSFERS_TO_FKEY: &str = "transfers_to_account_id_fkey";

/// Failures the in-memory store can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// Every balance update on this account fails.
    FailBalanceUpdate(AccountId),
    /// Every commit fails; the transaction's writes are discarded.
    FailCommit,
    /// Every rollback reports failure; the writes are still discarded.
    FailRollback,
    /// Sleep after taking the row lock in every balance update.
    BalanceUpdateLatency(Duration),
    /// Sleep at the start of every commit, with the row locks still held.
    CommitLatency(Duration),
}

#[derive(Debug, Default, Clone)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: DashMap<AccountId, Arc<tokio::sync::Mutex<()>>>,
    faults: Mutex<Vec<StoreFault>>,
    next_account_id: AtomicI64,
    next_entry_id: AtomicI64,
    next_transfer_id: AtomicI64,
}

impl Shared {
    fn has_fault(&self, pred: impl Fn(&StoreFault) -> bool) -> bool {
        self.faults.lock().iter().any(pred)
    }

    fn balance_latency(&self) -> Option<Duration> {
        self.faults.lock().iter().find_map(|f| match f {
            StoreFault::BalanceUpdateLatency(d) => Some(*d),
            _ => None,
        })
    }

    fn commit_latency(&self) -> Option<Duration> {
        self.faults.lock().iter().find_map(|f| match f {
            StoreFault::CommitLatency(d) => Some(*d),
            _ => None,
        })
    }
}

/// Shared in-memory store. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start producing `fault` until [`MemoryStore::clear_faults`].
    pub fn inject_fault(&self, fault: StoreFault) {
        debug!(?fault, "Injecting store fault");
        self.shared.faults.lock().push(fault);
    }

    pub fn clear_faults(&self) {
        self.shared.faults.lock().clear();
    }

    /// Number of committed rows in (accounts, entries, transfers).
    pub fn row_counts(&self) -> (usize, usize, usize) {
        let tables = self.shared.tables.lock();
        (
            tables.accounts.len(),
            tables.entries.len(),
            tables.transfers.len(),
        )
    }
}

/// Writes staged by a transaction; `None` marks a deleted row.
#[derive(Default)]
struct Staged {
    accounts: BTreeMap<AccountId, Option<Account>>,
    entries: BTreeMap<EntryId, Option<Entry>>,
    transfers: BTreeMap<TransferId, Option<Transfer>>,
}

/// Transaction on a [`MemoryStore`].
///
/// Staged writes become visible to others only on commit. Dropping the
/// transaction discards them and releases its row locks.
pub struct MemoryTx {
    shared: Arc<Shared>,
    staged: Staged,
    held: HashMap<AccountId, OwnedMutexGuard<()>>,
}

impl MemoryTx {
    async fn lock_row(&mut self, id: AccountId) {
        if self.held.contains_key(&id) {
            return;
        }
        // Clone out of the map so no shard lock is held across the await.
        let lock = self.shared.row_locks.entry(id).or_default().clone();
        let guard = lock.lock_owned().await;
        self.held.insert(id, guard);
    }

    fn account(&self, id: AccountId) -> Option<Account> {
        match self.staged.accounts.get(&id) {
            Some(row) => row.clone(),
            None => self.shared.tables.lock().accounts.get(&id).cloned(),
        }
    }

    fn entry(&self, id: EntryId) -> Option<Entry> {
        match self.staged.entries.get(&id) {
            Some(row) => row.clone(),
            None => self.shared.tables.lock().entries.get(&id).cloned(),
        }
    }

    fn transfer(&self, id: TransferId) -> Option<Transfer> {
        match self.staged.transfers.get(&id) {
            Some(row) => row.clone(),
            None => self.shared.tables.lock().transfers.get(&id).cloned(),
        }
    }

    fn visible_accounts(&self) -> Vec<Account> {
        let committed = self.shared.tables.lock().accounts.clone();
        merge(committed, &self.staged.accounts)
    }

    fn visible_entries(&self) -> Vec<Entry> {
        let committed = self.shared.tables.lock().entries.clone();
        merge(committed, &self.staged.entries)
    }

    fn visible_transfers(&self) -> Vec<Transfer> {
        let committed = self.shared.tables.lock().transfers.clone();
        merge(committed, &self.staged.transfers)
    }

    fn require_account(&self, id: AccountId, constraint: &str) -> Result<()> {
        if self.account(id).is_none() {
            return Err(LedgerError::constraint(
                constraint,
                format!("account {id} is not present in table \"accounts\""),
            ));
        }
        Ok(())
    }

    fn check_balance(balance: i64) -> Result<i64> {
        if balance < 0 {
            return Err(LedgerError::constraint(
                BALANCE_NON_NEGATIVE,
                "balance must not be negative",
            ));
        }
        Ok(balance)
    }

    fn check_owner_currency(&self, candidate: &Account) -> Result<()> {
        let taken = self.visible_accounts().into_iter().any(|a| {
            a.id != candidate.id && a.owner == candidate.owner && a.currency == candidate.currency
        });
        if taken {
            return Err(LedgerError::constraint(
                OWNER_CURRENCY_KEY,
                format!(
                    "owner {} already has a {} account",
                    candidate.owner, candidate.currency
                ),
            ));
        }
        Ok(())
    }

    fn apply(self) -> Result<()> {
        let Self {
            shared,
            staged,
            held,
        } = self;

        {
            let mut tables = shared.tables.lock();

            // Unique check against rows committed since the insert was staged.
            for account in staged.accounts.values().flatten() {
                let clash = tables.accounts.values().any(|a| {
                    a.id != account.id
                        && a.owner == account.owner
                        && a.currency == account.currency
                        && !matches!(staged.accounts.get(&a.id), Some(None))
                });
                if clash {
                    return Err(LedgerError::constraint(
                        OWNER_CURRENCY_KEY,
                        format!(
                            "owner {} already has a {} account",
                            account.owner, account.currency
                        ),
                    ));
                }
            }

            for (id, row) in staged.accounts {
                match row {
                    Some(account) => tables.accounts.insert(id, account),
                    None => tables.accounts.remove(&id),
                };
            }
            for (id, row) in staged.entries {
                match row {
                    Some(entry) => tables.entries.insert(id, entry),
                    None => tables.entries.remove(&id),
                };
            }
            for (id, row) in staged.transfers {
                match row {
                    Some(transfer) => tables.transfers.insert(id, transfer),
                    None => tables.transfers.remove(&id),
                };
            }
        }

        // Locks go only after the new values are visible.
        drop(held);
        Ok(())
    }
}

fn merge<K: Ord + Copy, V: Clone>(
    mut committed: BTreeMap<K, V>,
    staged: &BTreeMap<K, Option<V>>,
) -> Vec<V> {
    for (id, row) in staged {
        match row {
            Some(v) => {
                committed.insert(*id, v.clone());
            }
            None => {
                committed.remove(id);
            }
        }
    }
    committed.into_values().collect()
}

fn page<T>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    rows.skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

fn next_id(counter: &AtomicI64) -> i64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        Ok(MemoryTx {
            shared: Arc::clone(&self.shared),
            staged: Staged::default(),
            held: HashMap::new(),
        })
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(self) -> Result<()> {
        if let Some(delay) = self.shared.commit_latency() {
            tokio::time::sleep(delay).await;
        }
        if self.shared.has_fault(|f| matches!(f, StoreFault::FailCommit)) {
            return Err(LedgerError::Injected("commit failed".to_string()));
        }
        self.apply()
    }

    async fn rollback(self) -> Result<()> {
        if self.shared.has_fault(|f| matches!(f, StoreFault::FailRollback)) {
            return Err(LedgerError::Injected("rollback failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account> {
        Self::check_balance(arg.balance)?;
        let account = Account {
            id: AccountId::new(next_id(&self.shared.next_account_id)),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.check_owner_currency(&account)?;
        self.staged.accounts.insert(account.id, Some(account.clone()));
        Ok(account)
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account> {
        self.account(id)
            .ok_or_else(|| LedgerError::account_not_found(id))
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
        self.lock_row(id).await;
        self.account(id)
            .ok_or_else(|| LedgerError::account_not_found(id))
    }

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> Result<Vec<Account>> {
        let rows = self
            .visible_accounts()
            .into_iter()
            .filter(|a| a.owner == arg.owner);
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account> {
        self.lock_row(arg.id).await;
        let mut account = self
            .account(arg.id)
            .ok_or_else(|| LedgerError::account_not_found(arg.id))?;
        account.balance = Self::check_balance(arg.balance)?;
        self.staged.accounts.insert(arg.id, Some(account.clone()));
        Ok(account)
    }

    async fn add_account_balance(&mut self, arg: AddAccountBalanceParams) -> Result<Account> {
        if self
            .shared
            .has_fault(|f| *f == StoreFault::FailBalanceUpdate(arg.id))
        {
            return Err(LedgerError::Injected(format!(
                "balance update on account {} failed",
                arg.id
            )));
        }

        self.lock_row(arg.id).await;
        if let Some(delay) = self.shared.balance_latency() {
            tokio::time::sleep(delay).await;
        }

        // Read after the lock so the increment applies to the latest
        // committed balance, as `SET balance = balance + $2` does.
        let mut account = self
            .account(arg.id)
            .ok_or_else(|| LedgerError::account_not_found(arg.id))?;
        let balance = account
            .balance
            .checked_add(arg.amount)
            .ok_or_else(|| LedgerError::Overflow("bigint out of range".to_string()))?;
        account.balance = Self::check_balance(balance)?;
        self.staged.accounts.insert(arg.id, Some(account.clone()));
        Ok(account)
    }

    async fn delete_account(&mut self, id: AccountId) -> Result<()> {
        self.lock_row(id).await;
        if self.account(id).is_none() {
            return Err(LedgerError::account_not_found(id));
        }
        if self.visible_entries().iter().any(|e| e.account_id == id) {
            return Err(LedgerError::constraint(
                ENTRIES_ACCOUNT_FKEY,
                format!("account {id} is still referenced from table \"entries\""),
            ));
        }
        if let Some(t) = self.visible_transfers().iter().find(|t| t.involves(id)) {
            let constraint = if t.from_account_id == id {
                TRANSFERS_FROM_FKEY
            } else {
                TRANSFERS_TO_FKEY
            };
            return Err(LedgerError::constraint(
                constraint,
                format!("account {id} is still referenced from table \"transfers\""),
            ));
        }
        self.staged.accounts.insert(id, None);
        Ok(())
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry> {
        self.require_account(arg.account_id, ENTRIES_ACCOUNT_FKEY)?;
        let entry = Entry {
            id: EntryId::new(next_id(&self.shared.next_entry_id)),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.staged.entries.insert(entry.id, Some(entry.clone()));
        Ok(entry)
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
        self.entry(id).ok_or(LedgerError::NotFound {
            entity: Entity::Entry,
            id: id.get(),
        })
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>> {
        let rows = self
            .visible_entries()
            .into_iter()
            .filter(|e| e.account_id == arg.account_id);
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn update_entry(&mut self, arg: UpdateEntryParams) -> Result<Entry> {
        let mut entry = self.entry(arg.id).ok_or(LedgerError::NotFound {
            entity: Entity::Entry,
            id: arg.id.get(),
        })?;
        entry.amount = arg.amount;
        self.staged.entries.insert(arg.id, Some(entry.clone()));
        Ok(entry)
    }

    async fn delete_entry(&mut self, id: EntryId) -> Result<()> {
        if self.entry(id).is_none() {
            return Err(LedgerError::NotFound {
                entity: Entity::Entry,
                id: id.get(),
            });
        }
        self.staged.entries.insert(id, None);
        Ok(())
    }

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> Result<Transfer> {
        if arg.amount <= 0 {
            return Err(LedgerError::constraint(
                TRANSFER_AMOUNT_POSITIVE,
                "transfer amount must be positive",
            ));
        }
        self.require_account(arg.from_account_id, TRANSFERS_FROM_FKEY)?;
        self.require_account(arg.to_account_id, TRANSFERS_TO_FKEY)?;
        let transfer = Transfer {
            id: TransferId::new(next_id(&self.shared.next_transfer_id)),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.staged.transfers.insert(transfer.id, Some(transfer.clone()));
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer> {
        self.transfer(id).ok_or(LedgerError::NotFound {
            entity: Entity::Transfer,
            id: id.get(),
        })
    }

    async fn list_transfers(&mut self, arg: ListTransfersParams) -> Result<Vec<Transfer>> {
        let rows = self
            .visible_transfers()
            .into_iter()
            .filter(|t| arg.matches(t));
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn update_transfer(&mut self, arg: UpdateTransferParams) -> Result<Transfer> {
        if arg.amount <= 0 {
            return Err(LedgerError::constraint(
                TRANSFER_AMOUNT_POSITIVE,
                "transfer amount must be positive",
            ));
        }
        let mut transfer = self.transfer(arg.id).ok_or(LedgerError::NotFound {
            entity: Entity::Transfer,
            id: arg.id.get(),
        })?;
        transfer.amount = arg.amount;
        self.staged.transfers.insert(arg.id, Some(transfer.clone()));
        Ok(transfer)
    }

    async fn delete_transfer(&mut self, id: TransferId) -> Result<()> {
        if self.transfer(id).is_none() {
            return Err(LedgerError::NotFound {
                entity: Entity::Transfer,
                id: id.get(),
            });
        }
        self.staged.transfers.insert(id, None);
        Ok(())
    }
}

// Outside a transaction every statement autocommits.
#[async_trait]
impl Queries for MemoryStore {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account> {
        exec_tx(&*self, move |q| q.create_account(arg)).await
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account> {
        exec_tx(&*self, move |q| q.get_account(id)).await
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
        exec_tx(&*self, move |q| q.get_account_for_update(id)).await
    }

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> Result<Vec<Account>> {
        exec_tx(&*self, move |q| q.list_accounts(arg)).await
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account> {
        exec_tx(&*self, move |q| q.update_account(arg)).await
    }

    async fn add_account_balance(&mut self, arg: AddAccountBalanceParams) -> Result<Account> {
        exec_tx(&*self, move |q| q.add_account_balance(arg)).await
    }

    async fn delete_account(&mut self, id: AccountId) -> Result<()> {
        exec_tx(&*self, move |q| q.delete_account(id)).await
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry> {
        exec_tx(&*self, move |q| q.create_entry(arg)).await
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
        exec_tx(&*self, move |q| q.get_entry(id)).await
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>> {
        exec_tx(&*self, move |q| q.list_entries(arg)).await
    }

    async fn update_entry(&mut self, arg: UpdateEntryParams) -> Result<Entry> {
        exec_tx(&*self, move |q| q.update_entry(arg)).await
    }

    async fn delete_entry(&mut self, id: EntryId) -> Result<()> {
        exec_tx(&*self, move |q| q.delete_entry(id)).await
    }

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> Result<Transfer> {
        exec_tx(&*self, move |q| q.create_transfer(arg)).await
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer> {
        exec_tx(&*self, move |q| q.get_transfer(id)).await
    }

    async fn list_transfers(&mut self, arg: ListTransfersParams) -> Result<Vec<Transfer>> {
        exec_tx(&*self, move |q| q.list_transfers(arg)).await
    }

    async fn update_transfer(&mut self, arg: UpdateTransferParams) -> Result<Transfer> {
        exec_tx(&*self, move |q| q.update_transfer(arg)).await
    }

    async fn delete_transfer(&mut self, id: TransferId) -> Result<()> {
        exec_tx(&*self, move |q| q.delete_transfer(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simplebank_common::Currency;

    fn params(owner: &str, balance: i64) -> CreateAccountParams {
        CreateAccountParams {
            owner: owner.to_string(),
            balance,
            currency: Currency::Usd,
        }
    }

    #[tokio::test]
    async fn test_account_crud() {
        let mut store = MemoryStore::new();

        let created = store.create_account(params("alice", 100)).await.unwrap();
        assert_eq!(created.balance, 100);
        assert_eq!(store.get_account(created.id).await.unwrap(), created);

        let updated = store
            .update_account(UpdateAccountParams {
                id: created.id,
                balance: 250,
            })
            .await
            .unwrap();
        assert_eq!(updated.balance, 250);
        assert_eq!(updated.created_at, created.created_at);

        store.delete_account(created.id).await.unwrap();
        let err = store.get_account(created.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: Entity::Account, .. }));
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let mut store = MemoryStore::new();
        let a = store.create_account(params("a", 0)).await.unwrap();
        let b = store.create_account(params("b", 0)).await.unwrap();
        assert!(a.id < b.id);
    }

    #[tokio::test]
    async fn test_owner_currency_is_unique() {
        let mut store = MemoryStore::new();
        store.create_account(params("alice", 0)).await.unwrap();

        let err = store.create_account(params("alice", 0)).await.unwrap_err();
        assert_eq!(err.constraint_name(), Some(OWNER_CURRENCY_KEY));

        let mut eur = params("alice", 0);
        eur.currency = Currency::Eur;
        assert!(store.create_account(eur).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_accounts_pages_by_owner() {
        let mut store = MemoryStore::new();
        for currency in Currency::ALL {
            let mut p = params("alice", 0);
            p.currency = currency;
            store.create_account(p).await.unwrap();
        }
        store.create_account(params("bob", 0)).await.unwrap();

        let page = store
            .list_accounts(ListAccountsParams {
                owner: "alice".to_string(),
                limit: 2,
                offset: 1,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|a| a.owner == "alice"));
    }

    #[tokio::test]
    async fn test_balance_cannot_go_negative() {
        let mut store = MemoryStore::new();
        let account = store.create_account(params("alice", 10)).await.unwrap();

        let err = store
            .add_account_balance(AddAccountBalanceParams::new(account.id, -11))
            .await
            .unwrap_err();
        assert_eq!(err.constraint_name(), Some(BALANCE_NON_NEGATIVE));
        assert_eq!(store.get_account(account.id).await.unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_balance_overflow_is_not_a_constraint_violation() {
        let mut store = MemoryStore::new();
        let account = store.create_account(params("alice", i64::MAX - 1)).await.unwrap();

        let err = store
            .add_account_balance(AddAccountBalanceParams::new(account.id, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Overflow(_)));
        assert_eq!(err.constraint_name(), None);
        assert!(!err.is_retryable());
        assert_eq!(store.get_account(account.id).await.unwrap().balance, i64::MAX - 1);
    }

    #[tokio::test]
    async fn test_add_balance_on_missing_account() {
        let mut store = MemoryStore::new();
        let err = store
            .add_account_balance(AddAccountBalanceParams::new(AccountId::new(42), 5))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { id: 42, .. }));
    }

    #[tokio::test]
    async fn test_referenced_account_cannot_be_deleted() {
        let mut store = MemoryStore::new();
        let account = store.create_account(params("alice", 10)).await.unwrap();
        store
            .create_entry(CreateEntryParams::credit(account.id, 10))
            .await
            .unwrap();

        let err = store.delete_account(account.id).await.unwrap_err();
        assert_eq!(err.constraint_name(), Some(ENTRIES_ACCOUNT_FKEY));
    }

    #[tokio::test]
    async fn test_entry_requires_existing_account() {
        let mut store = MemoryStore::new();
        let err = store
            .create_entry(CreateEntryParams::credit(AccountId::new(7), 10))
            .await
            .unwrap_err();
        assert_eq!(err.constraint_name(), Some(ENTRIES_ACCOUNT_FKEY));
    }

    #[tokio::test]
    async fn test_entry_and_transfer_crud() {
        let mut store = MemoryStore::new();
        let a = store.create_account(params("a", 100)).await.unwrap();
        let b = store.create_account(params("b", 100)).await.unwrap();

        let entry = store
            .create_entry(CreateEntryParams::debit(a.id, 10))
            .await
            .unwrap();
        assert_eq!(store.get_entry(entry.id).await.unwrap().amount, -10);
        let entry = store
            .update_entry(UpdateEntryParams {
                id: entry.id,
                amount: -12,
            })
            .await
            .unwrap();
        assert_eq!(entry.amount, -12);
        store.delete_entry(entry.id).await.unwrap();
        assert!(store.get_entry(entry.id).await.is_err());

        let transfer = store
            .create_transfer(CreateTransferParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 10,
            })
            .await
            .unwrap();
        let listed = store
            .list_transfers(ListTransfersParams::for_account(b.id, 5, 0))
            .await
            .unwrap();
        assert_eq!(listed, vec![transfer.clone()]);

        let err = store
            .update_transfer(UpdateTransferParams {
                id: transfer.id,
                amount: 0,
            })
            .await
            .unwrap_err();
        assert_eq!(err.constraint_name(), Some(TRANSFER_AMOUNT_POSITIVE));

        store.delete_transfer(transfer.id).await.unwrap();
        assert!(store.get_transfer(transfer.id).await.is_err());
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let mut store = MemoryStore::new();
        let account = store.create_account(params("alice", 100)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let inside = tx
            .add_account_balance(AddAccountBalanceParams::new(account.id, 50))
            .await
            .unwrap();
        assert_eq!(inside.balance, 150);
        assert_eq!(tx.get_account(account.id).await.unwrap().balance, 150);
        assert_eq!(store.get_account(account.id).await.unwrap().balance, 100);

        tx.rollback().await.unwrap();
        assert_eq!(store.get_account(account.id).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back_and_unlocks() {
        let mut store = MemoryStore::new();
        let account = store.create_account(params("alice", 100)).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.add_account_balance(AddAccountBalanceParams::new(account.id, 50))
                .await
                .unwrap();
        }

        let updated = tokio::time::timeout(
            Duration::from_secs(1),
            store.add_account_balance(AddAccountBalanceParams::new(account.id, 1)),
        )
        .await
        .expect("row lock released on drop")
        .unwrap();
        assert_eq!(updated.balance, 101);
    }

    #[tokio::test]
    async fn test_row_lock_blocks_until_commit() {
        let mut store = MemoryStore::new();
        let account = store.create_account(params("alice", 100)).await.unwrap();
        let id = account.id;

        let mut holder = store.begin().await.unwrap();
        holder
            .add_account_balance(AddAccountBalanceParams::new(id, 10))
            .await
            .unwrap();

        let mut waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            waiter_store
                .add_account_balance(AddAccountBalanceParams::new(id, 5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        holder.commit().await.unwrap();
        let after = waiter.await.unwrap().unwrap();
        // The waiter saw the committed +10 before adding its own +5.
        assert_eq!(after.balance, 115);
    }

    #[tokio::test]
    async fn test_plain_reads_do_not_block_on_row_locks() {
        let mut store = MemoryStore::new();
        let account = store.create_account(params("alice", 100)).await.unwrap();

        let mut holder = store.begin().await.unwrap();
        holder.get_account_for_update(account.id).await.unwrap();

        let read = tokio::time::timeout(Duration::from_millis(200), store.get_account(account.id))
            .await
            .expect("plain read is not blocked")
            .unwrap();
        assert_eq!(read.balance, 100);

        holder.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_row_counts_track_commits_only() {
        let mut store = MemoryStore::new();
        let account = store.create_account(params("alice", 100)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.create_entry(CreateEntryParams::credit(account.id, 1))
            .await
            .unwrap();
        assert_eq!(store.row_counts(), (1, 0, 0));

        tx.commit().await.unwrap();
        assert_eq!(store.row_counts(), (1, 1, 0));
    }
}
