//! Transfer engine.
//!
//! A transfer is one unit of work: the transfer record, a debit entry, a
//! credit entry and two balance increments, committed together or not at all.
//! Balance increments are issued in ascending account id order, so concurrent
//! transfers between the same accounts in opposite directions queue on the
//! same row lock first instead of deadlocking.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use simplebank_common::AccountId;

use crate::account::{Account, BALANCE_NON_NEGATIVE};
use crate::balance::{lock_order, AddAccountBalanceParams};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::journal::{CreateEntryParams, Entry};
use crate::store::{exec_tx_within, Queries, Store};
use crate::transfer::{CreateTransferParams, Transfer};

/// Request to move `amount` minor units between two accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

impl TransferParams {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.from_account_id == self.to_account_id {
            return Err(LedgerError::SelfTransfer(self.from_account_id));
        }
        if self.amount <= 0 {
            return Err(LedgerError::NonPositiveAmount(self.amount));
        }
        Ok(())
    }
}

/// Everything a committed transfer produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    /// Source account after the debit.
    pub from_account: Account,
    /// Destination account after the credit.
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Executes transfers against an injected store.
#[derive(Debug, Clone)]
pub struct TransferEngine<S> {
    store: S,
    config: LedgerConfig,
}

impl<S: Store> TransferEngine<S> {
    pub fn new(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// The underlying store, for plain reads outside a transfer.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Move money between two accounts atomically.
    ///
    /// Fails with `SelfTransfer` or `NonPositiveAmount` before touching the
    /// store, `NotFound` if either account is missing, `InsufficientFunds` if
    /// the debit would leave the source negative, `Overflow` if the credit would
    /// not fit the destination balance, and `Timeout` if its statements
    /// do not finish within the configured bound. A timed-out transfer is
    /// rolled back; once the statements finish, the commit is never cut short.
    /// Nothing is written unless the whole transfer commits.
    #[instrument(
        skip(self),
        fields(
            from = %params.from_account_id,
            to = %params.to_account_id,
            amount = params.amount
        )
    )]
    pub async fn transfer(&self, params: TransferParams) -> Result<TransferResult> {
        params.validate()?;

        let limit = self.config.transfer_timeout;
        let outcome =
            exec_tx_within(&self.store, limit, move |q| Box::pin(transfer_tx(q, params))).await;

        match &outcome {
            Ok(result) => info!(
                transfer_id = %result.transfer.id,
                from_balance = result.from_account.balance,
                to_balance = result.to_account.balance,
                "Transfer committed"
            ),
            Err(err) => warn!(error = %err, kind = %err.kind(), "Transfer failed"),
        }

        outcome
    }
}

async fn transfer_tx<Q: Queries>(q: &mut Q, params: TransferParams) -> Result<TransferResult> {
    let TransferParams {
        from_account_id,
        to_account_id,
        amount,
    } = params;

    // Plain reads; no row lock until the balance updates.
    q.get_account(from_account_id).await?;
    q.get_account(to_account_id).await?;

    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id,
            to_account_id,
            amount,
        })
        .await?;
    let from_entry = q
        .create_entry(CreateEntryParams::debit(from_account_id, amount))
        .await?;
    let to_entry = q
        .create_entry(CreateEntryParams::credit(to_account_id, amount))
        .await?;

    let [first, second] = lock_order(
        AddAccountBalanceParams::new(from_account_id, -amount),
        AddAccountBalanceParams::new(to_account_id, amount),
    );
    let first = add_balance(q, first, from_account_id).await?;
    let second = add_balance(q, second, from_account_id).await?;
    let (from_account, to_account) = if first.id == from_account_id {
        (first, second)
    } else {
        (second, first)
    };

    Ok(TransferResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

/// Apply one balance update, reporting a negative source balance as
/// insufficient funds.
async fn add_balance<Q: Queries>(
    q: &mut Q,
    update: AddAccountBalanceParams,
    from_account_id: AccountId,
) -> Result<Account> {
    q.add_account_balance(update).await.map_err(|err| {
        if update.id == from_account_id && err.constraint_name() == Some(BALANCE_NON_NEGATIVE) {
            LedgerError::InsufficientFunds {
                account_id: from_account_id,
            }
        } else {
            err
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use proptest::prelude::*;
    use simplebank_common::{Currency, ErrorKind};

    use crate::account::CreateAccountParams;
    use crate::journal::ListEntriesParams;
    use crate::store::{MemoryStore, StoreFault};
    use crate::transfer::ListTransfersParams;

    fn engine(store: &MemoryStore) -> TransferEngine<MemoryStore> {
        TransferEngine::new(store.clone(), LedgerConfig::default())
    }

    async fn open(store: &mut MemoryStore, owner: &str, balance: i64) -> Account {
        store
            .create_account(CreateAccountParams {
                owner: owner.to_string(),
                balance,
                currency: Currency::Usd,
            })
            .await
            .unwrap()
    }

    async fn balance(store: &mut MemoryStore, id: AccountId) -> i64 {
        store.get_account(id).await.unwrap().balance
    }

    async fn entries(store: &mut MemoryStore, id: AccountId) -> Vec<Entry> {
        store
            .list_entries(ListEntriesParams {
                account_id: id,
                limit: 1000,
                offset: 0,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transfer_moves_money_and_records_entries() {
        let mut store = MemoryStore::new();
        let a = open(&mut store, "alice", 100).await;
        let b = open(&mut store, "bob", 50).await;

        let result = engine(&store)
            .transfer(TransferParams::new(a.id, b.id, 30))
            .await
            .unwrap();

        assert_eq!(result.transfer.from_account_id, a.id);
        assert_eq!(result.transfer.to_account_id, b.id);
        assert_eq!(result.transfer.amount, 30);
        assert_eq!(result.from_account.balance, 70);
        assert_eq!(result.to_account.balance, 80);
        assert_eq!(result.from_entry.account_id, a.id);
        assert_eq!(result.from_entry.amount, -30);
        assert_eq!(result.to_entry.account_id, b.id);
        assert_eq!(result.to_entry.amount, 30);

        // Read-after-write through the plain store handle.
        assert_eq!(balance(&mut store, a.id).await, 70);
        assert_eq!(balance(&mut store, b.id).await, 80);
        assert_eq!(store.get_transfer(result.transfer.id).await.unwrap(), result.transfer);
        assert_eq!(entries(&mut store, a.id).await, vec![result.from_entry]);
        assert_eq!(entries(&mut store, b.id).await, vec![result.to_entry]);
    }

    #[tokio::test]
    async fn test_transfer_from_higher_id_updates_in_ascending_order() {
        let mut store = MemoryStore::new();
        let low = open(&mut store, "low", 0).await;
        let high = open(&mut store, "high", 40).await;

        let result = engine(&store)
            .transfer(TransferParams::new(high.id, low.id, 40))
            .await
            .unwrap();

        assert_eq!(result.from_account.id, high.id);
        assert_eq!(result.from_account.balance, 0);
        assert_eq!(result.to_account.balance, 40);
    }

    #[tokio::test]
    async fn test_self_transfer_rejected() {
        let mut store = MemoryStore::new();
        let a = open(&mut store, "alice", 100).await;

        let err = engine(&store)
            .transfer(TransferParams::new(a.id, a.id, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::SelfTransfer(id) if id == a.id));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(store.row_counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let mut store = MemoryStore::new();
        let a = open(&mut store, "alice", 100).await;
        let b = open(&mut store, "bob", 0).await;
        let engine = engine(&store);

        for amount in [0, -5] {
            let err = engine
                .transfer(TransferParams::new(a.id, b.id, amount))
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::NonPositiveAmount(n) if n == amount));
        }
        assert_eq!(store.row_counts(), (2, 0, 0));
    }

    #[tokio::test]
    async fn test_missing_account_is_not_found() {
        let mut store = MemoryStore::new();
        let a = open(&mut store, "alice", 100).await;
        let ghost = AccountId::new(a.id.get() + 100);

        let err = engine(&store)
            .transfer(TransferParams::new(a.id, ghost, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::NotFound { id, .. } if id == ghost.get()));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(balance(&mut store, a.id).await, 100);
        assert_eq!(store.row_counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace() {
        let mut store = MemoryStore::new();
        let a = open(&mut store, "alice", 20).await;
        let b = open(&mut store, "bob", 0).await;

        let err = engine(&store)
            .transfer(TransferParams::new(a.id, b.id, 21))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { account_id } if account_id == a.id));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(balance(&mut store, a.id).await, 20);
        assert_eq!(balance(&mut store, b.id).await, 0);
        assert_eq!(store.row_counts(), (2, 0, 0));
    }

    #[tokio::test]
    async fn test_credit_overflow_leaves_no_trace() {
        let mut store = MemoryStore::new();
        let a = open(&mut store, "alice", 100).await;
        let b = open(&mut store, "bob", i64::MAX - 5).await;

        let err = engine(&store)
            .transfer(TransferParams::new(a.id, b.id, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Overflow(_)));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
        assert_eq!(balance(&mut store, a.id).await, 100);
        assert_eq!(balance(&mut store, b.id).await, i64::MAX - 5);
        assert_eq!(store.row_counts(), (2, 0, 0));
    }

    #[tokio::test]
    async fn test_failed_credit_rolls_back_whole_transfer() {
        let mut store = MemoryStore::new();
        let a = open(&mut store, "alice", 100).await;
        let b = open(&mut store, "bob", 50).await;
        store.inject_fault(StoreFault::FailBalanceUpdate(b.id));

        let err = engine(&store)
            .transfer(TransferParams::new(a.id, b.id, 30))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Injected(_)));

        store.clear_faults();
        assert_eq!(balance(&mut store, a.id).await, 100);
        assert_eq!(balance(&mut store, b.id).await, 50);
        assert!(entries(&mut store, a.id).await.is_empty());
        assert!(entries(&mut store, b.id).await.is_empty());
        let transfers = store
            .list_transfers(ListTransfersParams::for_account(a.id, 10, 0))
            .await
            .unwrap();
        assert!(transfers.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_rolls_back_and_releases_locks() {
        let mut store = MemoryStore::new();
        let a = open(&mut store, "alice", 100).await;
        let b = open(&mut store, "bob", 0).await;
        store.inject_fault(StoreFault::BalanceUpdateLatency(Duration::from_millis(200)));

        let config = LedgerConfig {
            transfer_timeout: Duration::from_millis(50),
            ..LedgerConfig::default()
        };
        let slow = TransferEngine::new(store.clone(), config);

        let err = slow
            .transfer(TransferParams::new(a.id, b.id, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Timeout(_)));
        assert!(err.is_retryable());

        store.clear_faults();
        assert_eq!(store.row_counts(), (2, 0, 0));
        let result = engine(&store)
            .transfer(TransferParams::new(a.id, b.id, 10))
            .await
            .unwrap();
        assert_eq!(result.from_account.balance, 90);
    }

    #[tokio::test]
    async fn test_slow_commit_is_not_reported_as_timeout() {
        let mut store = MemoryStore::new();
        let a = open(&mut store, "alice", 100).await;
        let b = open(&mut store, "bob", 0).await;
        store.inject_fault(StoreFault::CommitLatency(Duration::from_millis(150)));

        let config = LedgerConfig {
            transfer_timeout: Duration::from_millis(30),
            ..LedgerConfig::default()
        };
        let result = TransferEngine::new(store.clone(), config)
            .transfer(TransferParams::new(a.id, b.id, 10))
            .await
            .unwrap();
        assert_eq!(result.from_account.balance, 90);

        store.clear_faults();
        assert_eq!(balance(&mut store, a.id).await, 90);
        assert_eq!(balance(&mut store, b.id).await, 10);
        assert_eq!(store.row_counts(), (2, 2, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposite_transfers_do_not_deadlock() {
        let mut store = MemoryStore::new();
        let x = open(&mut store, "x", 1_000).await;
        let y = open(&mut store, "y", 1_000).await;
        // Widen the window between the two balance updates.
        store.inject_fault(StoreFault::BalanceUpdateLatency(Duration::from_millis(5)));
        let engine = engine(&store);

        let mut handles = Vec::new();
        for i in 0..20 {
            let engine = engine.clone();
            let (from, to) = if i % 2 == 0 { (x.id, y.id) } else { (y.id, x.id) };
            handles.push(tokio::spawn(async move {
                engine.transfer(TransferParams::new(from, to, 10)).await
            }));
        }

        let all = futures::future::join_all(handles);
        let results = tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("transfers finished without deadlock");
        for result in results {
            result.unwrap().unwrap();
        }

        store.clear_faults();
        assert_eq!(balance(&mut store, x.id).await, 1_000);
        assert_eq!(balance(&mut store, y.id).await, 1_000);
        assert_eq!(entries(&mut store, x.id).await.len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_in_loses_no_updates() {
        let mut store = MemoryStore::new();
        let sink = open(&mut store, "sink", 0).await;
        let mut sources = Vec::new();
        for i in 0..16 {
            sources.push(open(&mut store, &format!("source-{i}"), 100).await);
        }
        let engine = engine(&store);
        let to = sink.id;

        let handles: Vec<_> = sources
            .iter()
            .map(|source| {
                let engine = engine.clone();
                let from = source.id;
                tokio::spawn(async move {
                    for _ in 0..5 {
                        engine
                            .transfer(TransferParams::new(from, to, 7))
                            .await?;
                    }
                    Ok::<_, LedgerError>(())
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(balance(&mut store, sink.id).await, 16 * 5 * 7);
        for source in &sources {
            assert_eq!(balance(&mut store, source.id).await, 100 - 5 * 7);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_never_overdraw() {
        let mut store = MemoryStore::new();
        let a = open(&mut store, "alice", 50).await;
        let b = open(&mut store, "bob", 0).await;
        let engine = engine(&store);
        let params = TransferParams::new(a.id, b.id, 10);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.transfer(params).await })
            })
            .collect();

        let mut committed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => committed += 1,
                Err(LedgerError::InsufficientFunds { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(committed, 5);
        assert_eq!(balance(&mut store, a.id).await, 0);
        assert_eq!(balance(&mut store, b.id).await, 50);
    }

    #[test]
    fn test_transfer_result_serializes() {
        let mut store = MemoryStore::new();
        let result = tokio_test::block_on(async {
            let a = open(&mut store, "alice", 10).await;
            let b = open(&mut store, "bob", 0).await;
            engine(&store)
                .transfer(TransferParams::new(a.id, b.id, 10))
                .await
                .unwrap()
        });

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["transfer"]["amount"], 10);
        assert_eq!(json["from_account"]["currency"], "USD");
        assert_eq!(json["from_entry"]["amount"], -10);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_transfers_conserve_total_balance(
            initial in proptest::collection::vec(0i64..500, 2..5),
            moves in proptest::collection::vec((0usize..5, 0usize..5, -10i64..200), 1..30),
        ) {
            let (total, balances) = tokio_test::block_on(async {
                let mut store = MemoryStore::new();
                let mut ids = Vec::new();
                for (i, balance) in initial.iter().enumerate() {
                    ids.push(open(&mut store, &format!("owner-{i}"), *balance).await.id);
                }
                let engine = engine(&store);

                for (from, to, amount) in &moves {
                    let from = ids[from % ids.len()];
                    let to = ids[to % ids.len()];
                    // Rejections are fine; only committed transfers move money.
                    let _ = engine.transfer(TransferParams::new(from, to, *amount)).await;
                }

                let mut balances = Vec::new();
                for id in &ids {
                    let account = store.get_account(*id).await.unwrap();
                    let net: i64 = entries(&mut store, *id).await.iter().map(|e| e.amount).sum();
                    balances.push((account.balance, net));
                }
                (initial.iter().sum::<i64>(), balances)
            });

            prop_assert_eq!(balances.iter().map(|(b, _)| b).sum::<i64>(), total);
            for ((balance, net), start) in balances.iter().zip(&initial) {
                prop_assert!(*balance >= 0);
                prop_assert_eq!(*balance, start + net);
            }
        }
    }
}
