//! Ledger entries for double-entry bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use simplebank_common::{AccountId, EntryId};

/// An immutable ledger line recording one balance delta on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique entry ID.
    pub id: EntryId,
    /// Account affected.
    pub account_id: AccountId,
    /// Signed amount in minor units.
    pub amount: i64,
    /// When this entry was created.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntryParams {
    pub account_id: AccountId,
    pub amount: i64,
}

impl CreateEntryParams {
    /// Entry taking `amount` out of `account_id`.
    pub fn debit(account_id: AccountId, amount: i64) -> Self {
        Self {
            account_id,
            amount: -amount,
        }
    }

    /// Entry putting `amount` into `account_id`.
    pub fn credit(account_id: AccountId, amount: i64) -> Self {
        Self { account_id, amount }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntriesParams {
    pub account_id: AccountId,
    pub limit: i64,
    pub offset: i64,
}

/// Data-repair path; entries are never updated by the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEntryParams {
    pub id: EntryId,
    pub amount: i64,
}

/// Sum of entry amounts. For one transfer's pair of entries this is zero.
pub fn net_amount<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> i64 {
    entries.into_iter().map(|e| e.amount).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(account_id: i64, amount: i64) -> Entry {
        Entry {
            id: EntryId::new(1),
            account_id: AccountId::new(account_id),
            amount,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_debit_credit_params_balance_out() {
        let debit = CreateEntryParams::debit(AccountId::new(1), 30);
        let credit = CreateEntryParams::credit(AccountId::new(2), 30);
        assert_eq!(debit.amount, -30);
        assert_eq!(debit.amount + credit.amount, 0);
    }

    #[test]
    fn test_net_amount() {
        let pair = [entry(1, -30), entry(2, 30)];
        assert_eq!(net_amount(&pair), 0);

        let unbalanced = [entry(1, -30)];
        assert_eq!(net_amount(&unbalanced), -30);
    }
}
