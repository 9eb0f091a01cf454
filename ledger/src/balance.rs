//! Balance updates and the account lock order.

use serde::{Deserialize, Serialize};

use simplebank_common::AccountId;

/// Signed delta applied to one account with a single atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAccountBalanceParams {
    pub id: AccountId,
    /// Added to the stored balance; negative for debits.
    pub amount: i64,
}

impl AddAccountBalanceParams {
    pub fn new(id: AccountId, amount: i64) -> Self {
        Self { id, amount }
    }
}

/// Order two balance updates by ascending account id.
///
/// Every transaction that updates two accounts must issue its updates in this
/// order. Row locks are then always requested lowest id first, so no two
/// transfers can wait on each other in a cycle.
pub fn lock_order(
    a: AddAccountBalanceParams,
    b: AddAccountBalanceParams,
) -> [AddAccountBalanceParams; 2] {
    if a.id <= b.id {
        [a, b]
    } else {
        [b, a]
    }
}
