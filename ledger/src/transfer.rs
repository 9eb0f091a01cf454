//! Transfer records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use simplebank_common::{AccountId, TransferId};

pub const TRANSFER_AMOUNT_POSITIVE: &str = "transfers_amount_positive";

/// An immutable record of money moved between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Positive magnitude moved, in minor units.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl Transfer {
    /// Check if the transfer touches the given account on either side.
    pub fn involves(&self, account_id: AccountId) -> bool {
        self.from_account_id == account_id || self.to_account_id == account_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

/// Lists transfers leaving `from_account_id` or arriving at `to_account_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTransfersParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub limit: i64,
    pub offset: i64,
}

impl ListTransfersParams {
    /// Every transfer touching one account, in either direction.
    pub fn for_account(account_id: AccountId, limit: i64, offset: i64) -> Self {
        Self {
            from_account_id: account_id,
            to_account_id: account_id,
            limit,
            offset,
        }
    }

    pub(crate) fn matches(&self, transfer: &Transfer) -> bool {
        transfer.from_account_id == self.from_account_id
            || transfer.to_account_id == self.to_account_id
    }
}

/// Data-repair path; transfers are never updated by the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTransferParams {
    pub id: TransferId,
    pub amount: i64,
}
