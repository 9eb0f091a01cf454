//! Account rows and their query parameters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use simplebank_common::{AccountId, Currency};

/// Check constraint keeping every balance at or above zero.
pub const BALANCE_NON_NEGATIVE: &str = "accounts_balance_non_negative";
/// Unique constraint allowing one account per owner and currency.
pub const OWNER_CURRENCY_KEY: &str = "owner_currency_key";

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Username of the owning user.
    pub owner: String,
    /// Balance in minor currency units.
    pub balance: i64,
    /// Account currency.
    pub currency: Currency,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAccountsParams {
    pub owner: String,
    pub limit: i64,
    pub offset: i64,
}

/// Full replace of an account's balance. Data repair only; transfers go
/// through [`crate::Queries::add_account_balance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAccountParams {
    pub id: AccountId,
    pub balance: i64,
}
