//! Ledger error types.

use std::fmt;
use std::time::Duration;

use simplebank_common::{AccountId, ErrorKind};
use thiserror::Error;

/// Table a missing row was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Account,
    Entry,
    Transfer,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Account => "account",
            Entity::Entry => "entry",
            Entity::Transfer => "transfer",
        })
    }
}

/// Errors that can occur in the ledger store and the transfer engine.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Referenced row does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: i64 },

    /// Source and destination of a transfer are the same account.
    #[error("Cannot transfer from account {0} to itself")]
    SelfTransfer(AccountId),

    /// Transfer amount must be strictly positive.
    #[error("Transfer amount must be positive, got {0}")]
    NonPositiveAmount(i64),

    /// Debit would leave the account with a negative balance.
    #[error("Insufficient funds in account {account_id}")]
    InsufficientFunds { account_id: AccountId },

    /// A balance increment would leave the range of a 64-bit integer.
    #[error("Balance out of range: {0}")]
    Overflow(String),

    /// Unique, foreign key or check constraint rejected a write.
    #[error("Constraint {constraint} violated: {message}")]
    Constraint { constraint: String, message: String },

    /// The database aborted the transaction to break a lock cycle.
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// The database could not serialize the transaction.
    #[error("Serialization failure: {0}")]
    Serialization(String),

    /// Any other driver or connection error.
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// The unit of work did not finish in time and was rolled back.
    #[error("Transaction timed out after {0:?}")]
    Timeout(Duration),

    /// The unit of work failed and the rollback failed as well.
    #[error("Transaction failed: {source}; rollback failed: {rollback}")]
    Rollback {
        source: Box<LedgerError>,
        rollback: Box<LedgerError>,
    },

    /// Failure injected into the in-memory store.
    #[error("Injected fault: {0}")]
    Injected(String),

    /// Embedded schema migrations failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    pub(crate) fn account_not_found(id: AccountId) -> Self {
        LedgerError::NotFound {
            entity: Entity::Account,
            id: id.get(),
        }
    }

    pub(crate) fn constraint(constraint: &str, message: impl Into<String>) -> Self {
        LedgerError::Constraint {
            constraint: constraint.to_string(),
            message: message.into(),
        }
    }

    /// Classify the error for API layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::SelfTransfer(_) | LedgerError::NonPositiveAmount(_) => {
                ErrorKind::InvalidArgument
            }
            LedgerError::InsufficientFunds { .. }
            | LedgerError::Overflow(_)
            | LedgerError::Constraint { .. } => ErrorKind::Conflict,
            LedgerError::Deadlock(_)
            | LedgerError::Serialization(_)
            | LedgerError::Database(_)
            | LedgerError::Timeout(_)
            | LedgerError::Rollback { .. }
            | LedgerError::Injected(_)
            | LedgerError::Migration(_)
            | LedgerError::Config(_) => ErrorKind::Internal,
        }
    }

    /// Check if the caller may retry the whole operation.
    ///
    /// A failed rollback is not retryable: the state of the connection is
    /// unknown and an operator has to look at it. `Timeout` is only raised
    /// before commit starts, after the rollback.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Deadlock(_)
                | LedgerError::Serialization(_)
                | LedgerError::Database(_)
                | LedgerError::Timeout(_)
        )
    }

    /// Name of the violated constraint, if any.
    pub fn constraint_name(&self) -> Option<&str> {
        match self {
            LedgerError::Constraint { constraint, .. } => Some(constraint),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                // unique_violation, foreign_key_violation, check_violation
                Some("23505") | Some("23503") | Some("23514") => {
                    let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                    return LedgerError::Constraint {
                        constraint,
                        message,
                    };
                }
                // numeric_value_out_of_range
                Some("22003") => return LedgerError::Overflow(message),
                Some("40P01") => return LedgerError::Deadlock(message),
                Some("40001") => return LedgerError::Serialization(message),
                _ => {}
            }
        }

        LedgerError::Database(err)
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
