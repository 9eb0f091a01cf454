//! Identifier types for ledger rows.
//!
//! Every row is keyed by a database-assigned `BIGSERIAL`, so the identifiers
//! are thin newtypes over `i64`. Keeping them distinct stops an entry id from
//! being passed where an account id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw database id.
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the raw database id.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

row_id! {
    /// Identifier of an account.
    ///
    /// The ordering of account ids is the global lock order used when a
    /// transaction touches more than one account row.
    AccountId
}

row_id! {
    /// Identifier of a ledger entry.
    EntryId
}

row_id! {
    /// Identifier of a transfer record.
    TransferId
}
