//! Caller-facing error taxonomy.
//!
//! Library errors carry rich detail; API layers only need to know which of a
//! handful of buckets a failure falls into to pick a status and decide whether
//! to retry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a ledger failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A referenced row does not exist.
    NotFound,
    /// The request itself is malformed (same account twice, bad amount).
    InvalidArgument,
    /// A uniqueness, referential or check constraint rejected the write.
    Conflict,
    /// Connection loss, transaction control failure, timeout or cancellation.
    Internal,
}

impl ErrorKind {
    /// Stable code for protocol messages and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Coarse retry hint: only internal failures can succeed unchanged on a
    /// second attempt. The library error has the precise answer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Internal)
    }

    /// Suggested HTTP status for API layers.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidArgument => 400,
            ErrorKind::Conflict => 403,
            ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
