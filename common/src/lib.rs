//! SimpleBank Common Types
//!
//! Shared types used across the SimpleBank workspace: row identifiers,
//! supported currencies and the caller-facing error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod error;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
