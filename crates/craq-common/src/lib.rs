//! # craq-common
//!
//! Types shared by every component of the craq chain: the versioned item
//! model, the semantic error type, and the result alias.
//!
//! Everything here is serializable so that values and errors can cross the
//! RPC boundary unchanged.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error type and result alias
pub mod error;

/// Core value types
pub mod types;

pub use error::{ChainError, ChainResult};
pub use types::{Item, KeyValue, Version};
