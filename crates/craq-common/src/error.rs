//! Semantic errors for chain operations.
//!
//! `ChainError` carries meaning, not transport detail: a `KeyNotFound` from a
//! node three hops away must still be a `KeyNotFound` when it reaches the
//! client. Every variant is serializable so RPC responses can embed the error
//! as data instead of a flattened message string.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by chain, storage, and transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ChainError {
    /// No item exists for the key.
    #[error("key {key:?} does not exist")]
    KeyNotFound {
        /// The missing key.
        key: String,
    },

    /// The newest local version of the key has not been committed yet.
    ///
    /// Carries the newest uncommitted version so the head can continue the
    /// version sequence without a second storage query.
    #[error("key {key:?} has an uncommitted version {version}")]
    Dirty {
        /// The dirty key.
        key: String,
        /// The newest uncommitted version.
        version: u64,
    },

    /// The coordinator has no replicas registered.
    #[error("no nodes in the chain")]
    EmptyChain,

    /// The address is not part of the chain.
    #[error("node {address} is not in the chain")]
    UnknownNode {
        /// The unrecognized address.
        address: String,
    },

    /// A peer was unreachable, or the connection failed mid-call.
    #[error("transport error: {reason}")]
    Transport {
        /// What went wrong.
        reason: String,
    },

    /// The storage backend failed.
    #[error("storage error: {reason}")]
    Storage {
        /// What went wrong.
        reason: String,
    },
}

impl ChainError {
    /// Creates a `KeyNotFound` error.
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound { key: key.into() }
    }

    /// Creates a `Dirty` error.
    pub fn dirty(key: impl Into<String>, version: u64) -> Self {
        Self::Dirty {
            key: key.into(),
            version,
        }
    }

    /// Creates an `UnknownNode` error.
    pub fn unknown_node(address: impl Into<String>) -> Self {
        Self::UnknownNode {
            address: address.into(),
        }
    }

    /// Creates a `Transport` error.
    pub fn transport(reason: impl ToString) -> Self {
        Self::Transport {
            reason: reason.to_string(),
        }
    }

    /// Creates a `Storage` error.
    pub fn storage(reason: impl ToString) -> Self {
        Self::Storage {
            reason: reason.to_string(),
        }
    }

    /// Returns true if this is a `KeyNotFound`.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. })
    }

    /// Returns true if this is a `Dirty`.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        matches!(self, Self::Dirty { .. })
    }

    /// Returns true if this is a `Transport`.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err)
    }
}

/// Result type alias for chain operations.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChainError::key_not_found("user:1");
        assert_eq!(err.to_string(), "key \"user:1\" does not exist");

        let err = ChainError::dirty("user:1", 4);
        assert!(err.to_string().contains("uncommitted version 4"));

        let err = ChainError::unknown_node("10.0.0.1:4001");
        assert!(err.to_string().contains("10.0.0.1:4001"));
    }

    #[test]
    fn test_predicates() {
        assert!(ChainError::key_not_found("k").is_not_found());
        assert!(ChainError::dirty("k", 0).is_dirty());
        assert!(ChainError::transport("boom").is_transport());
        assert!(!ChainError::EmptyChain.is_not_found());
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: ChainError = io_err.into();
        assert!(err.is_transport());
    }
}
