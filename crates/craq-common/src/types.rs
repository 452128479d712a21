//! Core value types for the chain.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Version number of an item. The first write of a key is version 0, and
/// every later write increments the highest version seen locally.
pub type Version = u64;

/// One version of one key in storage.
///
/// A key may hold several items at once: at most one committed version plus
/// any newer uncommitted (dirty) versions still travelling down the chain.
/// Committing a version purges every older item for that key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// The key this item belongs to.
    pub key: String,
    /// Version number, strictly increasing per key.
    pub version: Version,
    /// True once the tail has acknowledged this version.
    pub committed: bool,
    /// The stored value.
    pub value: Bytes,
}

impl Item {
    /// Creates a new uncommitted item.
    pub fn dirty(key: impl Into<String>, version: Version, value: Bytes) -> Self {
        Self {
            key: key.into(),
            version,
            committed: false,
            value,
        }
    }

    /// Creates a committed item.
    pub fn committed(key: impl Into<String>, version: Version, value: Bytes) -> Self {
        Self {
            key: key.into(),
            version,
            committed: true,
            value,
        }
    }
}

/// A committed key/value pair, as returned by read operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key.
    pub key: String,
    /// The committed value.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new pair.
    pub fn new(key: impl Into<String>, value: Bytes) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}
