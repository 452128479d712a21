//! # craq-store
//!
//! Versioned key/value storage for chain nodes.
//!
//! A store keeps every live version of a key: at most one committed item and
//! any newer dirty items still working their way to the tail. Committing a
//! version purges everything older, so the presence of more than one item for
//! a key implies the newest one is dirty.
//!
//! Two backends implement the [`Storer`] contract:
//!
//! - [`MemoryStore`]: in-memory, for tests and throwaway chains.
//! - [`FileStore`]: an append-only checksummed log replayed on open.
//!
//! Both are safe to call from concurrent tasks.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod file;
mod memory;

#[cfg(test)]
pub(crate) mod contract;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use craq_common::{ChainResult, Item, Version};

/// The storage contract chain nodes are written against.
///
/// Callers are responsible for version monotonicity; the store only records
/// what it is told. `commit` is the one operation with structural side
/// effects: it purges every version of the key older than the one committed.
#[async_trait]
pub trait Storer: Send + Sync {
    /// Reads the latest item for `key`.
    ///
    /// Succeeds only when the latest version is committed. Returns
    /// `KeyNotFound` for an unknown key, and `Dirty` (carrying the newest
    /// uncommitted version) when an uncommitted version is the newest.
    async fn read(&self, key: &str) -> ChainResult<Item>;

    /// Appends a new dirty item for `key`.
    async fn write(&self, key: &str, value: Bytes, version: Version) -> ChainResult<()>;

    /// Marks the exact `(key, version)` pair committed and purges every
    /// strictly older version of the key.
    ///
    /// Returns `KeyNotFound` when no item matches. Re-committing a version
    /// that is still present is a no-op success.
    async fn commit(&self, key: &str, version: Version) -> ChainResult<()>;

    /// Reads the exact `(key, version)` pair, or `KeyNotFound`.
    async fn read_version(&self, key: &str, version: Version) -> ChainResult<Item>;

    /// Returns every uncommitted item.
    async fn all_dirty(&self) -> ChainResult<Vec<Item>>;

    /// Returns every committed item.
    async fn all_committed(&self) -> ChainResult<Vec<Item>>;

    /// Returns, per key, the latest dirty item whose key is absent from
    /// `versions` or whose version strictly exceeds the map entry.
    async fn all_newer_dirty(
        &self,
        versions: &HashMap<String, Version>,
    ) -> ChainResult<Vec<Item>>;

    /// Returns, per key, the latest committed item whose key is absent from
    /// `versions` or whose version strictly exceeds the map entry.
    async fn all_newer_committed(
        &self,
        versions: &HashMap<String, Version>,
    ) -> ChainResult<Vec<Item>>;
}

/// Index shared by both backends: versions per key, oldest first.
type KeyIndex = HashMap<String, Vec<Item>>;

/// Read against a key's version list per the dirty-detection policy.
fn read_from(items: &[Item], key: &str) -> ChainResult<Item> {
    let latest = items
        .last()
        .ok_or_else(|| craq_common::ChainError::key_not_found(key))?;
    if !latest.committed {
        return Err(craq_common::ChainError::dirty(key, latest.version));
    }
    Ok(latest.clone())
}

/// Mark `(key, version)` committed in the index, purging older versions.
/// Returns false when no item matches.
fn commit_in(index: &mut KeyIndex, key: &str, version: Version) -> bool {
    let Some(items) = index.get_mut(key) else {
        return false;
    };
    let Some(pos) = items.iter().position(|i| i.version == version) else {
        return false;
    };
    items[pos].committed = true;
    items.drain(..pos);
    true
}

/// Collect per-key latest items in the given committed state that are newer
/// than (or unknown to) the supplied version map.
fn newer_in(index: &KeyIndex, versions: &HashMap<String, Version>, committed: bool) -> Vec<Item> {
    let mut newer = Vec::new();
    for (key, items) in index {
        let Some(latest) = items.iter().rev().find(|i| i.committed == committed) else {
            continue;
        };
        match versions.get(key) {
            Some(&seen) if latest.version <= seen => {}
            _ => newer.push(latest.clone()),
        }
    }
    newer
}

/// Collect every item in the given committed state.
fn all_in(index: &KeyIndex, committed: bool) -> Vec<Item> {
    index
        .values()
        .flatten()
        .filter(|i| i.committed == committed)
        .cloned()
        .collect()
}
