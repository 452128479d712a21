//! In-memory storage backend.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use craq_common::{ChainError, ChainResult, Item, Version};
use parking_lot::Mutex;

use crate::{all_in, commit_in, newer_in, read_from, KeyIndex, Storer};

/// An in-memory store. The default for tests and single-process chains.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<KeyIndex>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with items, e.g. to model a node that restarted with
    /// pre-existing state.
    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let mut index: KeyIndex = HashMap::new();
        for item in items {
            index.entry(item.key.clone()).or_default().push(item);
        }
        for versions in index.values_mut() {
            versions.sort_by_key(|i| i.version);
        }
        Self {
            items: Mutex::new(index),
        }
    }
}

#[async_trait]
impl Storer for MemoryStore {
    async fn read(&self, key: &str) -> ChainResult<Item> {
        let index = self.items.lock();
        let items = index
            .get(key)
            .ok_or_else(|| ChainError::key_not_found(key))?;
        read_from(items, key)
    }

    async fn write(&self, key: &str, value: Bytes, version: Version) -> ChainResult<()> {
        let mut index = self.items.lock();
        index
            .entry(key.to_owned())
            .or_default()
            .push(Item::dirty(key, version, value));
        Ok(())
    }

    async fn commit(&self, key: &str, version: Version) -> ChainResult<()> {
        let mut index = self.items.lock();
        if !commit_in(&mut index, key, version) {
            return Err(ChainError::key_not_found(key));
        }
        Ok(())
    }

    async fn read_version(&self, key: &str, version: Version) -> ChainResult<Item> {
        let index = self.items.lock();
        index
            .get(key)
            .and_then(|items| items.iter().find(|i| i.version == version))
            .cloned()
            .ok_or_else(|| ChainError::key_not_found(key))
    }

    async fn all_dirty(&self) -> ChainResult<Vec<Item>> {
        Ok(all_in(&self.items.lock(), false))
    }

    async fn all_committed(&self) -> ChainResult<Vec<Item>> {
        Ok(all_in(&self.items.lock(), true))
    }

    async fn all_newer_dirty(
        &self,
        versions: &HashMap<String, Version>,
    ) -> ChainResult<Vec<Item>> {
        Ok(newer_in(&self.items.lock(), versions, false))
    }

    async fn all_newer_committed(
        &self,
        versions: &HashMap<String, Version>,
    ) -> ChainResult<Vec<Item>> {
        Ok(newer_in(&self.items.lock(), versions, true))
    }
}
