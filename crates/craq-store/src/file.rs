//! Persistent storage backend.
//!
//! `FileStore` keeps the same in-memory index as [`MemoryStore`] and makes it
//! durable with an append-only log. Every mutation is one checksummed frame:
//!
//! ```text
//! +---------+----------+------------------+
//! | Len(4)  | CRC32(4) | Payload(Len)     |
//! +---------+----------+------------------+
//! ```
//!
//! Payloads are bincode-encoded [`LogRecord`]s. Opening the store replays the
//! log; a torn or corrupt tail frame ends the replay and is truncated away,
//! so a crash mid-append loses at most the record being written.
//!
//! [`MemoryStore`]: crate::MemoryStore

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use async_trait::async_trait;
use craq_common::{ChainError, ChainResult, Item, Version};

use crate::{all_in, commit_in, newer_in, read_from, KeyIndex, Storer};

/// Frame header size: length + checksum.
const FRAME_HEADER: usize = 4 + 4;

/// Upper bound on a single record, to reject garbage lengths during replay.
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// One durable mutation.
#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Write {
        key: String,
        version: Version,
        value: Bytes,
    },
    Commit {
        key: String,
        version: Version,
    },
}

fn encode_frame(record: &LogRecord) -> ChainResult<Bytes> {
    let payload = bincode::serialize(record).map_err(ChainError::storage)?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u32(crc32fast::hash(&payload));
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decodes the next frame, advancing `buf` past it. `None` means the
/// remaining bytes do not form a complete, valid frame.
fn decode_frame(buf: &mut Bytes) -> Option<LogRecord> {
    if buf.len() < FRAME_HEADER {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_RECORD_SIZE || buf.len() < FRAME_HEADER + len {
        return None;
    }
    let crc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let payload = buf.slice(FRAME_HEADER..FRAME_HEADER + len);
    if crc32fast::hash(&payload) != crc {
        return None;
    }
    let record = bincode::deserialize(&payload).ok()?;
    buf.advance(FRAME_HEADER + len);
    Some(record)
}

struct Inner {
    index: KeyIndex,
    log: File,
}

/// A store backed by an append-only log file.
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileStore {
    /// Opens (or creates) the store at `path`, replaying the existing log.
    pub async fn open(path: impl AsRef<Path>) -> ChainResult<Self> {
        let path = path.as_ref().to_owned();
        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Bytes::new(),
            Err(e) => return Err(ChainError::storage(e)),
        };

        let total = data.len();
        let mut rest = data;
        let mut index: KeyIndex = HashMap::new();
        while let Some(record) = decode_frame(&mut rest) {
            apply_record(&mut index, record);
        }
        let valid = (total - rest.len()) as u64;
        if !rest.is_empty() {
            warn!(
                path = %path.display(),
                dropped = rest.len(),
                "log has a torn tail, truncating"
            );
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(ChainError::storage)?;
        if !rest.is_empty() {
            log.set_len(valid).await.map_err(ChainError::storage)?;
        }

        debug!(path = %path.display(), keys = index.len(), "opened store");
        Ok(Self {
            path,
            inner: Mutex::new(Inner { index, log }),
        })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the log to one write (plus commit) per surviving item,
    /// dropping the history of purged versions.
    pub async fn compact(&self) -> ChainResult<()> {
        let mut inner = self.inner.lock().await;

        let mut buf = BytesMut::new();
        for items in inner.index.values() {
            for item in items {
                buf.put_slice(&encode_frame(&LogRecord::Write {
                    key: item.key.clone(),
                    version: item.version,
                    value: item.value.clone(),
                })?);
                if item.committed {
                    buf.put_slice(&encode_frame(&LogRecord::Commit {
                        key: item.key.clone(),
                        version: item.version,
                    })?);
                }
            }
        }

        let tmp = self.path.with_extension("compact");
        tokio::fs::write(&tmp, &buf).await.map_err(ChainError::storage)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(ChainError::storage)?;

        inner.log = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(ChainError::storage)?;
        debug!(path = %self.path.display(), "compacted log");
        Ok(())
    }

    async fn append(inner: &mut Inner, record: &LogRecord) -> ChainResult<()> {
        let frame = encode_frame(record)?;
        inner
            .log
            .write_all(&frame)
            .await
            .map_err(ChainError::storage)?;
        inner.log.flush().await.map_err(ChainError::storage)
    }
}

fn apply_record(index: &mut KeyIndex, record: LogRecord) {
    match record {
        LogRecord::Write {
            key,
            version,
            value,
        } => {
            index
                .entry(key.clone())
                .or_default()
                .push(Item::dirty(key, version, value));
        }
        LogRecord::Commit { key, version } => {
            if !commit_in(index, &key, version) {
                warn!(key, version, "replayed commit for an unknown item");
            }
        }
    }
}

#[async_trait]
impl Storer for FileStore {
    async fn read(&self, key: &str) -> ChainResult<Item> {
        let inner = self.inner.lock().await;
        let items = inner
            .index
            .get(key)
            .ok_or_else(|| ChainError::key_not_found(key))?;
        read_from(items, key)
    }

    async fn write(&self, key: &str, value: Bytes, version: Version) -> ChainResult<()> {
        let mut inner = self.inner.lock().await;
        Self::append(
            &mut inner,
            &LogRecord::Write {
                key: key.to_owned(),
                version,
                value: value.clone(),
            },
        )
        .await?;
        inner
            .index
            .entry(key.to_owned())
            .or_default()
            .push(Item::dirty(key, version, value));
        Ok(())
    }

    async fn commit(&self, key: &str, version: Version) -> ChainResult<()> {
        let mut inner = self.inner.lock().await;
        let matches = inner
            .index
            .get(key)
            .is_some_and(|items| items.iter().any(|i| i.version == version));
        if !matches {
            return Err(ChainError::key_not_found(key));
        }
        Self::append(
            &mut inner,
            &LogRecord::Commit {
                key: key.to_owned(),
                version,
            },
        )
        .await?;
        commit_in(&mut inner.index, key, version);
        Ok(())
    }

    async fn read_version(&self, key: &str, version: Version) -> ChainResult<Item> {
        let inner = self.inner.lock().await;
        inner
            .index
            .get(key)
            .and_then(|items| items.iter().find(|i| i.version == version))
            .cloned()
            .ok_or_else(|| ChainError::key_not_found(key))
    }

    async fn all_dirty(&self) -> ChainResult<Vec<Item>> {
        Ok(all_in(&self.inner.lock().await.index, false))
    }

    async fn all_committed(&self) -> ChainResult<Vec<Item>> {
        Ok(all_in(&self.inner.lock().await.index, true))
    }

    async fn all_newer_dirty(
        &self,
        versions: &HashMap<String, Version>,
    ) -> ChainResult<Vec<Item>> {
        Ok(newer_in(&self.inner.lock().await.index, versions, false))
    }

    async fn all_newer_committed(
        &self,
        versions: &HashMap<String, Version>,
    ) -> ChainResult<Vec<Item>> {
        Ok(newer_in(&self.inner.lock().await.index, versions, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_storer_contract() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("chain.log")).await.unwrap();
        contract::run_all(&store).await;
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.log");

        let store = FileStore::open(&path).await.unwrap();
        store.write("k", Bytes::from_static(b"v0"), 0).await.unwrap();
        store.commit("k", 0).await.unwrap();
        store.write("k", Bytes::from_static(b"v1"), 1).await.unwrap();
        drop(store);

        let store = FileStore::open(&path).await.unwrap();
        // The committed version and the dirty version both survived.
        assert_eq!(store.read("k").await.unwrap_err(), ChainError::dirty("k", 1));
        let item = store.read_version("k", 0).await.unwrap();
        assert!(item.committed);
        assert_eq!(item.value, Bytes::from_static(b"v0"));
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.log");

        let store = FileStore::open(&path).await.unwrap();
        store.write("k", Bytes::from_static(b"v"), 0).await.unwrap();
        store.commit("k", 0).await.unwrap();
        drop(store);

        // Simulate a crash mid-append.
        let mut data = std::fs::read(&path).unwrap();
        let intact = data.len();
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x09, 0xde, 0xad]);
        std::fs::write(&path, &data).unwrap();

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.read("k").await.unwrap().version, 0);
        drop(store);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact as u64);
    }

    #[tokio::test]
    async fn test_compact_preserves_state_and_shrinks_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.log");

        let store = FileStore::open(&path).await.unwrap();
        for version in 0..10u64 {
            let value = Bytes::from(format!("value-{version}"));
            store.write("k", value, version).await.unwrap();
            store.commit("k", version).await.unwrap();
        }
        let before = std::fs::metadata(&path).unwrap().len();
        store.compact().await.unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before);

        // Still writable and readable after compaction.
        store.write("k", Bytes::from_static(b"v10"), 10).await.unwrap();
        store.commit("k", 10).await.unwrap();
        drop(store);

        let store = FileStore::open(&path).await.unwrap();
        let item = store.read("k").await.unwrap();
        assert_eq!(item.version, 10);
        assert_eq!(item.value, Bytes::from_static(b"v10"));
    }
}
