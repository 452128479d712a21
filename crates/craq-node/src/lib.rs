//! # craq-node
//!
//! One replica in the chain.
//!
//! A node owns a versioned store and a picture of its place in the chain:
//! role flags, handles to its immediate neighbors, and a handle to the tail.
//! Writes arrive from the predecessor and are forwarded tail-ward; commits
//! arrive from the successor and are forwarded head-ward; reads are answered
//! locally, falling back to a tail consultation when the key has an
//! uncommitted newer version.
//!
//! ```text
//!            writes ──────────▶
//!  head ── node ── node ── tail
//!            ◀────────── commits
//! ```
//!
//! # Locking
//!
//! Three locks with distinct jobs:
//!
//! - The **mutation lock** (`state`, an async `RwLock`): request handlers
//!   take it shared; `update` takes it exclusive, so a topology change never
//!   interleaves with handlers reading roles or neighbor handles.
//! - The **write-path lock**: serializes `client_write`/`write` end to end,
//!   including the forward to the successor, which keeps version order
//!   identical on every store down the chain.
//! - The **latest cache** lock (plain mutex, never held across await): lets
//!   the tail-to-head commit wave make progress while this node is blocked
//!   forwarding a write tail-ward.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

use craq_common::{ChainError, ChainResult, Item, KeyValue, Version};
use craq_store::Storer;
use craq_transport::{
    Connector, NodeClient, NodeMeta, NodeService, PropagateRequest, PropagateResponse,
    ValueVersion,
};

/// Options for constructing a [`Node`].
pub struct NodeOpts {
    /// Address advertised to the coordinator and to peers.
    pub pub_address: String,
    /// Address of the coordinator to announce to.
    pub coordinator: String,
    /// Storage backend.
    pub store: Arc<dyn Storer>,
    /// Transport used to reach the coordinator and peers.
    pub connector: Arc<dyn Connector>,
}

/// A non-owning handle to another node in the chain.
#[derive(Clone)]
struct Neighbor {
    address: String,
    client: Arc<dyn NodeClient>,
}

impl Neighbor {
    fn replace(slot: &mut Option<Neighbor>, next: Option<Neighbor>) {
        // The old connection is released before the new one is installed.
        if let Some(old) = slot.take() {
            old.client.close();
        }
        *slot = next;
    }
}

/// Chain placement: role flags and neighbor handles. Guarded by the node's
/// mutation lock.
#[derive(Default)]
struct ChainState {
    is_head: bool,
    is_tail: bool,
    prev: Option<Neighbor>,
    next: Option<Neighbor>,
    tail: Option<Neighbor>,
}

/// One replica in the chain.
pub struct Node {
    pub_address: String,
    coordinator: String,
    store: Arc<dyn Storer>,
    connector: Arc<dyn Connector>,
    state: RwLock<ChainState>,
    latest: parking_lot::Mutex<HashMap<String, Version>>,
    write_path: AsyncMutex<()>,
}

impl Node {
    /// Creates a node. It takes no part in the chain until [`Node::start`].
    pub fn new(opts: NodeOpts) -> Arc<Self> {
        Arc::new(Self {
            pub_address: opts.pub_address,
            coordinator: opts.coordinator,
            store: opts.store,
            connector: opts.connector,
            state: RwLock::new(ChainState::default()),
            latest: parking_lot::Mutex::new(HashMap::new()),
            write_path: AsyncMutex::new(()),
        })
    }

    /// The address this node advertises.
    pub fn pub_address(&self) -> &str {
        &self.pub_address
    }

    /// The storage backend. Exposed for diagnostics and tests.
    pub fn store(&self) -> &Arc<dyn Storer> {
        &self.store
    }

    /// Returns true if this node currently believes it is the head.
    pub async fn is_head(&self) -> bool {
        self.state.read().await.is_head
    }

    /// Returns true if this node currently believes it is the tail.
    pub async fn is_tail(&self) -> bool {
        self.state.read().await.is_tail
    }

    /// Joins the chain: seeds the latest-version cache from storage,
    /// announces this node to the coordinator, and catches up from the
    /// predecessor the coordinator assigned.
    ///
    /// The node must already be reachable at its advertised address (the
    /// coordinator dials back during registration).
    pub async fn start(&self) -> ChainResult<()> {
        // A persistent store may hold state from a previous life; the cache
        // must know the committed versions before any read is served.
        for item in self.store.all_committed().await? {
            self.record_latest(&item.key, item.version);
        }

        let coordinator = self.connector.coordinator(&self.coordinator).await?;
        info!(coordinator = %self.coordinator, "connected to coordinator");

        let meta = coordinator.add_node(self.pub_address.clone()).await?;
        info!(?meta, "registered with coordinator");

        let mut state = self.state.write().await;
        state.is_head = meta.is_head;
        state.is_tail = meta.is_tail;

        if !meta.is_tail {
            if let Some(addr) = &meta.tail {
                let tail = self.connect(addr).await?;
                Neighbor::replace(&mut state.tail, Some(tail));
            }
        }

        match &meta.prev {
            Some(addr) => {
                let prev = self.connect(addr).await?;
                Neighbor::replace(&mut state.prev, Some(prev.clone()));
                // Dirty items first, then committed: back-propagation may
                // commit versions forward-propagation just delivered.
                self.pull_dirty(&prev).await?;
                self.pull_committed(&prev).await?;
            }
            None => Neighbor::replace(&mut state.prev, None),
        }

        Ok(())
    }

    async fn connect(&self, address: &str) -> ChainResult<Neighbor> {
        let client = self.connector.node(address).await?;
        debug!(address, "connected to neighbor");
        Ok(Neighbor {
            address: address.to_owned(),
            client,
        })
    }

    fn latest_local(&self, key: &str) -> Version {
        self.latest.lock().get(key).copied().unwrap_or(0)
    }

    fn record_latest(&self, key: &str, version: Version) {
        let mut latest = self.latest.lock();
        let entry = latest.entry(key.to_owned()).or_insert(version);
        if *entry < version {
            *entry = version;
        }
    }

    /// Commits in local storage and refreshes the latest-version cache.
    async fn commit_local(&self, key: &str, version: Version) -> ChainResult<()> {
        self.store.commit(key, version).await?;
        self.record_latest(key, version);
        debug!(key, version, "committed");
        Ok(())
    }

    /// Asks `from` for dirty items this node is missing and stores them,
    /// still dirty.
    async fn pull_dirty(&self, from: &Neighbor) -> ChainResult<()> {
        let have = highest_versions(self.store.all_dirty().await?);
        let items = from.client.fwd_propagate(have).await?;
        debug!(from = %from.address, keys = items.len(), "forward propagation");

        for (key, versions) in items {
            for vv in versions {
                self.store.write(&key, vv.value, vv.version).await?;
            }
        }
        Ok(())
    }

    /// Asks `from` for committed items this node is missing and commits
    /// them, writing first when the version was never seen here.
    async fn pull_committed(&self, from: &Neighbor) -> ChainResult<()> {
        let have = highest_versions(self.store.all_committed().await?);
        let items = from.client.back_propagate(have).await?;
        debug!(from = %from.address, keys = items.len(), "back propagation");

        for (key, versions) in items {
            for vv in versions {
                match self.store.commit(&key, vv.version).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        self.store.write(&key, vv.value, vv.version).await?;
                        self.store.commit(&key, vv.version).await?;
                    }
                    Err(e) => return Err(e),
                }
                self.record_latest(&key, vv.version);
            }
        }
        Ok(())
    }

    /// The new-tail recovery action: every dirty item this node holds is, by
    /// chain order, replicated on every live predecessor, so the new tail
    /// commits them all and anchors a fresh commit wave.
    async fn commit_all_dirty(&self, prev: Option<&Neighbor>) -> ChainResult<()> {
        let dirty = self.store.all_dirty().await?;
        if dirty.is_empty() {
            return Ok(());
        }
        info!(items = dirty.len(), "became tail, committing dirty items");

        for item in dirty {
            self.commit_local(&item.key, item.version).await?;
            if let Some(prev) = prev {
                if let Err(e) = prev.client.commit(item.key.clone(), item.version).await {
                    warn!(
                        key = %item.key,
                        version = item.version,
                        "failed to send commit upstream: {e}"
                    );
                }
            }
        }
        Ok(())
    }
}

fn highest_versions(items: Vec<Item>) -> PropagateRequest {
    let mut versions = PropagateRequest::new();
    for item in items {
        let entry = versions.entry(item.key).or_insert(item.version);
        if *entry < item.version {
            *entry = item.version;
        }
    }
    versions
}

fn group_items(items: Vec<Item>) -> PropagateResponse {
    let mut grouped = PropagateResponse::new();
    for item in items {
        grouped.entry(item.key).or_default().push(ValueVersion {
            value: item.value,
            version: item.version,
        });
    }
    grouped
}

#[async_trait]
impl NodeService for Node {
    async fn ping(&self) -> ChainResult<()> {
        Ok(())
    }

    async fn update(&self, meta: NodeMeta) -> ChainResult<()> {
        let mut state = self.state.write().await;
        info!(?meta, "applying metadata update");

        let became_tail = meta.is_tail && !state.is_tail;
        state.is_head = meta.is_head;
        state.is_tail = meta.is_tail;

        // Predecessor: a new one may hold dirty writes that died with the
        // node between us.
        match &meta.prev {
            None => Neighbor::replace(&mut state.prev, None),
            Some(addr) if state.prev.as_ref().is_some_and(|n| &n.address == addr) => {}
            Some(addr) => {
                let prev = self.connect(addr).await?;
                Neighbor::replace(&mut state.prev, Some(prev.clone()));
                self.pull_dirty(&prev).await?;
            }
        }

        // Tail handle, used to resolve dirty reads. The tail itself answers
        // from its own cache.
        if state.is_tail {
            Neighbor::replace(&mut state.tail, None);
        } else {
            match &meta.tail {
                None => Neighbor::replace(&mut state.tail, None),
                Some(addr) if state.tail.as_ref().is_some_and(|n| &n.address == addr) => {}
                Some(addr) => {
                    let tail = self.connect(addr).await?;
                    Neighbor::replace(&mut state.tail, Some(tail));
                }
            }
        }

        // Successor: a new one is closer to the tail, so it holds commits
        // this node may have missed.
        match &meta.next {
            None => Neighbor::replace(&mut state.next, None),
            Some(addr) if state.next.as_ref().is_some_and(|n| &n.address == addr) => {}
            Some(addr) => {
                let next = self.connect(addr).await?;
                Neighbor::replace(&mut state.next, Some(next.clone()));
                self.pull_committed(&next).await?;
            }
        }

        if became_tail {
            self.commit_all_dirty(state.prev.as_ref()).await?;
        }

        Ok(())
    }

    async fn client_write(&self, key: String, value: Bytes) -> ChainResult<()> {
        let _serial = self.write_path.lock().await;

        // Continue from the highest version seen locally, committed or not;
        // an unknown key starts at version 0.
        let version = match self.store.read(&key).await {
            Ok(item) => item.version + 1,
            Err(ChainError::Dirty { version, .. }) => version + 1,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };

        self.store.write(&key, value.clone(), version).await?;
        debug!(key, version, "accepted client write");

        let next = {
            let state = self.state.read().await;
            state.next.clone()
        };

        match next {
            Some(next) => next.client.write(key, value, version).await,
            // Sole node in the chain: head and tail at once.
            None => self.commit_local(&key, version).await,
        }
    }

    async fn write(&self, key: String, value: Bytes, version: Version) -> ChainResult<()> {
        let _serial = self.write_path.lock().await;

        self.store.write(&key, value.clone(), version).await?;

        let (is_tail, next, prev) = {
            let state = self.state.read().await;
            (state.is_tail, state.next.clone(), state.prev.clone())
        };

        if !is_tail {
            let Some(next) = next else {
                return Err(ChainError::transport("no successor connected"));
            };
            return next.client.write(key, value, version).await;
        }

        // Tail: this write is now authoritative. Commit and start the
        // head-ward commit wave.
        self.commit_local(&key, version).await?;
        if let Some(prev) = prev {
            if let Err(e) = prev.client.commit(key.clone(), version).await {
                warn!(key, version, "failed to send commit upstream: {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn commit(&self, key: String, version: Version) -> ChainResult<()> {
        self.commit_local(&key, version).await?;

        let prev = {
            let state = self.state.read().await;
            state.prev.clone()
        };
        if let Some(prev) = prev {
            prev.client.commit(key, version).await?;
        }
        Ok(())
    }

    async fn read(&self, key: String) -> ChainResult<KeyValue> {
        match self.store.read(&key).await {
            Ok(item) => Ok(KeyValue::new(key, item.value)),
            Err(e) if e.is_dirty() => {
                // Apportioned read: the tail knows which version is
                // committed cluster-wide, and chain order guarantees the
                // version it names is present here.
                let (is_tail, tail) = {
                    let state = self.state.read().await;
                    (state.is_tail, state.tail.clone())
                };

                let version = if is_tail {
                    self.latest_local(&key)
                } else {
                    let Some(tail) = tail else {
                        return Err(ChainError::transport("no tail connected"));
                    };
                    let (_, version) = tail.client.latest_version(key.clone()).await?;
                    version
                };

                let item = self.store.read_version(&key, version).await?;
                Ok(KeyValue::new(key, item.value))
            }
            Err(e) => Err(e),
        }
    }

    async fn read_all(&self) -> ChainResult<Vec<KeyValue>> {
        let mut items: Vec<KeyValue> = self
            .store
            .all_committed()
            .await?
            .into_iter()
            .map(|item| KeyValue::new(item.key, item.value))
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(items)
    }

    async fn latest_version(&self, key: String) -> ChainResult<(String, Version)> {
        let version = self.latest_local(&key);
        Ok((key, version))
    }

    async fn fwd_propagate(&self, versions: PropagateRequest) -> ChainResult<PropagateResponse> {
        Ok(group_items(self.store.all_newer_dirty(&versions).await?))
    }

    async fn back_propagate(&self, versions: PropagateRequest) -> ChainResult<PropagateResponse> {
        Ok(group_items(self.store.all_newer_committed(&versions).await?))
    }
}
