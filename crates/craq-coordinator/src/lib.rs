//! # craq-coordinator
//!
//! The control plane of the chain.
//!
//! The coordinator owns the ordered replica list: the first entry is the
//! head, the last is the tail, and the order is the exact path writes take.
//! It admits client writes (forwarding them to the head), probes every
//! replica for liveness, and rewrites each survivor's role and neighbor
//! assignment when a node joins or drops out.
//!
//! The coordinator is a single process. If it fails while the chain is
//! intact, reads and writes already in flight keep working; only membership
//! changes and new write admission stall until it is back.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use craq_common::{ChainError, ChainResult};
use craq_transport::{Connector, CoordinatorService, NodeClient, NodeMeta, NodeService};

/// Liveness probe settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often every replica is probed.
    pub ping_interval: Duration,
    /// How long a probe may take before the replica is declared dead.
    pub ping_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(3),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// One chain member, in chain order.
#[derive(Clone)]
struct Replica {
    address: String,
    client: Arc<dyn NodeClient>,
}

/// The chain coordinator.
pub struct Coordinator {
    connector: Arc<dyn Connector>,
    config: CoordinatorConfig,
    replicas: Mutex<Vec<Replica>>,
}

impl Coordinator {
    /// Creates a coordinator with default probe settings.
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Self::with_config(connector, CoordinatorConfig::default())
    }

    /// Creates a coordinator with explicit probe settings.
    pub fn with_config(connector: Arc<dyn Connector>, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            connector,
            config,
            replicas: Mutex::new(Vec::new()),
        })
    }

    /// The chain members, head first. Diagnostic.
    pub async fn replica_addresses(&self) -> Vec<String> {
        self.replicas
            .lock()
            .await
            .iter()
            .map(|r| r.address.clone())
            .collect()
    }

    /// Probes every replica forever. Run this as a task; it is the
    /// authoritative failure detector for the chain.
    pub async fn run(self: Arc<Self>) {
        info!("starting liveness probes");
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let replicas = self.replicas.lock().await.clone();
            for replica in replicas {
                let coordinator = Arc::clone(&self);
                tokio::spawn(async move {
                    coordinator.probe(replica).await;
                });
            }
        }
    }

    async fn probe(&self, replica: Replica) {
        match tokio::time::timeout(self.config.ping_timeout, replica.client.ping()).await {
            Ok(Ok(())) => {
                debug!(address = %replica.address, "ping ok");
            }
            Ok(Err(e)) => {
                warn!(address = %replica.address, "ping failed: {e}");
                self.drop_replica(&replica.address).await;
            }
            // A late reply is ignored; the timeout already decided.
            Err(_) => {
                warn!(address = %replica.address, "ping timed out");
                self.drop_replica(&replica.address).await;
            }
        }
    }

    async fn drop_replica(&self, address: &str) {
        match self.remove_node(address.to_owned()).await {
            Ok(()) => {}
            // A concurrent probe got there first.
            Err(ChainError::UnknownNode { .. }) => {}
            Err(e) => warn!(address, "failed to remove node: {e}"),
        }
    }

    /// Sends each listed replica its recomputed metadata, concurrently.
    /// Failures are logged; the ping loop deals with unreachable nodes.
    async fn broadcast(&self, replicas: &[Replica], indices: impl IntoIterator<Item = usize>) {
        let mut handles = Vec::new();
        for i in indices {
            let replica = replicas[i].clone();
            let meta = meta_for(replicas, i);
            handles.push(tokio::spawn(async move {
                debug!(address = %replica.address, ?meta, "sending metadata update");
                if let Err(e) = replica.client.update(meta).await {
                    warn!(address = %replica.address, "metadata update failed: {e}");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Computes the metadata for position `i` in the current chain.
fn meta_for(replicas: &[Replica], i: usize) -> NodeMeta {
    let last = replicas.len() - 1;
    NodeMeta {
        is_head: i == 0,
        is_tail: i == last,
        prev: (i > 0).then(|| replicas[i - 1].address.clone()),
        next: (i < last).then(|| replicas[i + 1].address.clone()),
        tail: Some(replicas[last].address.clone()),
    }
}

#[async_trait]
impl CoordinatorService for Coordinator {
    async fn add_node(&self, address: String) -> ChainResult<NodeMeta> {
        info!(address, "node announced itself");
        let client = self.connector.node(&address).await?;

        let mut replicas = self.replicas.lock().await;
        replicas.push(Replica {
            address: address.clone(),
            client,
        });

        let last = replicas.len() - 1;
        let reply = NodeMeta {
            is_head: last == 0,
            is_tail: true,
            prev: (last > 0).then(|| replicas[last - 1].address.clone()),
            next: None,
            tail: Some(address),
        };

        // Everyone else learns the new tail address. The new node learns
        // its place from this reply and catches up from its predecessor on
        // its own.
        self.broadcast(&replicas, 0..last).await;
        Ok(reply)
    }

    async fn remove_node(&self, address: String) -> ChainResult<()> {
        let mut replicas = self.replicas.lock().await;
        let Some(idx) = replicas.iter().position(|r| r.address == address) else {
            return Err(ChainError::unknown_node(address));
        };

        let was_tail = idx == replicas.len() - 1;
        let removed = replicas.remove(idx);
        removed.client.close();
        info!(address = %removed.address, was_tail, "removed node from chain");

        if replicas.is_empty() {
            return Ok(());
        }

        if was_tail {
            // Every non-tail node keeps a handle to the tail, so a tail
            // change must reach all survivors.
            self.broadcast(&replicas, 0..replicas.len()).await;
        } else {
            // The successor moved into the gap and needs its new
            // predecessor; the predecessor (when there is one) needs its
            // new successor.
            let mut indices = vec![idx];
            if idx > 0 {
                indices.push(idx - 1);
            }
            self.broadcast(&replicas, indices).await;
        }

        Ok(())
    }

    async fn write(&self, key: String, value: Bytes) -> ChainResult<()> {
        let head = {
            let replicas = self.replicas.lock().await;
            replicas.first().cloned().ok_or(ChainError::EmptyChain)?
        };

        debug!(key, head = %head.address, "forwarding write to head");
        head.client.client_write(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use craq_node::{Node, NodeOpts};
    use craq_store::MemoryStore;
    use craq_transport::{MemoryNetwork, NodeService};

    const CDR: &str = "cdr";

    struct Cluster {
        network: Arc<MemoryNetwork>,
        coordinator: Arc<Coordinator>,
        next_id: usize,
    }

    impl Cluster {
        fn new() -> Self {
            let network = MemoryNetwork::new();
            let coordinator = Coordinator::new(network.connector());
            network.register_coordinator(CDR, coordinator.clone());
            Self {
                network,
                coordinator,
                next_id: 0,
            }
        }

        async fn spawn_node(&mut self) -> (String, Arc<Node>) {
            let address = format!("node-{}", self.next_id);
            self.next_id += 1;

            let node = Node::new(NodeOpts {
                pub_address: address.clone(),
                coordinator: CDR.to_owned(),
                store: Arc::new(MemoryStore::new()),
                connector: self.network.connector(),
            });
            self.network.register_node(&address, node.clone());
            node.start().await.unwrap();
            (address, node)
        }
    }

    #[tokio::test]
    async fn test_write_to_empty_chain_is_rejected() {
        let cluster = Cluster::new();
        let err = cluster
            .coordinator
            .write("k".to_owned(), Bytes::from_static(b"v"))
            .await
            .unwrap_err();
        assert_eq!(err, ChainError::EmptyChain);
    }

    #[tokio::test]
    async fn test_remove_unknown_node() {
        let cluster = Cluster::new();
        let err = cluster
            .coordinator
            .remove_node("ghost".to_owned())
            .await
            .unwrap_err();
        assert_eq!(err, ChainError::unknown_node("ghost"));
    }

    #[tokio::test]
    async fn test_sole_node_is_head_and_tail() {
        let mut cluster = Cluster::new();
        let (_, a) = cluster.spawn_node().await;

        assert!(a.is_head().await);
        assert!(a.is_tail().await);
    }

    #[tokio::test]
    async fn test_join_reassigns_tail() {
        let mut cluster = Cluster::new();
        let (_, a) = cluster.spawn_node().await;
        let (_, b) = cluster.spawn_node().await;

        assert!(a.is_head().await);
        assert!(!a.is_tail().await);
        assert!(!b.is_head().await);
        assert!(b.is_tail().await);

        assert_eq!(
            cluster.coordinator.replica_addresses().await,
            vec!["node-0", "node-1"]
        );
    }

    #[tokio::test]
    async fn test_remove_tail_promotes_predecessor() {
        let mut cluster = Cluster::new();
        let (_, a) = cluster.spawn_node().await;
        let (addr_b, _) = cluster.spawn_node().await;

        cluster.network.deregister(&addr_b);
        cluster.coordinator.remove_node(addr_b).await.unwrap();

        assert!(a.is_head().await);
        assert!(a.is_tail().await);
        assert_eq!(cluster.coordinator.replica_addresses().await, vec!["node-0"]);
    }

    #[tokio::test]
    async fn test_remove_head_promotes_successor() {
        let mut cluster = Cluster::new();
        let (addr_a, _) = cluster.spawn_node().await;
        let (_, b) = cluster.spawn_node().await;

        cluster.network.deregister(&addr_a);
        cluster.coordinator.remove_node(addr_a).await.unwrap();

        assert!(b.is_head().await);
        assert!(b.is_tail().await);

        // The chain of one still takes writes.
        cluster
            .coordinator
            .write("k".to_owned(), Bytes::from_static(b"v"))
            .await
            .unwrap();
        let kv = b.read("k".to_owned()).await.unwrap();
        assert_eq!(kv.value, Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn test_remove_only_node_empties_chain() {
        let mut cluster = Cluster::new();
        let (addr_a, _) = cluster.spawn_node().await;

        cluster.coordinator.remove_node(addr_a).await.unwrap();

        assert!(cluster.coordinator.replica_addresses().await.is_empty());
        let err = cluster
            .coordinator
            .write("k".to_owned(), Bytes::from_static(b"v"))
            .await
            .unwrap_err();
        assert_eq!(err, ChainError::EmptyChain);
    }

    #[tokio::test]
    async fn test_ping_loop_removes_dead_node() {
        let mut cluster = Cluster::new();
        let network = cluster.network.clone();

        let coordinator = Coordinator::with_config(
            network.connector(),
            CoordinatorConfig {
                ping_interval: Duration::from_millis(20),
                ping_timeout: Duration::from_millis(100),
            },
        );
        network.register_coordinator(CDR, coordinator.clone());
        cluster.coordinator = coordinator.clone();

        let (_, a) = cluster.spawn_node().await;
        let (addr_b, _) = cluster.spawn_node().await;

        let probes = tokio::spawn(coordinator.clone().run());

        // Kill b; an in-memory ping fails immediately once deregistered.
        network.deregister(&addr_b);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(coordinator.replica_addresses().await, vec!["node-0"]);
        assert!(a.is_tail().await);
        probes.abort();
    }
}
