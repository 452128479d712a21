//! # craq-client
//!
//! Client library for the chain: writes go to the coordinator (which admits
//! them at the head), reads go to whichever node the client was pointed at.
//!
//! Connections are opened lazily, per endpoint. Reads only need the node
//! connection, so a chain whose coordinator is down can still serve them.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::debug;

use craq_common::{ChainResult, KeyValue};
use craq_transport::{
    Connector, CoordinatorClient, CoordinatorService, NodeClient, NodeService,
};

/// A chain client.
pub struct Client {
    connector: Arc<dyn Connector>,
    coordinator_addr: String,
    node_addr: String,
    coordinator: OnceCell<Arc<dyn CoordinatorClient>>,
    node: OnceCell<Arc<dyn NodeClient>>,
}

impl Client {
    /// Creates a client targeting the given coordinator (for writes) and
    /// node (for reads). Nothing is dialed until the first call.
    pub fn new(
        coordinator: impl Into<String>,
        node: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            connector,
            coordinator_addr: coordinator.into(),
            node_addr: node.into(),
            coordinator: OnceCell::new(),
            node: OnceCell::new(),
        }
    }

    async fn coordinator(&self) -> ChainResult<&Arc<dyn CoordinatorClient>> {
        self.coordinator
            .get_or_try_init(|| self.connector.coordinator(&self.coordinator_addr))
            .await
    }

    async fn node(&self) -> ChainResult<&Arc<dyn NodeClient>> {
        self.node
            .get_or_try_init(|| self.connector.node(&self.node_addr))
            .await
    }

    /// Writes a value. Returns once the write has traversed the chain.
    pub async fn write(&self, key: impl Into<String>, value: Bytes) -> ChainResult<()> {
        let key = key.into();
        debug!(key, "write");
        self.coordinator().await?.write(key, value).await
    }

    /// Reads the latest committed value for a key.
    pub async fn read(&self, key: impl Into<String>) -> ChainResult<KeyValue> {
        let key = key.into();
        debug!(key, "read");
        self.node().await?.read(key).await
    }

    /// Reads every committed key/value pair from the target node.
    pub async fn read_all(&self) -> ChainResult<Vec<KeyValue>> {
        self.node().await?.read_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use craq_coordinator::Coordinator;
    use craq_node::{Node, NodeOpts};
    use craq_store::MemoryStore;
    use craq_transport::MemoryNetwork;

    async fn chain_of_one(network: &Arc<MemoryNetwork>) {
        let coordinator = Coordinator::new(network.connector());
        network.register_coordinator("cdr", coordinator);

        let node = Node::new(NodeOpts {
            pub_address: "a".to_owned(),
            coordinator: "cdr".to_owned(),
            store: Arc::new(MemoryStore::new()),
            connector: network.connector(),
        });
        network.register_node("a", node.clone());
        node.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let network = MemoryNetwork::new();
        chain_of_one(&network).await;

        let client = Client::new("cdr", "a", network.connector());
        client.write("k", Bytes::from_static(b"v")).await.unwrap();

        let kv = client.read("k").await.unwrap();
        assert_eq!(kv.value, Bytes::from_static(b"v"));

        let all = client.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_reads_survive_a_dead_coordinator() {
        let network = MemoryNetwork::new();
        chain_of_one(&network).await;

        let client = Client::new("cdr", "a", network.connector());
        client.write("k", Bytes::from_static(b"v")).await.unwrap();

        network.deregister("cdr");

        // Writes fail, reads keep working.
        assert!(client
            .write("k", Bytes::from_static(b"w"))
            .await
            .unwrap_err()
            .is_transport());
        let kv = client.read("k").await.unwrap();
        assert_eq!(kv.value, Bytes::from_static(b"v"));
    }
}
