//! In-process transport for tests.
//!
//! A [`MemoryNetwork`] maps advertised addresses to service objects; clients
//! look the target up on every call, so deregistering an address makes a
//! "node" unreachable mid-chain exactly the way a crashed process would be.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use craq_common::{ChainError, ChainResult, KeyValue, Version};

use crate::{
    Connector, CoordinatorClient, CoordinatorService, NodeClient, NodeMeta, NodeService,
    PropagateRequest, PropagateResponse,
};

/// A process-local network of chain services.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<String, Arc<dyn NodeService>>,
    coordinators: DashMap<String, Arc<dyn CoordinatorService>>,
}

impl MemoryNetwork {
    /// Creates a shared network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node service under an advertised address.
    pub fn register_node(&self, address: impl Into<String>, service: Arc<dyn NodeService>) {
        self.nodes.insert(address.into(), service);
    }

    /// Registers a coordinator service under an address.
    pub fn register_coordinator(
        &self,
        address: impl Into<String>,
        service: Arc<dyn CoordinatorService>,
    ) {
        self.coordinators.insert(address.into(), service);
    }

    /// Removes an address from the network. Subsequent calls through any
    /// client holding that address fail with a transport error, which is how
    /// tests kill a node.
    pub fn deregister(&self, address: &str) {
        self.nodes.remove(address);
        self.coordinators.remove(address);
    }

    /// Returns a connector backed by this network.
    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            network: Arc::clone(self),
        })
    }

    fn node(&self, address: &str) -> ChainResult<Arc<dyn NodeService>> {
        self.nodes
            .get(address)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ChainError::transport(format!("node {address} is unreachable")))
    }

    fn coordinator(&self, address: &str) -> ChainResult<Arc<dyn CoordinatorService>> {
        self.coordinators
            .get(address)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ChainError::transport(format!("coordinator {address} is unreachable")))
    }
}

/// Connector producing in-process clients.
pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn node(&self, address: &str) -> ChainResult<Arc<dyn NodeClient>> {
        // Dialing an unreachable address fails, like a TCP connect would.
        self.network.node(address)?;
        Ok(Arc::new(MemoryNodeClient {
            network: Arc::clone(&self.network),
            address: address.to_owned(),
        }))
    }

    async fn coordinator(&self, address: &str) -> ChainResult<Arc<dyn CoordinatorClient>> {
        self.network.coordinator(address)?;
        Ok(Arc::new(MemoryCoordinatorClient {
            network: Arc::clone(&self.network),
            address: address.to_owned(),
        }))
    }
}

/// In-process node client. Resolves the target on every call.
pub struct MemoryNodeClient {
    network: Arc<MemoryNetwork>,
    address: String,
}

impl MemoryNodeClient {
    fn service(&self) -> ChainResult<Arc<dyn NodeService>> {
        self.network.node(&self.address)
    }
}

#[async_trait]
impl NodeService for MemoryNodeClient {
    async fn ping(&self) -> ChainResult<()> {
        self.service()?.ping().await
    }

    async fn update(&self, meta: NodeMeta) -> ChainResult<()> {
        self.service()?.update(meta).await
    }

    async fn client_write(&self, key: String, value: Bytes) -> ChainResult<()> {
        self.service()?.client_write(key, value).await
    }

    async fn write(&self, key: String, value: Bytes, version: Version) -> ChainResult<()> {
        self.service()?.write(key, value, version).await
    }

    async fn commit(&self, key: String, version: Version) -> ChainResult<()> {
        self.service()?.commit(key, version).await
    }

    async fn read(&self, key: String) -> ChainResult<KeyValue> {
        self.service()?.read(key).await
    }

    async fn read_all(&self) -> ChainResult<Vec<KeyValue>> {
        self.service()?.read_all().await
    }

    async fn latest_version(&self, key: String) -> ChainResult<(String, Version)> {
        self.service()?.latest_version(key).await
    }

    async fn fwd_propagate(&self, versions: PropagateRequest) -> ChainResult<PropagateResponse> {
        self.service()?.fwd_propagate(versions).await
    }

    async fn back_propagate(&self, versions: PropagateRequest) -> ChainResult<PropagateResponse> {
        self.service()?.back_propagate(versions).await
    }
}

impl NodeClient for MemoryNodeClient {
    fn address(&self) -> &str {
        &self.address
    }

    fn close(&self) {}
}

/// In-process coordinator client.
pub struct MemoryCoordinatorClient {
    network: Arc<MemoryNetwork>,
    address: String,
}

impl MemoryCoordinatorClient {
    fn service(&self) -> ChainResult<Arc<dyn CoordinatorService>> {
        self.network.coordinator(&self.address)
    }
}

#[async_trait]
impl CoordinatorService for MemoryCoordinatorClient {
    async fn add_node(&self, address: String) -> ChainResult<NodeMeta> {
        self.service()?.add_node(address).await
    }

    async fn remove_node(&self, address: String) -> ChainResult<()> {
        self.service()?.remove_node(address).await
    }

    async fn write(&self, key: String, value: Bytes) -> ChainResult<()> {
        self.service()?.write(key, value).await
    }
}

impl CoordinatorClient for MemoryCoordinatorClient {
    fn address(&self) -> &str {
        &self.address
    }

    fn close(&self) {}
}
