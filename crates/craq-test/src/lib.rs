//! # craq-test
//!
//! Integration tests for the chain, plus the in-process harness they run on.
//!
//! The harness wires a coordinator and any number of nodes over the memory
//! transport. Killing a node deregisters its address first, so surviving
//! peers see transport failures exactly as they would with a crashed
//! process, then drives the coordinator's removal path.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;

use craq_coordinator::{Coordinator, CoordinatorConfig};
use craq_node::{Node, NodeOpts};
use craq_store::MemoryStore;
use craq_transport::{CoordinatorService, MemoryNetwork};

/// Address the harness coordinator is registered under.
pub const COORDINATOR_ADDR: &str = "coordinator";

/// One node in a test chain.
pub struct TestNode {
    /// The node's advertised address.
    pub address: String,
    /// The node itself.
    pub node: Arc<Node>,
}

/// An in-process chain.
pub struct TestChain {
    /// The shared memory network.
    pub network: Arc<MemoryNetwork>,
    /// The control plane.
    pub coordinator: Arc<Coordinator>,
    /// Chain members in join order.
    pub nodes: Vec<TestNode>,
    next_id: usize,
}

impl TestChain {
    /// Starts a chain of `size` nodes.
    pub async fn start(size: usize) -> Self {
        Self::start_with_config(size, CoordinatorConfig::default()).await
    }

    /// Starts a chain with explicit probe settings.
    pub async fn start_with_config(size: usize, config: CoordinatorConfig) -> Self {
        let network = MemoryNetwork::new();
        let coordinator = Coordinator::with_config(network.connector(), config);
        network.register_coordinator(COORDINATOR_ADDR, coordinator.clone());

        let mut chain = Self {
            network,
            coordinator,
            nodes: Vec::new(),
            next_id: 0,
        };
        for _ in 0..size {
            chain.grow().await;
        }
        chain
    }

    /// Adds one node to the end of the chain and returns it.
    pub async fn grow(&mut self) -> &TestNode {
        let address = format!("node-{}", self.next_id);
        self.next_id += 1;

        let node = Node::new(NodeOpts {
            pub_address: address.clone(),
            coordinator: COORDINATOR_ADDR.to_owned(),
            store: Arc::new(MemoryStore::new()),
            connector: self.network.connector(),
        });
        self.network.register_node(&address, node.clone());
        node.start().await.expect("node failed to join");

        self.nodes.push(TestNode { address, node });
        self.nodes.last().expect("just pushed")
    }

    /// The node at `index`, in join order.
    pub fn node(&self, index: usize) -> &Arc<Node> {
        &self.nodes[index].node
    }

    /// Makes the node at `index` unreachable without telling the
    /// coordinator, like a process that just died.
    pub fn crash(&self, index: usize) {
        self.network.deregister(&self.nodes[index].address);
    }

    /// Crashes the node at `index` and drives the coordinator's removal,
    /// standing in for the ping loop's detection.
    pub async fn kill(&mut self, index: usize) {
        self.crash(index);
        let removed = self.nodes.remove(index);
        self.coordinator
            .remove_node(removed.address)
            .await
            .expect("removal failed");
    }
}
