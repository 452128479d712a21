//! # craq-transport
//!
//! The RPC surface of the chain, split the way the original design splits it:
//!
//! - **Services** are what a process implements: [`NodeService`] for replicas,
//!   [`CoordinatorService`] for the control plane. The node and coordinator
//!   crates implement these against their own state.
//! - **Clients** are how a process talks to a peer: [`NodeClient`] and
//!   [`CoordinatorClient`] add an address and a close hook on top of the
//!   service surface.
//! - A [`Connector`] turns an advertised address into a live client, so the
//!   node and coordinator never know which transport they are running on.
//!
//! Two transports implement the surface:
//!
//! - [`tcp`]: length-prefixed bincode frames over TCP, with request/response
//!   matching by id. Production.
//! - [`memory`]: a process-local registry of services, calls dispatched
//!   directly. Tests; deregistering an address simulates a node failure.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frame;
pub mod memory;
pub mod message;
pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use craq_common::{ChainResult, KeyValue, Version};
use serde::{Deserialize, Serialize};

pub use memory::{MemoryConnector, MemoryNetwork};
pub use tcp::{serve_coordinator, serve_node, TcpConnector};

/// Placement metadata for one node: its role flags and the addresses of its
/// chain neighbors. Sent by the coordinator whenever the chain changes shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// True when the node is first in the chain and accepts client writes.
    pub is_head: bool,
    /// True when the node is last in the chain and commits writes.
    pub is_tail: bool,
    /// Address of the predecessor, absent for the head.
    pub prev: Option<String>,
    /// Address of the successor, absent for the tail.
    pub next: Option<String>,
    /// Address of the current tail, absent only for an empty assignment.
    pub tail: Option<String>,
}

/// Versions a catching-up node already holds, highest per key.
pub type PropagateRequest = HashMap<String, Version>;

/// Items the peer holds that the requester lacks, keyed like the request.
pub type PropagateResponse = HashMap<String, Vec<ValueVersion>>;

/// One propagated value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueVersion {
    /// The stored value.
    pub value: Bytes,
    /// Its version.
    pub version: Version,
}

/// The RPC surface a chain node exposes to the coordinator and its peers.
#[async_trait]
pub trait NodeService: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> ChainResult<()>;

    /// Applies a role/neighbor assignment from the coordinator.
    async fn update(&self, meta: NodeMeta) -> ChainResult<()>;

    /// Head-only entry point for a new client write.
    async fn client_write(&self, key: String, value: Bytes) -> ChainResult<()>;

    /// Chain-internal write propagation, head to tail.
    async fn write(&self, key: String, value: Bytes, version: Version) -> ChainResult<()>;

    /// Chain-internal commit propagation, tail to head.
    async fn commit(&self, key: String, version: Version) -> ChainResult<()>;

    /// Reads the latest committed value for a key.
    async fn read(&self, key: String) -> ChainResult<KeyValue>;

    /// Diagnostic sweep of every committed key/value pair.
    async fn read_all(&self) -> ChainResult<Vec<KeyValue>>;

    /// Latest committed version this node knows of. Authoritative on the tail.
    async fn latest_version(&self, key: String) -> ChainResult<(String, Version)>;

    /// Returns dirty items newer than (or unknown to) the given versions.
    async fn fwd_propagate(&self, versions: PropagateRequest) -> ChainResult<PropagateResponse>;

    /// Returns committed items newer than (or unknown to) the given versions.
    async fn back_propagate(&self, versions: PropagateRequest) -> ChainResult<PropagateResponse>;
}

/// The RPC surface the coordinator exposes to nodes and clients.
#[async_trait]
pub trait CoordinatorService: Send + Sync {
    /// Registers a node; it becomes the new tail. The reply tells the node
    /// where it sits in the chain.
    async fn add_node(&self, address: String) -> ChainResult<NodeMeta>;

    /// Removes a node by advertised address.
    async fn remove_node(&self, address: String) -> ChainResult<()>;

    /// Client write entry point; forwarded to the head.
    async fn write(&self, key: String, value: Bytes) -> ChainResult<()>;
}

/// A live connection to a node.
pub trait NodeClient: NodeService {
    /// The advertised address this client is connected to.
    fn address(&self) -> &str;

    /// Releases the connection. Calls after close fail with `Transport`.
    fn close(&self);
}

/// A live connection to the coordinator.
pub trait CoordinatorClient: CoordinatorService {
    /// The address this client is connected to.
    fn address(&self) -> &str;

    /// Releases the connection.
    fn close(&self);
}

/// Creates clients from advertised addresses.
///
/// The node and coordinator own one of these instead of a concrete transport,
/// which is what lets the test suite run whole chains in-process.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to a node.
    async fn node(&self, address: &str) -> ChainResult<Arc<dyn NodeClient>>;

    /// Connects to a coordinator.
    async fn coordinator(&self, address: &str) -> ChainResult<Arc<dyn CoordinatorClient>>;
}
