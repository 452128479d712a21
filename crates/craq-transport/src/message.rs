//! Request and response message types, plus the server-side dispatch that
//! turns a decoded request into a service call.
//!
//! Responses are `Result`-shaped: semantic failures travel as
//! [`ChainError`] values, not flattened strings, so a `KeyNotFound` raised
//! three hops away is still a `KeyNotFound` at the client.

use bytes::Bytes;
use craq_common::{ChainError, ChainResult, KeyValue, Version};
use serde::{Deserialize, Serialize};

use crate::{CoordinatorService, NodeMeta, NodeService, PropagateRequest, PropagateResponse};

/// A request to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeRequest {
    /// Liveness probe.
    Ping,
    /// Role/neighbor assignment.
    Update(NodeMeta),
    /// New client write (head only).
    ClientWrite {
        /// Key to write.
        key: String,
        /// Value to write.
        value: Bytes,
    },
    /// Chain-internal versioned write.
    Write {
        /// Key to write.
        key: String,
        /// Value to write.
        value: Bytes,
        /// Version assigned by the head.
        version: Version,
    },
    /// Chain-internal commit.
    Commit {
        /// Key to commit.
        key: String,
        /// Version to commit.
        version: Version,
    },
    /// Read the latest committed value.
    Read {
        /// Key to read.
        key: String,
    },
    /// Read every committed pair.
    ReadAll,
    /// Ask for the latest committed version of a key.
    LatestVersion {
        /// Key to look up.
        key: String,
    },
    /// Forward-propagation catch-up query (dirty items).
    FwdPropagate(PropagateRequest),
    /// Back-propagation catch-up query (committed items).
    BackPropagate(PropagateRequest),
}

/// A response from a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeResponse {
    /// The operation succeeded with nothing to return.
    Ack,
    /// A single key/value pair.
    Value(KeyValue),
    /// Every committed pair.
    Values(Vec<KeyValue>),
    /// A key and its latest committed version.
    LatestVersion {
        /// The key asked about.
        key: String,
        /// Latest committed version, 0 when unknown.
        version: Version,
    },
    /// Catch-up items.
    Propagate(PropagateResponse),
    /// The operation failed.
    Error(ChainError),
}

/// A request to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorRequest {
    /// Node announcing itself.
    AddNode {
        /// The node's advertised address.
        address: String,
    },
    /// Remove a node by advertised address.
    RemoveNode {
        /// The address to remove.
        address: String,
    },
    /// Client write entry point.
    Write {
        /// Key to write.
        key: String,
        /// Value to write.
        value: Bytes,
    },
}

/// A response from the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorResponse {
    /// The operation succeeded with nothing to return.
    Ack,
    /// Placement reply to `AddNode`.
    Meta(NodeMeta),
    /// The operation failed.
    Error(ChainError),
}

impl NodeResponse {
    fn unexpected(self, wanted: &str) -> ChainError {
        ChainError::transport(format!("unexpected node response, wanted {wanted}: {self:?}"))
    }

    /// Interprets the response as a bare acknowledgement.
    pub fn into_ack(self) -> ChainResult<()> {
        match self {
            Self::Ack => Ok(()),
            Self::Error(err) => Err(err),
            other => Err(other.unexpected("ack")),
        }
    }

    /// Interprets the response as a key/value pair.
    pub fn into_value(self) -> ChainResult<KeyValue> {
        match self {
            Self::Value(kv) => Ok(kv),
            Self::Error(err) => Err(err),
            other => Err(other.unexpected("value")),
        }
    }

    /// Interprets the response as a list of pairs.
    pub fn into_values(self) -> ChainResult<Vec<KeyValue>> {
        match self {
            Self::Values(kvs) => Ok(kvs),
            Self::Error(err) => Err(err),
            other => Err(other.unexpected("values")),
        }
    }

    /// Interprets the response as a latest-version reply.
    pub fn into_latest_version(self) -> ChainResult<(String, Version)> {
        match self {
            Self::LatestVersion { key, version } => Ok((key, version)),
            Self::Error(err) => Err(err),
            other => Err(other.unexpected("latest version")),
        }
    }

    /// Interprets the response as catch-up items.
    pub fn into_propagate(self) -> ChainResult<PropagateResponse> {
        match self {
            Self::Propagate(items) => Ok(items),
            Self::Error(err) => Err(err),
            other => Err(other.unexpected("propagate")),
        }
    }
}

impl CoordinatorResponse {
    fn unexpected(self, wanted: &str) -> ChainError {
        ChainError::transport(format!(
            "unexpected coordinator response, wanted {wanted}: {self:?}"
        ))
    }

    /// Interprets the response as a bare acknowledgement.
    pub fn into_ack(self) -> ChainResult<()> {
        match self {
            Self::Ack => Ok(()),
            Self::Error(err) => Err(err),
            other => Err(other.unexpected("ack")),
        }
    }

    /// Interprets the response as a placement reply.
    pub fn into_meta(self) -> ChainResult<NodeMeta> {
        match self {
            Self::Meta(meta) => Ok(meta),
            Self::Error(err) => Err(err),
            other => Err(other.unexpected("meta")),
        }
    }
}

fn ack(result: ChainResult<()>) -> NodeResponse {
    match result {
        Ok(()) => NodeResponse::Ack,
        Err(err) => NodeResponse::Error(err),
    }
}

/// Invokes the service method a node request names.
pub async fn dispatch_node(svc: &dyn NodeService, request: NodeRequest) -> NodeResponse {
    match request {
        NodeRequest::Ping => ack(svc.ping().await),
        NodeRequest::Update(meta) => ack(svc.update(meta).await),
        NodeRequest::ClientWrite { key, value } => ack(svc.client_write(key, value).await),
        NodeRequest::Write {
            key,
            value,
            version,
        } => ack(svc.write(key, value, version).await),
        NodeRequest::Commit { key, version } => ack(svc.commit(key, version).await),
        NodeRequest::Read { key } => match svc.read(key).await {
            Ok(kv) => NodeResponse::Value(kv),
            Err(err) => NodeResponse::Error(err),
        },
        NodeRequest::ReadAll => match svc.read_all().await {
            Ok(kvs) => NodeResponse::Values(kvs),
            Err(err) => NodeResponse::Error(err),
        },
        NodeRequest::LatestVersion { key } => match svc.latest_version(key).await {
            Ok((key, version)) => NodeResponse::LatestVersion { key, version },
            Err(err) => NodeResponse::Error(err),
        },
        NodeRequest::FwdPropagate(versions) => match svc.fwd_propagate(versions).await {
            Ok(items) => NodeResponse::Propagate(items),
            Err(err) => NodeResponse::Error(err),
        },
        NodeRequest::BackPropagate(versions) => match svc.back_propagate(versions).await {
            Ok(items) => NodeResponse::Propagate(items),
            Err(err) => NodeResponse::Error(err),
        },
    }
}

/// Invokes the service method a coordinator request names.
pub async fn dispatch_coordinator(
    svc: &dyn CoordinatorService,
    request: CoordinatorRequest,
) -> CoordinatorResponse {
    match request {
        CoordinatorRequest::AddNode { address } => match svc.add_node(address).await {
            Ok(meta) => CoordinatorResponse::Meta(meta),
            Err(err) => CoordinatorResponse::Error(err),
        },
        CoordinatorRequest::RemoveNode { address } => match svc.remove_node(address).await {
            Ok(()) => CoordinatorResponse::Ack,
            Err(err) => CoordinatorResponse::Error(err),
        },
        CoordinatorRequest::Write { key, value } => match svc.write(key, value).await {
            Ok(()) => CoordinatorResponse::Ack,
            Err(err) => CoordinatorResponse::Error(err),
        },
    }
}
