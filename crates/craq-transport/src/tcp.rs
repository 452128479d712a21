//! TCP transport.
//!
//! Clients hold one connection per peer. Each call is a frame tagged with a
//! request id; a reader task matches response frames back to waiting calls,
//! so any number of calls can be in flight on one connection. Servers decode
//! requests off each accepted connection and run one task per request, so a
//! slow handler (a write traversing the whole chain, say) never blocks the
//! pings multiplexed on the same socket.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use craq_common::{ChainError, ChainResult, KeyValue, Version};

use crate::frame;
use crate::message::{
    dispatch_coordinator, dispatch_node, CoordinatorRequest, CoordinatorResponse, NodeRequest,
    NodeResponse,
};
use crate::{
    Connector, CoordinatorClient, CoordinatorService, NodeClient, NodeMeta, NodeService,
    PropagateRequest, PropagateResponse,
};

/// Outbound frame queue depth per connection.
const OUTBOX_CAPACITY: usize = 64;

/// One multiplexed client connection.
#[derive(Debug)]
struct Connection {
    peer: String,
    outbox: mpsc::Sender<Bytes>,
    pending: Arc<DashMap<u64, oneshot::Sender<Bytes>>>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl Connection {
    async fn dial(address: &str) -> ChainResult<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ChainError::transport(format!("connect to {address}: {e}")))?;
        let (mut read_half, write_half) = stream.into_split();

        let (outbox_tx, outbox_rx) = mpsc::channel::<Bytes>(OUTBOX_CAPACITY);
        let pending: Arc<DashMap<u64, oneshot::Sender<Bytes>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        spawn_writer(write_half, outbox_rx);

        // Reader: route response frames back to their callers.
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let peer = address.to_owned();
        let reader_peer = peer.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        while let Some(size) = frame::frame_size(&buf) {
                            let data = buf.split_to(size).freeze();
                            let id = frame::frame_id(&data);
                            match reader_pending.remove(&id) {
                                Some((_, tx)) => {
                                    let _ = tx.send(data);
                                }
                                // Late reply, e.g. after the caller gave up.
                                None => debug!(id, peer = %reader_peer, "dropping unmatched reply"),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(peer = %reader_peer, "read error: {e}");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::Release);
            // Dropping the senders wakes every waiter with an error.
            reader_pending.clear();
        });

        Ok(Self {
            peer,
            outbox: outbox_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.clear();
    }

    fn closed_err(&self) -> ChainError {
        ChainError::transport(format!("connection to {} is closed", self.peer))
    }

    async fn call<Req, Resp>(&self, request: &Req) -> ChainResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_err());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let data = frame::encode(id, request)?;
        if self.outbox.send(data).await.is_err() {
            self.pending.remove(&id);
            return Err(self.closed_err());
        }

        let data = rx.await.map_err(|_| self.closed_err())?;
        let (_, response) = frame::decode(data)?;
        Ok(response)
    }
}

fn spawn_writer(mut write_half: OwnedWriteHalf, mut outbox: mpsc::Receiver<Bytes>) {
    tokio::spawn(async move {
        while let Some(data) = outbox.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                warn!("write error: {e}");
                break;
            }
        }
    });
}

/// A node client over TCP.
#[derive(Debug)]
pub struct TcpNodeClient {
    conn: Connection,
}

impl TcpNodeClient {
    /// Dials a node.
    pub async fn dial(address: &str) -> ChainResult<Self> {
        let conn = Connection::dial(address).await?;
        debug!(address, "connected to node");
        Ok(Self { conn })
    }

    async fn call(&self, request: NodeRequest) -> ChainResult<NodeResponse> {
        self.conn.call(&request).await
    }
}

#[async_trait]
impl NodeService for TcpNodeClient {
    async fn ping(&self) -> ChainResult<()> {
        self.call(NodeRequest::Ping).await?.into_ack()
    }

    async fn update(&self, meta: NodeMeta) -> ChainResult<()> {
        self.call(NodeRequest::Update(meta)).await?.into_ack()
    }

    async fn client_write(&self, key: String, value: Bytes) -> ChainResult<()> {
        self.call(NodeRequest::ClientWrite { key, value })
            .await?
            .into_ack()
    }

    async fn write(&self, key: String, value: Bytes, version: Version) -> ChainResult<()> {
        self.call(NodeRequest::Write {
            key,
            value,
            version,
        })
        .await?
        .into_ack()
    }

    async fn commit(&self, key: String, version: Version) -> ChainResult<()> {
        self.call(NodeRequest::Commit { key, version })
            .await?
            .into_ack()
    }

    async fn read(&self, key: String) -> ChainResult<KeyValue> {
        self.call(NodeRequest::Read { key }).await?.into_value()
    }

    async fn read_all(&self) -> ChainResult<Vec<KeyValue>> {
        self.call(NodeRequest::ReadAll).await?.into_values()
    }

    async fn latest_version(&self, key: String) -> ChainResult<(String, Version)> {
        self.call(NodeRequest::LatestVersion { key })
            .await?
            .into_latest_version()
    }

    async fn fwd_propagate(&self, versions: PropagateRequest) -> ChainResult<PropagateResponse> {
        self.call(NodeRequest::FwdPropagate(versions))
            .await?
            .into_propagate()
    }

    async fn back_propagate(&self, versions: PropagateRequest) -> ChainResult<PropagateResponse> {
        self.call(NodeRequest::BackPropagate(versions))
            .await?
            .into_propagate()
    }
}

impl NodeClient for TcpNodeClient {
    fn address(&self) -> &str {
        &self.conn.peer
    }

    fn close(&self) {
        self.conn.close();
    }
}

/// A coordinator client over TCP.
pub struct TcpCoordinatorClient {
    conn: Connection,
}

impl TcpCoordinatorClient {
    /// Dials a coordinator.
    pub async fn dial(address: &str) -> ChainResult<Self> {
        let conn = Connection::dial(address).await?;
        debug!(address, "connected to coordinator");
        Ok(Self { conn })
    }

    async fn call(&self, request: CoordinatorRequest) -> ChainResult<CoordinatorResponse> {
        self.conn.call(&request).await
    }
}

#[async_trait]
impl CoordinatorService for TcpCoordinatorClient {
    async fn add_node(&self, address: String) -> ChainResult<NodeMeta> {
        self.call(CoordinatorRequest::AddNode { address })
            .await?
            .into_meta()
    }

    async fn remove_node(&self, address: String) -> ChainResult<()> {
        self.call(CoordinatorRequest::RemoveNode { address })
            .await?
            .into_ack()
    }

    async fn write(&self, key: String, value: Bytes) -> ChainResult<()> {
        self.call(CoordinatorRequest::Write { key, value })
            .await?
            .into_ack()
    }
}

impl CoordinatorClient for TcpCoordinatorClient {
    fn address(&self) -> &str {
        &self.conn.peer
    }

    fn close(&self) {
        self.conn.close();
    }
}

/// Connector producing TCP clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    /// Creates a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn node(&self, address: &str) -> ChainResult<Arc<dyn NodeClient>> {
        Ok(Arc::new(TcpNodeClient::dial(address).await?))
    }

    async fn coordinator(&self, address: &str) -> ChainResult<Arc<dyn CoordinatorClient>> {
        Ok(Arc::new(TcpCoordinatorClient::dial(address).await?))
    }
}

/// Serves the node RPC surface on `listener` until the listener fails.
pub async fn serve_node(listener: TcpListener, service: Arc<dyn NodeService>) -> ChainResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "node rpc listening");
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "accepted connection");
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = serve_node_connection(stream, service).await {
                debug!(%peer, "connection ended: {e}");
            }
        });
    }
}

async fn serve_node_connection(
    stream: TcpStream,
    service: Arc<dyn NodeService>,
) -> ChainResult<()> {
    let (mut read_half, write_half) = stream.into_split();
    let (outbox_tx, outbox_rx) = mpsc::channel::<Bytes>(OUTBOX_CAPACITY);
    spawn_writer(write_half, outbox_rx);

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let n = read_half.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        while let Some(size) = frame::frame_size(&buf) {
            let data = buf.split_to(size).freeze();
            let (id, request): (u64, NodeRequest) = frame::decode(data)?;
            let service = Arc::clone(&service);
            let outbox = outbox_tx.clone();
            tokio::spawn(async move {
                let response = dispatch_node(&*service, request).await;
                match frame::encode(id, &response) {
                    Ok(data) => {
                        let _ = outbox.send(data).await;
                    }
                    Err(e) => warn!(id, "failed to encode response: {e}"),
                }
            });
        }
    }
}

/// Serves the coordinator RPC surface on `listener` until the listener fails.
pub async fn serve_coordinator(
    listener: TcpListener,
    service: Arc<dyn CoordinatorService>,
) -> ChainResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "coordinator rpc listening");
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "accepted connection");
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = serve_coordinator_connection(stream, service).await {
                debug!(%peer, "connection ended: {e}");
            }
        });
    }
}

async fn serve_coordinator_connection(
    stream: TcpStream,
    service: Arc<dyn CoordinatorService>,
) -> ChainResult<()> {
    let (mut read_half, write_half) = stream.into_split();
    let (outbox_tx, outbox_rx) = mpsc::channel::<Bytes>(OUTBOX_CAPACITY);
    spawn_writer(write_half, outbox_rx);

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let n = read_half.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        while let Some(size) = frame::frame_size(&buf) {
            let data = buf.split_to(size).freeze();
            let (id, request): (u64, CoordinatorRequest) = frame::decode(data)?;
            let service = Arc::clone(&service);
            let outbox = outbox_tx.clone();
            tokio::spawn(async move {
                let response = dispatch_coordinator(&*service, request).await;
                match frame::encode(id, &response) {
                    Ok(data) => {
                        let _ = outbox.send(data).await;
                    }
                    Err(e) => warn!(id, "failed to encode response: {e}"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// A node service that records writes and serves them back.
    #[derive(Default)]
    struct EchoNode {
        items: Mutex<HashMap<String, Bytes>>,
    }

    #[async_trait]
    impl NodeService for EchoNode {
        async fn ping(&self) -> ChainResult<()> {
            Ok(())
        }

        async fn update(&self, _meta: NodeMeta) -> ChainResult<()> {
            Ok(())
        }

        async fn client_write(&self, key: String, value: Bytes) -> ChainResult<()> {
            self.items.lock().insert(key, value);
            Ok(())
        }

        async fn write(&self, key: String, value: Bytes, _version: Version) -> ChainResult<()> {
            self.items.lock().insert(key, value);
            Ok(())
        }

        async fn commit(&self, _key: String, _version: Version) -> ChainResult<()> {
            Ok(())
        }

        async fn read(&self, key: String) -> ChainResult<KeyValue> {
            let items = self.items.lock();
            let value = items
                .get(&key)
                .cloned()
                .ok_or_else(|| ChainError::key_not_found(&key))?;
            Ok(KeyValue::new(key, value))
        }

        async fn read_all(&self) -> ChainResult<Vec<KeyValue>> {
            Ok(self
                .items
                .lock()
                .iter()
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
                .collect())
        }

        async fn latest_version(&self, key: String) -> ChainResult<(String, Version)> {
            Ok((key, 0))
        }

        async fn fwd_propagate(
            &self,
            _versions: PropagateRequest,
        ) -> ChainResult<PropagateResponse> {
            Ok(PropagateResponse::new())
        }

        async fn back_propagate(
            &self,
            _versions: PropagateRequest,
        ) -> ChainResult<PropagateResponse> {
            Ok(PropagateResponse::new())
        }
    }

    async fn spawn_echo_node() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_node(listener, Arc::new(EchoNode::default())));
        address
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let address = spawn_echo_node().await;
        let client = TcpNodeClient::dial(&address).await.unwrap();

        client.ping().await.unwrap();
        client
            .client_write("k".to_owned(), Bytes::from_static(b"v"))
            .await
            .unwrap();

        let kv = client.read("k".to_owned()).await.unwrap();
        assert_eq!(kv.value, Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn test_semantic_error_survives_transport() {
        let address = spawn_echo_node().await;
        let client = TcpNodeClient::dial(&address).await.unwrap();

        let err = client.read("ghost".to_owned()).await.unwrap_err();
        assert_eq!(err, ChainError::key_not_found("ghost"));
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_connection() {
        let address = spawn_echo_node().await;
        let client = Arc::new(TcpNodeClient::dial(&address).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                let key = format!("k{i}");
                let value = Bytes::from(format!("v{i}"));
                client.client_write(key.clone(), value.clone()).await.unwrap();
                let kv = client.read(key).await.unwrap();
                assert_eq!(kv.value, value);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_dial_unreachable_address() {
        // Port 1 is essentially never listening.
        let err = TcpNodeClient::dial("127.0.0.1:1").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let address = spawn_echo_node().await;
        let client = TcpNodeClient::dial(&address).await.unwrap();

        NodeClient::close(&client);
        let err = client.ping().await.unwrap_err();
        assert!(err.is_transport());
    }
}
