//! End-to-end smoke test over real TCP sockets.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;

use craq_client::Client;
use craq_coordinator::Coordinator;
use craq_node::{Node, NodeOpts};
use craq_store::MemoryStore;
use craq_transport::{serve_coordinator, serve_node, NodeService, TcpConnector};

async fn bind_ephemeral() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    (listener, address)
}

async fn spawn_tcp_node(coordinator_addr: &str) -> Arc<Node> {
    let (listener, address) = bind_ephemeral().await;
    let node = Node::new(NodeOpts {
        pub_address: address,
        coordinator: coordinator_addr.to_owned(),
        store: Arc::new(MemoryStore::new()),
        connector: Arc::new(TcpConnector::new()),
    });
    let service: Arc<dyn NodeService> = node.clone();
    tokio::spawn(serve_node(listener, service));
    node.start().await.unwrap();
    node
}

#[tokio::test]
async fn chain_over_tcp() {
    let (listener, coordinator_addr) = bind_ephemeral().await;
    let coordinator = Coordinator::new(Arc::new(TcpConnector::new()));
    tokio::spawn(serve_coordinator(listener, coordinator.clone()));

    let a = spawn_tcp_node(&coordinator_addr).await;
    let b = spawn_tcp_node(&coordinator_addr).await;

    assert!(a.is_head().await);
    assert!(b.is_tail().await);

    let client = Client::new(
        &coordinator_addr,
        a.pub_address(),
        Arc::new(TcpConnector::new()),
    );

    client.write("k", Bytes::from_static(b"v1")).await.unwrap();
    let kv = client.read("k").await.unwrap();
    assert_eq!(kv.value, Bytes::from_static(b"v1"));

    // Both replicas hold the committed value.
    let kv = b.read("k".to_owned()).await.unwrap();
    assert_eq!(kv.value, Bytes::from_static(b"v1"));

    // A second write advances the version on the same connection.
    client.write("k", Bytes::from_static(b"v2")).await.unwrap();
    let all = client.read_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].value, Bytes::from_static(b"v2"));
}

#[tokio::test]
async fn late_joiner_catches_up_over_tcp() {
    let (listener, coordinator_addr) = bind_ephemeral().await;
    let coordinator = Coordinator::new(Arc::new(TcpConnector::new()));
    tokio::spawn(serve_coordinator(listener, coordinator.clone()));

    let _a = spawn_tcp_node(&coordinator_addr).await;

    let client = Client::new(&coordinator_addr, "unused", Arc::new(TcpConnector::new()));
    client.write("k1", Bytes::from_static(b"v1")).await.unwrap();

    let b = spawn_tcp_node(&coordinator_addr).await;
    let all = b.read_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].key, "k1");
}
