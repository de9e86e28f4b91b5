//! End-to-end mesh tests over real TCP sockets.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use receptor_router::{Node, NodeConfig, NodeHandle, NodeStatus, NoopSecurity, WorkHandler};
use receptor_wire::{InnerEnvelope, MessageType};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const DEADLINE: Duration = Duration::from_secs(15);

struct TestNode {
    handle: NodeHandle,
    _data: TempDir,
}

async fn start_node(id: &str, listen: bool, peers: Vec<String>) -> TestNode {
    let data = TempDir::new().unwrap();
    let mut config = NodeConfig::new(id, data.path());
    if listen {
        config.listen.push("rnp://127.0.0.1:0".to_string());
    }
    config.peers = peers;
    let handle = Node::start(config, Arc::new(NoopSecurity)).await.unwrap();
    TestNode { handle, _data: data }
}

fn peer_url(node: &TestNode) -> String {
    format!("rnp://{}", node.handle.local_addrs()[0])
}

async fn wait_for_route(node: &TestNode, dest: &str) {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    while !node.handle.status().routing_table.contains_key(dest) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} never learned a route to {}",
            node.handle.node_id(),
            dest
        );
        sleep(Duration::from_millis(50)).await;
    }
}

async fn recv_within(stream: &mut mpsc::Receiver<InnerEnvelope>) -> InnerEnvelope {
    timeout(DEADLINE, stream.recv())
        .await
        .expect("timed out waiting for a response")
        .expect("response stream closed early")
}

#[derive(serde::Deserialize)]
struct Pong {
    initial_time: Option<DateTime<Utc>>,
    response_time: Option<DateTime<Utc>>,
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_node_ping() {
    let a = start_node("alpha", true, vec![]).await;
    let b = start_node("beta", false, vec![peer_url(&a)]).await;
    wait_for_route(&b, "alpha").await;
    wait_for_route(&a, "beta").await;

    let sent_at = Utc::now();
    let payload = serde_json::to_vec(&serde_json::json!({ "initial_time": sent_at })).unwrap();
    let (message_id, mut stream) = b
        .handle
        .send_directive("alpha", "receptor:ping", Bytes::from(payload), None)
        .await
        .unwrap();

    let response = recv_within(&mut stream).await;
    assert_eq!(response.message_type, MessageType::Response);
    assert_eq!(response.serial, Some(1));
    assert_eq!(response.in_response_to.as_deref(), Some(message_id.as_str()));
    assert_eq!(response.sender, "alpha");
    let pong: Pong = serde_json::from_slice(&response.raw_payload).unwrap();
    assert_eq!(pong.initial_time, Some(sent_at));
    assert!(pong.response_time.is_some());

    let eof = recv_within(&mut stream).await;
    assert_eq!(eof.message_type, MessageType::Eof);
    assert_eq!(eof.serial, Some(2));
    assert_eq!(eof.code, Some(0));
    assert!(stream.recv().await.is_none());

    b.handle.shutdown().await;
    a.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_node_forwarding() {
    let a = start_node("alpha", true, vec![]).await;
    let b = start_node("beta", true, vec![peer_url(&a)]).await;
    let c = start_node("gamma", false, vec![peer_url(&b)]).await;

    // Both endpoints need a converged view: gamma to reach alpha and
    // alpha to route the responses back.
    wait_for_route(&c, "alpha").await;
    wait_for_route(&a, "gamma").await;

    let (message_id, mut stream) = c
        .handle
        .send_directive("alpha", "receptor:ping", Bytes::new(), None)
        .await
        .unwrap();

    let response = recv_within(&mut stream).await;
    assert_eq!(response.sender, "alpha");
    assert_eq!(response.in_response_to.as_deref(), Some(message_id.as_str()));
    let eof = recv_within(&mut stream).await;
    assert_eq!(eof.code, Some(0));

    // The middle node carried at least the directive and one reply.
    assert!(b.handle.status().stats.forwarded >= 2);
    assert!(c.handle.status().known_nodes.contains(&"alpha".to_string()));

    c.handle.shutdown().await;
    b.handle.shutdown().await;
    a.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_directive_gets_error_eof() {
    let a = start_node("alpha", true, vec![]).await;
    let b = start_node("beta", false, vec![peer_url(&a)]).await;
    wait_for_route(&b, "alpha").await;
    wait_for_route(&a, "beta").await;

    let (_, mut stream) = b
        .handle
        .send_directive("alpha", "nosuch:thing", Bytes::new(), None)
        .await
        .unwrap();

    let eof = recv_within(&mut stream).await;
    assert_eq!(eof.message_type, MessageType::Eof);
    assert_ne!(eof.code, Some(0));
    assert!(String::from_utf8_lossy(&eof.raw_payload).contains("nosuch"));
    assert!(stream.recv().await.is_none());

    b.handle.shutdown().await;
    a.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_directive_reports_remote_view() {
    let a = start_node("alpha", true, vec![]).await;
    let b = start_node("beta", false, vec![peer_url(&a)]).await;
    wait_for_route(&b, "alpha").await;
    wait_for_route(&a, "beta").await;

    let (_, mut stream) = b
        .handle
        .send_directive("alpha", "receptor:status", Bytes::new(), None)
        .await
        .unwrap();

    let response = recv_within(&mut stream).await;
    let status: NodeStatus = serde_yaml::from_slice(&response.raw_payload).unwrap();
    assert_eq!(status.node_id, "alpha");
    assert!(status.known_nodes.contains(&"beta".to_string()));
    assert!(status.connections.contains(&"beta".to_string()));

    let eof = recv_within(&mut stream).await;
    assert_eq!(eof.code, Some(0));

    b.handle.shutdown().await;
    a.handle.shutdown().await;
}

struct Echo;

#[async_trait]
impl WorkHandler for Echo {
    async fn start(
        &self,
        action: &str,
        directive: &InnerEnvelope,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Bytes>>> {
        anyhow::ensure!(action == "echo", "unknown action {action:?}");
        let payload = directive.raw_payload.clone();
        Ok(futures::stream::once(async move { Ok(payload) }).boxed())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_application_handler_echoes_payload() {
    let a = start_node("alpha", true, vec![]).await;
    a.handle.register_handler("demo", Arc::new(Echo));
    let b = start_node("beta", false, vec![peer_url(&a)]).await;
    wait_for_route(&b, "alpha").await;
    wait_for_route(&a, "beta").await;

    let (_, mut stream) = b
        .handle
        .send_directive("alpha", "demo:echo", Bytes::from_static(b"hello mesh"), None)
        .await
        .unwrap();

    let response = recv_within(&mut stream).await;
    assert_eq!(&response.raw_payload[..], b"hello mesh");
    let eof = recv_within(&mut stream).await;
    assert_eq!(eof.code, Some(0));

    b.handle.shutdown().await;
    a.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lost_peer_expires_from_routing_table() {
    let a_data = TempDir::new().unwrap();
    let mut a_config = NodeConfig::new("alpha", a_data.path());
    a_config.listen.push("rnp://127.0.0.1:0".to_string());
    a_config.dead_cost = 25;
    a_config.expiry_interval = Duration::from_secs(2);
    let a = Node::start(a_config, Arc::new(NoopSecurity)).await.unwrap();

    let b_data = TempDir::new().unwrap();
    let mut b_config = NodeConfig::new("beta", b_data.path());
    b_config.peers = vec![format!("rnp://{}", a.local_addrs()[0])];
    b_config.reconnect = false;
    let b = Node::start(b_config, Arc::new(NoopSecurity)).await.unwrap();

    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        let table = a.status().routing_table;
        if table.get("beta").is_some_and(|r| r.cost == 1) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "beta never connected");
        sleep(Duration::from_millis(50)).await;
    }

    b.shutdown().await;

    // On disconnect the direct edge jumps to the configured dead cost and
    // stays routable until the expiry sweep removes it.
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        let table = a.status().routing_table;
        if table.get("beta").is_some_and(|r| r.cost == 25) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "edge to beta never marked dead"
        );
        sleep(Duration::from_millis(50)).await;
    }

    // Within the expiry interval plus one sweep, beta is gone entirely.
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        let status = a.status();
        if !status.routing_table.contains_key("beta")
            && !status.known_nodes.contains(&"beta".to_string())
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "dead edge to beta never expired"
        );
        sleep(Duration::from_millis(50)).await;
    }
    assert!(!a.status().connections.contains(&"beta".to_string()));

    a.shutdown().await;
}
