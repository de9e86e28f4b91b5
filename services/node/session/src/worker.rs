//! Connection worker: one per accepted or dialed connection.
//!
//! After the HI exchange the worker runs three cooperating tasks. The
//! reader drains the transport into the frame assembler, the handler
//! forwards assembled messages to the node loop, and the writer drains the
//! peer's durable queue plus an immediate control-frame channel into the
//! transport. Any task ending tears the connection down and reports
//! `Disconnected`.

use crate::handshake::exchange_hi;
use crate::peer_url::{PeerUrl, Scheme};
use crate::transport::{self, Connection, ConnectionReader, ConnectionWriter, TlsClientConfig, TlsServer};
use crate::SessionError;
use bytes::Bytes;
use receptor_queue::{PeerQueue, QueueSet};
use receptor_wire::{AssembledMessage, Command, FramedBuffer, FramedMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// Fixed delay between dial attempts when `reconnect` is set.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long a winding-down writer may keep flushing before it is aborted.
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Events a worker reports to the node loop.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Handshake completed; the control channel reaches this worker's writer.
    Connected {
        /// Peer node id from HI (verified against the certificate when TLS)
        peer_id: String,
        /// Peer capability map
        capabilities: HashMap<String, serde_json::Value>,
        /// Channel for control frames to this peer
        control: mpsc::Sender<Bytes>,
    },
    /// Connection ended; the direct edge should be marked dead.
    Disconnected {
        /// Peer node id
        peer_id: String,
    },
    /// A control command arrived from the peer.
    Command {
        /// Peer node id
        peer_id: String,
        /// Decoded command
        command: Command,
    },
    /// A routed message arrived from the peer.
    Message {
        /// Peer node id it arrived from
        peer_id: String,
        /// The assembled message
        message: FramedMessage,
    },
}

/// Everything a worker needs from the node that owns it.
#[derive(Clone)]
pub struct WorkerContext {
    /// Local node id sent in HI
    pub node_id: String,
    /// Local capability map sent in HI
    pub capabilities: HashMap<String, serde_json::Value>,
    /// Durable queues, one drained per connected peer
    pub queues: Arc<QueueSet>,
    /// Event channel back to the node loop
    pub events: mpsc::Sender<WorkerEvent>,
}

/// Drive one established connection to completion.
///
/// `expected_id` pins the peer's HI id to its certificate identity on
/// TLS-accepted connections.
pub async fn run_connection(
    ctx: &WorkerContext,
    mut conn: Connection,
    expected_id: Option<String>,
    initiator: bool,
) -> Result<(), SessionError> {
    let mut assembler = FramedBuffer::new();
    let (peer, held) =
        exchange_hi(&mut conn, &mut assembler, &ctx.node_id, &ctx.capabilities, initiator).await?;

    if let Some(expected) = expected_id {
        if expected != peer.id {
            return Err(SessionError::Protocol(format!(
                "certificate identity {:?} does not match HI id {:?}",
                expected, peer.id
            )));
        }
    }

    let peer_id = peer.id.clone();
    info!(peer = %peer_id, initiator, "peer connected");

    let queue = ctx.queues.for_peer(&peer_id)?;
    let (control_tx, control_rx) = mpsc::channel::<Bytes>(64);
    ctx.events
        .send(WorkerEvent::Connected {
            peer_id: peer_id.clone(),
            capabilities: peer.capabilities,
            control: control_tx,
        })
        .await
        .map_err(|_| SessionError::Closed)?;

    // Messages that rode in on the same chunks as HI.
    for message in held {
        if dispatch(&ctx.events, &peer_id, message).await.is_err() {
            return Err(SessionError::Closed);
        }
    }

    let (reader, writer) = conn.split();
    let shutdown = Arc::new(Notify::new());
    let (asm_tx, asm_rx) = mpsc::channel::<AssembledMessage>(64);

    let mut reader_task = tokio::spawn(read_loop(reader, assembler, asm_tx));
    let mut handler_task = tokio::spawn(handle_loop(asm_rx, ctx.events.clone(), peer_id.clone()));
    let mut writer_task = tokio::spawn(write_loop(writer, queue, control_rx, shutdown.clone()));

    // Any task ending (EOF, send failure, node loop gone) tears the
    // connection down.
    let mut writer_done = false;
    let result = tokio::select! {
        r = &mut reader_task => flatten_join(r),
        _ = &mut handler_task => Ok(()),
        w = &mut writer_task => {
            writer_done = true;
            flatten_join(w)
        }
    };
    reader_task.abort();
    handler_task.abort();
    if !writer_done {
        // Let the writer flush in-flight sends before it is aborted.
        shutdown.notify_one();
        if tokio::time::timeout(WRITER_GRACE, &mut writer_task).await.is_err() {
            writer_task.abort();
        }
    }

    info!(peer = %peer_id, "peer disconnected");
    let _ = ctx
        .events
        .send(WorkerEvent::Disconnected {
            peer_id: peer_id.clone(),
        })
        .await;

    result
}

/// Dial a peer, optionally redialing forever with a fixed backoff.
pub async fn dial_peer(
    ctx: WorkerContext,
    url: PeerUrl,
    tls: Option<TlsClientConfig>,
    reconnect: bool,
) {
    loop {
        match transport::connect(&url, tls.as_ref()).await {
            Ok(conn) => {
                if let Err(e) = run_connection(&ctx, conn, None, true).await {
                    warn!(peer = %url, error = %e, "connection ended");
                }
            }
            Err(e) => {
                warn!(peer = %url, error = %e, "connect failed");
            }
        }

        if !reconnect || ctx.events.is_closed() {
            break;
        }
        debug!(peer = %url, delay = ?RECONNECT_DELAY, "scheduling reconnect");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Accept loop for one listener; each connection gets its own worker task.
pub async fn run_listener(
    ctx: WorkerContext,
    listener: TcpListener,
    scheme: Scheme,
    tls: Option<Arc<TlsServer>>,
) {
    loop {
        let (tcp, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let conn_ctx = ctx.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let (conn, cert) = match transport::accept(scheme, tcp, tls.as_deref()).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(%addr, error = %e, "transport setup failed");
                    return;
                }
            };

            let expected_id = match peer_identity(cert) {
                Ok(id) => id,
                Err(e) => {
                    warn!(%addr, error = %e, "rejecting peer certificate");
                    return;
                }
            };

            if let Err(e) = run_connection(&conn_ctx, conn, expected_id, false).await {
                debug!(%addr, error = %e, "inbound connection ended");
            }
        });

        if ctx.events.is_closed() {
            break;
        }
    }
}

/// Identity pinned by a presented certificate, if any.
#[cfg(feature = "tls")]
fn peer_identity(cert: Option<Vec<u8>>) -> Result<Option<String>, SessionError> {
    match cert {
        Some(der) => transport::tls::extract_common_name(&der).map(Some),
        None => Ok(None),
    }
}

#[cfg(not(feature = "tls"))]
fn peer_identity(_cert: Option<Vec<u8>>) -> Result<Option<String>, SessionError> {
    Ok(None)
}

async fn read_loop(
    mut reader: ConnectionReader,
    mut assembler: FramedBuffer,
    out: mpsc::Sender<AssembledMessage>,
) -> Result<(), SessionError> {
    while let Some(chunk) = reader.recv().await? {
        for message in assembler.feed(&chunk)? {
            if out.send(message).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn handle_loop(
    mut messages: mpsc::Receiver<AssembledMessage>,
    events: mpsc::Sender<WorkerEvent>,
    peer_id: String,
) {
    while let Some(message) = messages.recv().await {
        if dispatch(&events, &peer_id, message).await.is_err() {
            break;
        }
    }
}

async fn dispatch(
    events: &mpsc::Sender<WorkerEvent>,
    peer_id: &str,
    message: AssembledMessage,
) -> Result<(), mpsc::error::SendError<WorkerEvent>> {
    let event = match message {
        AssembledMessage::Framed(message) => WorkerEvent::Message {
            peer_id: peer_id.to_string(),
            message,
        },
        AssembledMessage::Command { command, .. } => WorkerEvent::Command {
            peer_id: peer_id.to_string(),
            command,
        },
    };
    events.send(event).await
}

/// Writer: control frames take priority over the durable queue. A queue
/// entry whose send fails is reinserted at the head before the connection
/// is torn down.
async fn write_loop(
    mut writer: ConnectionWriter,
    queue: PeerQueue,
    mut control_rx: mpsc::Receiver<Bytes>,
    shutdown: Arc<Notify>,
) -> Result<(), SessionError> {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                let _ = writer.close().await;
                return Ok(());
            }

            maybe = control_rx.recv() => {
                match maybe {
                    Some(bytes) => writer.send(bytes).await?,
                    None => {
                        let _ = writer.close().await;
                        return Ok(());
                    }
                }
            }

            handle = queue.get() => {
                let Some(bytes) = queue.read(&handle)? else {
                    continue;
                };
                if let Err(e) = writer.send(bytes).await {
                    queue.put_ident(handle);
                    return Err(e);
                }
                queue.close(handle)?;
            }
        }
    }
}

fn flatten_join(res: Result<Result<(), SessionError>, JoinError>) -> Result<(), SessionError> {
    match res {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(SessionError::Protocol(format!("worker task failed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::listen_tcp;
    use receptor_wire::{encode_command, encode_framed_message, OuterHeader};
    use tempfile::TempDir;
    use uuid::Uuid;

    struct TestNode {
        ctx: WorkerContext,
        events: mpsc::Receiver<WorkerEvent>,
        _dir: TempDir,
    }

    fn test_node(node_id: &str) -> TestNode {
        let dir = TempDir::new().unwrap();
        let queues = Arc::new(QueueSet::open(dir.path(), node_id).unwrap());
        let (tx, rx) = mpsc::channel(64);
        TestNode {
            ctx: WorkerContext {
                node_id: node_id.to_string(),
                capabilities: HashMap::new(),
                queues,
                events: tx,
            },
            events: rx,
            _dir: dir,
        }
    }

    async fn expect_connected(node: &mut TestNode) -> (String, mpsc::Sender<Bytes>) {
        loop {
            match node.events.recv().await.unwrap() {
                WorkerEvent::Connected {
                    peer_id, control, ..
                } => return (peer_id, control),
                other => panic!("expected Connected, got {:?}", other),
            }
        }
    }

    /// Full worker pair over loopback: handshake, queued message delivery,
    /// and a control frame in the other direction.
    #[tokio::test]
    async fn test_worker_pair_end_to_end() {
        let mut server = test_node("server-node");
        let mut client = test_node("client-node");

        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_listener(
            server.ctx.clone(),
            listener,
            Scheme::Rnp,
            None,
        ));

        let url = PeerUrl::parse_peer(&format!("rnp://{}", addr)).unwrap();
        tokio::spawn(dial_peer(client.ctx.clone(), url, None, false));

        let (server_peer, server_control) = expect_connected(&mut server).await;
        let (client_peer, _client_control) = expect_connected(&mut client).await;
        assert_eq!(server_peer, "client-node");
        assert_eq!(client_peer, "server-node");

        // Client enqueues a framed message; its writer drains it across.
        let header = OuterHeader::new("client-node", "server-node");
        let bytes =
            encode_framed_message(Uuid::new_v4().as_u128(), &header, b"work payload").unwrap();
        client
            .ctx
            .queues
            .for_peer("server-node")
            .unwrap()
            .put(&bytes)
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), server.events.recv())
            .await
            .unwrap()
            .unwrap();
        match received {
            WorkerEvent::Message { peer_id, message } => {
                assert_eq!(peer_id, "client-node");
                assert_eq!(message.header.sender, "client-node");
                assert_eq!(&message.payload[..], b"work payload");
            }
            other => panic!("expected Message, got {:?}", other),
        }

        // Server pushes a ROUTE over the control channel.
        let route = Command::ROUTE {
            id: "server-node".to_string(),
            edges: vec![(
                "server-node".to_string(),
                "client-node".to_string(),
                Some(1),
            )],
            seen: vec!["server-node".to_string()],
        };
        let bytes = encode_command(Uuid::new_v4().as_u128(), &route).unwrap();
        server_control.send(bytes).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), client.events.recv())
            .await
            .unwrap()
            .unwrap();
        match received {
            WorkerEvent::Command {
                peer_id,
                command: Command::ROUTE { id, edges, .. },
            } => {
                assert_eq!(peer_id, "server-node");
                assert_eq!(id, "server-node");
                assert_eq!(edges.len(), 1);
            }
            other => panic!("expected ROUTE command, got {:?}", other),
        }
    }

    /// Disconnect must surface as a Disconnected event on the other side.
    #[tokio::test]
    async fn test_disconnect_reported() {
        let mut server = test_node("server-node");
        let client = test_node("client-node");

        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_listener(
            server.ctx.clone(),
            listener,
            Scheme::Rnp,
            None,
        ));

        let url = PeerUrl::parse_peer(&format!("rnp://{}", addr)).unwrap();
        let dialer = tokio::spawn(dial_peer(client.ctx.clone(), url, None, false));

        let _ = expect_connected(&mut server).await;

        // Drop the client's event receiver so its worker loop ends.
        drop(client.events);
        drop(client.ctx);
        let _ = dialer.await;

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match server.events.recv().await.unwrap() {
                    WorkerEvent::Disconnected { peer_id } => return peer_id,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, "client-node");
    }
}
