//! Node orchestration: the event loop tying workers, graph, and router
//! together.

use crate::control::{NodeStatus, ReceptorControl, RouteEntry, StatusProvider};
use crate::registry::ResponseRegistry;
use crate::router::{MessageRouter, RouterStats};
use crate::security::SecurityManager;
use crate::work::{WorkDispatcher, WorkHandler};
use crate::RouterError;
use bytes::Bytes;
use chrono::Utc;
use receptor_mesh::{MeshGraph, DEFAULT_DEAD_COST, DEFAULT_EXPIRY_INTERVAL};
use receptor_queue::QueueSet;
use receptor_session::{
    dial_peer, listen_tcp, run_listener, ConnectionRegistry, PeerUrl, SessionError,
    TlsClientConfig, TlsServer, WorkerContext, WorkerEvent,
};
use receptor_wire::{encode_command, Command, EdgeUpdate, InnerEnvelope};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_DEPTH: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const KEEPALIVE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to start a node.
pub struct NodeConfig {
    /// Node id announced in HI and used as the envelope sender
    pub node_id: String,
    /// Directory holding the durable queues
    pub data_dir: PathBuf,
    /// Listener URLs (`rnp://`, `rnps://`, `ws://`, `wss://`)
    pub listen: Vec<String>,
    /// Peer URLs to dial
    pub peers: Vec<String>,
    /// Redial dropped outbound peers
    pub reconnect: bool,
    /// Ping every known destination at this interval; `None` disables
    pub keepalive_interval: Option<Duration>,
    /// Cost a direct edge is raised to on disconnect
    pub dead_cost: u32,
    /// How long dead edges linger before removal
    pub expiry_interval: Duration,
    /// Capability map announced in HI
    pub capabilities: HashMap<String, serde_json::Value>,
    /// Client TLS material for `rnps`/`wss` dials
    pub tls_client: Option<TlsClientConfig>,
    /// Server TLS material for `rnps`/`wss` listeners
    pub tls_server: Option<Arc<TlsServer>>,
}

impl NodeConfig {
    /// Config with defaults: no listeners, no peers, reconnect on.
    pub fn new(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            data_dir: data_dir.into(),
            listen: Vec::new(),
            peers: Vec::new(),
            reconnect: true,
            keepalive_interval: None,
            dead_cost: DEFAULT_DEAD_COST,
            expiry_interval: DEFAULT_EXPIRY_INTERVAL,
            capabilities: HashMap::new(),
            tls_client: None,
            tls_server: None,
        }
    }
}

struct SharedState {
    node_id: String,
    graph: Arc<Mutex<MeshGraph>>,
    connections: Arc<ConnectionRegistry>,
    queues: Arc<QueueSet>,
    stats: Arc<RouterStats>,
}

impl StatusProvider for SharedState {
    fn snapshot(&self) -> NodeStatus {
        let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
        NodeStatus {
            node_id: self.node_id.clone(),
            known_nodes: graph.known_nodes(),
            routing_table: graph
                .routing_table()
                .iter()
                .map(|(d, (hop, cost))| {
                    (
                        d.clone(),
                        RouteEntry {
                            via: hop.clone(),
                            cost: *cost,
                        },
                    )
                })
                .collect(),
            connections: self.connections.peers(),
            queued_messages: self.queues.pending_total(),
            stats: self.stats.snapshot(),
        }
    }
}

/// A running mesh node.
///
/// Constructed through [`Node::start`], which spawns the listeners, dialers,
/// and the event loop, and hands back a [`NodeHandle`].
pub struct Node {
    state: Arc<SharedState>,
    router: Arc<MessageRouter>,
    dispatcher: Arc<WorkDispatcher>,
    responses: Arc<ResponseRegistry>,
    events: mpsc::Receiver<WorkerEvent>,
    directives: mpsc::Receiver<InnerEnvelope>,
    keepalive_interval: Option<Duration>,
    shutdown: Arc<Notify>,
}

impl Node {
    /// Start the node: open queues, bind listeners, dial peers, and run the
    /// event loop.
    pub async fn start(
        config: NodeConfig,
        security: Arc<dyn SecurityManager>,
    ) -> Result<NodeHandle, RouterError> {
        let node_id = config.node_id.clone();
        let queues = Arc::new(QueueSet::open(&config.data_dir, &node_id)?);
        let graph = Arc::new(Mutex::new(MeshGraph::with_thresholds(
            &node_id,
            config.dead_cost,
            config.expiry_interval,
        )));
        let connections = Arc::new(ConnectionRegistry::new());
        let stats = Arc::new(RouterStats::default());
        let responses = Arc::new(ResponseRegistry::new());

        let (directive_tx, directive_rx) = mpsc::channel(EVENT_DEPTH);
        let router = Arc::new(MessageRouter::new(
            &node_id,
            graph.clone(),
            queues.clone(),
            responses.clone(),
            security,
            directive_tx,
            stats.clone(),
        ));

        let state = Arc::new(SharedState {
            node_id: node_id.clone(),
            graph,
            connections,
            queues: queues.clone(),
            stats,
        });

        let dispatcher = Arc::new(WorkDispatcher::new(&node_id));
        dispatcher.register("receptor", Arc::new(ReceptorControl::new(state.clone())));

        let (event_tx, event_rx) = mpsc::channel(EVENT_DEPTH);
        let ctx = WorkerContext {
            node_id: node_id.clone(),
            capabilities: config.capabilities,
            queues,
            events: event_tx,
        };

        let mut bound = Vec::with_capacity(config.listen.len());
        for url in &config.listen {
            let parsed = PeerUrl::parse_listen(url)?;
            if parsed.scheme.is_tls() && config.tls_server.is_none() {
                return Err(RouterError::Session(SessionError::Tls(format!(
                    "listener {url} requires TLS material"
                ))));
            }
            let listener = listen_tcp(&parsed.authority()).await?;
            let addr = listener.local_addr().map_err(SessionError::Io)?;
            info!(%addr, scheme = %parsed.scheme, "listening");
            bound.push(addr);
            tokio::spawn(run_listener(
                ctx.clone(),
                listener,
                parsed.scheme,
                config.tls_server.clone(),
            ));
        }

        for url in &config.peers {
            let parsed = PeerUrl::parse_peer(url)?;
            if parsed.scheme.is_tls() && config.tls_client.is_none() {
                return Err(RouterError::Session(SessionError::Tls(format!(
                    "peer {url} requires TLS material"
                ))));
            }
            tokio::spawn(dial_peer(
                ctx.clone(),
                parsed,
                config.tls_client.clone(),
                config.reconnect,
            ));
        }

        let shutdown = Arc::new(Notify::new());
        let node = Node {
            state: state.clone(),
            router: router.clone(),
            dispatcher: dispatcher.clone(),
            responses: responses.clone(),
            events: event_rx,
            directives: directive_rx,
            keepalive_interval: config.keepalive_interval,
            shutdown: shutdown.clone(),
        };
        let join = tokio::spawn(node.run());

        Ok(NodeHandle {
            node_id,
            state,
            router,
            dispatcher,
            responses,
            bound,
            shutdown,
            join,
        })
    }

    async fn run(mut self) {
        let (reply_tx, mut reply_rx) = mpsc::channel::<InnerEnvelope>(EVENT_DEPTH);
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut keepalive = self.keepalive_interval.map(|period| {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            timer
        });

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,

                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }

                Some(directive) = self.directives.recv() => {
                    self.dispatcher.dispatch(directive, reply_tx.clone());
                }

                Some(reply) = reply_rx.recv() => {
                    if let Err(e) = self.router.send(reply).await {
                        warn!(error = %e, "failed to route handler reply");
                    }
                }

                _ = sweep.tick() => {
                    self.sweep().await;
                }

                _ = tick_opt(&mut keepalive) => {
                    self.keepalive().await;
                }
            }
        }

        info!(node = %self.state.node_id, "node loop stopped");
        if let Err(e) = self.state.queues.sync_all() {
            error!(error = %e, "queue sync on shutdown failed");
        }
    }

    async fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Connected { peer_id, capabilities, control } => {
                debug!(peer = %peer_id, ?capabilities, "peer session up");
                self.state.connections.register(&peer_id, control);
                let (snapshot, changed) = {
                    let mut graph = self.state.graph.lock().unwrap_or_else(|e| e.into_inner());
                    let changed = graph.add_or_update_edges(&[(
                        self.state.node_id.clone(),
                        peer_id.clone(),
                        Some(1),
                    )]);
                    (graph.edges_snapshot(), changed)
                };

                // Full sync to the new peer, then gossip the new edge.
                self.send_route(&peer_id, snapshot, vec![self.state.node_id.clone(), peer_id.clone()])
                    .await;
                if changed {
                    self.advertise(
                        vec![(self.state.node_id.clone(), peer_id.clone(), Some(1))],
                        vec![peer_id.clone()],
                    )
                    .await;
                }
            }

            WorkerEvent::Disconnected { peer_id } => {
                info!(peer = %peer_id, "peer session down");
                self.state.connections.unregister(&peer_id);
                let dead_cost = {
                    let mut graph = self.state.graph.lock().unwrap_or_else(|e| e.into_inner());
                    graph.mark_dead(&peer_id);
                    graph.dead_cost()
                };
                self.advertise(
                    vec![(self.state.node_id.clone(), peer_id.clone(), Some(dead_cost))],
                    vec![peer_id],
                )
                .await;
            }

            WorkerEvent::Command { peer_id, command } => match command {
                Command::ROUTE { id, edges, seen } => {
                    let changed = {
                        let mut graph =
                            self.state.graph.lock().unwrap_or_else(|e| e.into_inner());
                        graph.apply_advert(&id, &edges)
                    };
                    if changed {
                        self.advertise(edges, seen).await;
                    }
                }
                Command::HI { id, .. } => {
                    warn!(peer = %peer_id, id, "unexpected HI after handshake");
                }
            },

            WorkerEvent::Message { peer_id, message } => {
                if let Err(e) = self.router.route(message).await {
                    warn!(from = %peer_id, error = %e, "failed to route message");
                }
            }
        }
    }

    /// Gossip `edges` to every connected peer not already in `seen`.
    async fn advertise(&self, edges: Vec<EdgeUpdate>, mut seen: Vec<String>) {
        if !seen.contains(&self.state.node_id) {
            seen.push(self.state.node_id.clone());
        }
        let targets: Vec<String> = self
            .state
            .connections
            .peers()
            .into_iter()
            .filter(|p| !seen.contains(p))
            .collect();
        if targets.is_empty() {
            return;
        }
        seen.extend(targets.iter().cloned());
        for target in &targets {
            self.send_route(target, edges.clone(), seen.clone()).await;
        }
    }

    async fn send_route(&self, peer_id: &str, edges: Vec<EdgeUpdate>, seen: Vec<String>) {
        let command = Command::ROUTE {
            id: self.state.node_id.clone(),
            edges,
            seen,
        };
        match encode_command(Uuid::new_v4().as_u128(), &command) {
            Ok(bytes) => {
                if !self.state.connections.send_control(peer_id, bytes).await {
                    debug!(peer = %peer_id, "route advertisement not delivered");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode route advertisement"),
        }
    }

    async fn sweep(&self) {
        let removed = {
            let mut graph = self.state.graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.sweep_expired()
        };
        if !removed.is_empty() {
            info!(edges = removed.len(), "expired dead edges");
            self.advertise(removed, Vec::new()).await;
        }
    }

    /// Ping every destination in the routing table and drain the replies.
    async fn keepalive(&self) {
        let destinations: Vec<String> = {
            let graph = self.state.graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.routing_table().keys().cloned().collect()
        };
        for dest in destinations {
            let payload = serde_json::json!({ "initial_time": Utc::now() });
            let body = match serde_json::to_vec(&payload) {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "failed to encode keepalive ping");
                    continue;
                }
            };
            let mut envelope = InnerEnvelope::directive(
                &self.state.node_id,
                &dest,
                "receptor:ping",
                Bytes::from(body),
            );
            envelope.ttl = Some(KEEPALIVE_DRAIN_TIMEOUT.as_secs());
            let message_id = envelope.message_id.clone();
            let mut stream = self.responses.register(&message_id);
            if let Err(e) = self.router.send(envelope).await {
                debug!(%dest, error = %e, "keepalive ping not sent");
                self.responses.forget(&message_id);
                continue;
            }
            let responses = self.responses.clone();
            tokio::spawn(async move {
                let drain = async { while stream.recv().await.is_some() {} };
                if tokio::time::timeout(KEEPALIVE_DRAIN_TIMEOUT, drain).await.is_err() {
                    debug!(%dest, "keepalive ping timed out");
                    responses.forget(&message_id);
                }
            });
        }
    }
}

async fn tick_opt(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Control surface of a running node.
pub struct NodeHandle {
    node_id: String,
    state: Arc<SharedState>,
    router: Arc<MessageRouter>,
    dispatcher: Arc<WorkDispatcher>,
    responses: Arc<ResponseRegistry>,
    bound: Vec<SocketAddr>,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl NodeHandle {
    /// The node id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Addresses the listeners actually bound, in `listen` order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.bound
    }

    /// Live status snapshot.
    pub fn status(&self) -> NodeStatus {
        self.state.snapshot()
    }

    /// True when a session with `peer_id` is up.
    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.state.connections.is_connected(peer_id)
    }

    /// Register an application handler for a directive namespace.
    pub fn register_handler(&self, namespace: impl Into<String>, handler: Arc<dyn WorkHandler>) {
        self.dispatcher.register(namespace, handler);
    }

    /// Send a directive and return its response stream.
    ///
    /// The stream yields responses in `serial` order and ends with the
    /// `eof` envelope; an unroutable recipient produces an error `eof`.
    pub async fn send_directive(
        &self,
        recipient: &str,
        directive: &str,
        payload: Bytes,
        ttl: Option<u64>,
    ) -> Result<(String, mpsc::Receiver<InnerEnvelope>), RouterError> {
        let mut envelope =
            InnerEnvelope::directive(&self.node_id, recipient, directive, payload);
        envelope.ttl = ttl;
        let message_id = envelope.message_id.clone();
        let stream = self.responses.register(&message_id);
        if let Err(e) = self.router.send(envelope).await {
            self.responses.forget(&message_id);
            return Err(e);
        }
        Ok((message_id, stream))
    }

    /// Stop the event loop and flush the queues.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if self.join.await.is_err() {
            error!("node loop panicked");
        }
    }
}
