//! Receptor mesh node binary.
//!
//! `receptor node` runs a daemon; `ping`, `send`, and `status` start an
//! ephemeral node, attach to a peer, issue the directive in-band, and print
//! the response stream.

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::stream::BoxStream;
use futures::StreamExt;
use receptor_router::{Node, NodeConfig, NodeHandle, SecurityManager, WorkHandler};
use receptor_wire::{InnerEnvelope, MessageType};
use std::io::Read;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

mod config;
mod logging;

use config::{resolve_node_id, ReceptorConfig};
use logging::LogFormat;

const ATTACH_TIMEOUT: Duration = Duration::from_secs(30);

/// Overlay mesh node connecting work controllers and executors.
#[derive(Parser, Debug)]
#[command(name = "receptor", version, about = "Receptor overlay mesh node")]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for durable queues and the persisted node id
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Node id; persisted on first start when omitted
    #[arg(long, global = true)]
    node_id: Option<String>,

    /// Listener URL, e.g. rnp://0.0.0.0:8888 (repeatable)
    #[arg(long, global = true)]
    listen: Vec<String>,

    /// Peer URL to dial, e.g. rnp://hub.example.net:8888 (repeatable)
    #[arg(long, global = true)]
    peer: Vec<String>,

    /// Debug-level logging
    #[arg(long, global = true)]
    debug: bool,

    /// Tokio worker threads
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Console log format
    #[arg(long, global = true, value_enum)]
    logging_format: Option<LogFormat>,

    /// Path to the TLS certificate (PEM)
    #[cfg(feature = "tls")]
    #[arg(long, global = true)]
    tls_cert: Option<PathBuf>,

    /// Path to the TLS private key (PEM)
    #[cfg(feature = "tls")]
    #[arg(long, global = true)]
    tls_key: Option<PathBuf>,

    /// Path to the CA bundle (PEM); enables mutual TLS on listeners
    #[cfg(feature = "tls")]
    #[arg(long, global = true)]
    tls_ca: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a mesh node until interrupted
    Node,
    /// Ping a node through the mesh
    Ping {
        /// Target node id
        recipient: String,
        /// Number of pings to send
        #[arg(long, short = 'c', default_value_t = 1)]
        count: u32,
    },
    /// Send a directive and print the response stream
    Send {
        /// Target node id
        recipient: String,
        /// Directive, e.g. demo:echo
        directive: String,
        /// Payload: literal text, a filename, or `-` for stdin
        payload: String,
    },
    /// Print the status of a node
    Status {
        /// Target node id; defaults to the attached peer
        recipient: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = match ReceptorConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("receptor: {e:#}");
            exit(1);
        }
    };

    let format = match cli.logging_format {
        Some(format) => format,
        None => match config.logging.format.parse() {
            Ok(format) => format,
            Err(e) => {
                eprintln!("receptor: {e}");
                exit(1);
            }
        },
    };
    logging::init(format, cli.debug || config.logging.debug);

    let workers = cli.max_workers.unwrap_or(config.node.max_workers);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if workers > 0 {
        builder.worker_threads(workers);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("receptor: failed to build runtime: {e}");
            exit(2);
        }
    };

    exit(runtime.block_on(run(cli, config)));
}

async fn run(cli: Cli, config: ReceptorConfig) -> i32 {
    match build_node_config(&cli, &config) {
        Ok((node_config, security)) => match cli.command {
            Commands::Node => run_daemon(node_config, security).await,
            Commands::Ping { ref recipient, count } => {
                run_client(node_config, security, Client::Ping { recipient, count }).await
            }
            Commands::Send {
                ref recipient,
                ref directive,
                ref payload,
            } => {
                run_client(
                    node_config,
                    security,
                    Client::Send {
                        recipient,
                        directive,
                        payload,
                    },
                )
                .await
            }
            Commands::Status { ref recipient } => {
                run_client(node_config, security, Client::Status {
                    recipient: recipient.as_deref(),
                })
                .await
            }
        },
        Err(e) => {
            error!("{e:#}");
            1
        }
    }
}

/// Merge CLI flags over the loaded config into a runnable [`NodeConfig`].
fn build_node_config(
    cli: &Cli,
    config: &ReceptorConfig,
) -> anyhow::Result<(NodeConfig, Arc<dyn SecurityManager>)> {
    let ephemeral = !matches!(cli.command, Commands::Node);

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| config.node.data_dir.clone());
    let explicit_id = cli.node_id.clone().or_else(|| config.node.node_id.clone());

    let (node_id, data_dir) = if ephemeral {
        // Client commands get a throwaway identity and queue directory so
        // they never disturb a daemon running from the same config.
        let id = explicit_id.unwrap_or_else(|| format!("ctl-{}", uuid::Uuid::new_v4()));
        let dir = std::env::temp_dir().join(format!("receptor-{id}"));
        (id, dir)
    } else {
        (resolve_node_id(&data_dir, explicit_id)?, data_dir)
    };

    let mut node_config = NodeConfig::new(&node_id, &data_dir);
    node_config.listen = if cli.listen.is_empty() && !ephemeral {
        config.node.listen.clone()
    } else {
        cli.listen.clone()
    };
    node_config.peers = if cli.peer.is_empty() {
        config.node.peers.clone()
    } else {
        cli.peer.clone()
    };
    if config.node.keepalive_interval > 0 && !ephemeral {
        node_config.keepalive_interval =
            Some(Duration::from_secs(config.node.keepalive_interval));
    }
    if ephemeral && node_config.peers.is_empty() {
        bail!("this command needs at least one --peer to attach to");
    }

    let security = apply_tls(cli, config, &mut node_config)?;
    Ok((node_config, security))
}

#[cfg(feature = "tls")]
fn apply_tls(
    cli: &Cli,
    config: &ReceptorConfig,
    node_config: &mut NodeConfig,
) -> anyhow::Result<Arc<dyn SecurityManager>> {
    use receptor_router::CertificateSecurity;
    use receptor_session::{make_client_config, make_server_config, tls_acceptor, TlsClientConfig};

    let path_of = |flag: &Option<PathBuf>, fallback: &str| -> Option<PathBuf> {
        flag.clone()
            .or_else(|| (!fallback.is_empty()).then(|| PathBuf::from(fallback)))
    };
    let cert_path = path_of(&cli.tls_cert, &config.tls.cert_file);
    let key_path = path_of(&cli.tls_key, &config.tls.key_file);
    let ca_path = path_of(&cli.tls_ca, &config.tls.ca_file);

    let (Some(cert_path), Some(key_path)) = (cert_path, key_path) else {
        return Ok(Arc::new(receptor_router::NoopSecurity));
    };

    let cert_pem = std::fs::read_to_string(&cert_path)
        .with_context(|| format!("failed to read certificate {cert_path:?}"))?;
    let key_pem = std::fs::read_to_string(&key_path)
        .with_context(|| format!("failed to read private key {key_path:?}"))?;
    let ca_pem = match &ca_path {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read CA bundle {path:?}"))?,
        ),
        None => None,
    };

    let server_config = make_server_config(&cert_pem, &key_pem, ca_pem.as_deref())?;
    node_config.tls_server = Some(Arc::new(tls_acceptor(server_config)));

    if let Some(ca_pem) = &ca_pem {
        let client_config = make_client_config(ca_pem, Some((&cert_pem, &key_pem)))?;
        node_config.tls_client = Some(TlsClientConfig {
            client_config: Arc::new(client_config),
        });
    }

    Ok(Arc::new(CertificateSecurity::new(cert_pem)))
}

#[cfg(not(feature = "tls"))]
fn apply_tls(
    _cli: &Cli,
    config: &ReceptorConfig,
    _node_config: &mut NodeConfig,
) -> anyhow::Result<Arc<dyn SecurityManager>> {
    if !config.tls.cert_file.is_empty() || !config.tls.key_file.is_empty() {
        bail!("TLS configured but this build has no TLS support; rebuild with --features tls");
    }
    Ok(Arc::new(receptor_router::NoopSecurity))
}

/// Sample application handler, kept registered on every node.
struct EchoHandler;

#[async_trait]
impl WorkHandler for EchoHandler {
    async fn start(
        &self,
        action: &str,
        directive: &InnerEnvelope,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Bytes>>> {
        anyhow::ensure!(action == "echo", "unknown demo action {action:?}");
        let payload = directive.raw_payload.clone();
        Ok(futures::stream::once(async move { Ok(payload) }).boxed())
    }
}

async fn run_daemon(config: NodeConfig, security: Arc<dyn SecurityManager>) -> i32 {
    let handle = match Node::start(config, security).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to start node: {e}");
            return 1;
        }
    };
    handle.register_handler("demo", Arc::new(EchoHandler));
    info!(node = handle.node_id(), "node running");

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to wait for interrupt");
        handle.shutdown().await;
        return 2;
    }
    info!("shutting down");
    handle.shutdown().await;
    0
}

enum Client<'a> {
    Ping { recipient: &'a str, count: u32 },
    Send {
        recipient: &'a str,
        directive: &'a str,
        payload: &'a str,
    },
    Status { recipient: Option<&'a str> },
}

async fn run_client(
    config: NodeConfig,
    security: Arc<dyn SecurityManager>,
    client: Client<'_>,
) -> i32 {
    let handle = match Node::start(config, security).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to start node: {e}");
            return 1;
        }
    };

    let code = match run_command(&handle, client).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            2
        }
    };
    handle.shutdown().await;
    code
}

async fn run_command(handle: &NodeHandle, client: Client<'_>) -> anyhow::Result<i32> {
    match client {
        Client::Ping { recipient, count } => {
            wait_for_route(handle, recipient).await?;
            let mut code = 0;
            for _ in 0..count {
                let sent_at = Utc::now();
                let payload =
                    serde_json::to_vec(&serde_json::json!({ "initial_time": sent_at }))?;
                let (_, stream) = handle
                    .send_directive(recipient, "receptor:ping", Bytes::from(payload), None)
                    .await?;
                let ping_code = drain_responses(stream, |response| {
                    let rtt = Utc::now().signed_duration_since(sent_at);
                    println!(
                        "reply from {}: time={}ms",
                        response.sender,
                        rtt.num_milliseconds()
                    );
                    Ok(())
                })
                .await?;
                code = code.max(ping_code);
            }
            Ok(code)
        }

        Client::Send {
            recipient,
            directive,
            payload,
        } => {
            let body = read_payload(payload)?;
            wait_for_route(handle, recipient).await?;
            let (_, stream) = handle
                .send_directive(recipient, directive, body, None)
                .await?;
            drain_responses(stream, |response| {
                use std::io::Write;
                std::io::stdout().write_all(&response.raw_payload)?;
                Ok(())
            })
            .await
        }

        Client::Status { recipient } => {
            let target = match recipient {
                Some(target) => target.to_string(),
                None => attached_peer(handle).await?,
            };
            wait_for_route(handle, &target).await?;
            let (_, stream) = handle
                .send_directive(&target, "receptor:status", Bytes::new(), None)
                .await?;
            drain_responses(stream, |response| {
                print!("{}", String::from_utf8_lossy(&response.raw_payload));
                Ok(())
            })
            .await
        }
    }
}

/// Consume a response stream, printing each part; returns the exit code the
/// `eof` dictates.
async fn drain_responses(
    mut stream: mpsc::Receiver<InnerEnvelope>,
    mut on_response: impl FnMut(&InnerEnvelope) -> anyhow::Result<()>,
) -> anyhow::Result<i32> {
    loop {
        let envelope = tokio::time::timeout(ATTACH_TIMEOUT, stream.recv())
            .await
            .context("timed out waiting for a response")?
            .context("response stream ended without eof")?;
        match envelope.message_type {
            MessageType::Eof => {
                return if envelope.code == Some(0) {
                    Ok(0)
                } else {
                    let text = String::from_utf8_lossy(&envelope.raw_payload).to_string();
                    error!(code = ?envelope.code, "{text}");
                    Ok(2)
                };
            }
            _ => on_response(&envelope)?,
        }
    }
}

fn read_payload(arg: &str) -> anyhow::Result<Bytes> {
    if arg == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read payload from stdin")?;
        return Ok(Bytes::from(buf));
    }
    let path = std::path::Path::new(arg);
    if path.is_file() {
        let buf = std::fs::read(path).with_context(|| format!("failed to read {path:?}"))?;
        return Ok(Bytes::from(buf));
    }
    Ok(Bytes::copy_from_slice(arg.as_bytes()))
}

async fn wait_for_route(handle: &NodeHandle, dest: &str) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + ATTACH_TIMEOUT;
    while !handle.status().routing_table.contains_key(dest) {
        if tokio::time::Instant::now() >= deadline {
            bail!("no route to {dest:?} after {ATTACH_TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

/// Node id of the first peer this ephemeral node attached to.
async fn attached_peer(handle: &NodeHandle) -> anyhow::Result<String> {
    let deadline = tokio::time::Instant::now() + ATTACH_TIMEOUT;
    loop {
        if let Some(peer) = handle.status().connections.into_iter().next() {
            return Ok(peer);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("failed to attach to a peer within {ATTACH_TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_count_flag() {
        let cli = Cli::parse_from(["receptor", "ping", "hub", "--count", "3"]);
        match cli.command {
            Commands::Ping { recipient, count } => {
                assert_eq!(recipient, "hub");
                assert_eq!(count, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::parse_from(["receptor", "ping", "hub"]);
        assert!(matches!(cli.command, Commands::Ping { count: 1, .. }));
    }
}
