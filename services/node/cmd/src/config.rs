//! Configuration handling for the receptor node.
//!
//! Values come from the YAML config file, overridden by `RECEPTOR_*`
//! environment variables, overridden in turn by command-line flags in
//! `main`. The node id is persisted in `<data_dir>/node_id` the first time
//! a node starts without one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Receptor node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceptorConfig {
    /// Node identity and transports
    pub node: NodeSection,
    /// TLS material
    pub tls: TlsSection,
    /// Log output
    pub logging: LoggingSection,
}

/// `node:` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Node id; generated and persisted when absent
    pub node_id: Option<String>,
    /// Directory for durable queues and the persisted node id
    pub data_dir: PathBuf,
    /// Listener URLs
    pub listen: Vec<String>,
    /// Peer URLs to dial
    pub peers: Vec<String>,
    /// Seconds between keepalive pings; 0 disables them
    pub keepalive_interval: u64,
    /// Tokio worker threads; 0 uses the runtime default
    pub max_workers: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: None,
            data_dir: PathBuf::from("./receptor-data"),
            listen: Vec::new(),
            peers: Vec::new(),
            keepalive_interval: 0,
            max_workers: 0,
        }
    }
}

/// `tls:` section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    /// Path to the PEM certificate
    pub cert_file: String,
    /// Path to the PEM private key
    pub key_file: String,
    /// Path to the PEM CA bundle
    pub ca_file: String,
}

/// `logging:` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `simple` or `structured`
    pub format: String,
    /// Force debug-level logging
    pub debug: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: "simple".to_string(),
            debug: false,
        }
    }
}

impl ReceptorConfig {
    /// Load configuration: file values first, then environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path:?}"))?;
            config = serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config file {path:?}"))?;
            info!("loaded configuration from {:?}", path);
        } else if let Ok(content) = std::fs::read_to_string("receptor.yaml") {
            match serde_yaml::from_str(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("loaded configuration from receptor.yaml");
                }
                Err(e) => warn!(error = %e, "ignoring unparseable receptor.yaml"),
            }
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply `RECEPTOR_<SECTION>_<KEY>` environment overrides.
    fn apply_environment_overrides(&mut self) {
        if let Ok(node_id) = std::env::var("RECEPTOR_NODE_ID") {
            info!("node id overridden by environment: {}", node_id);
            self.node.node_id = Some(node_id);
        }
        if let Ok(data_dir) = std::env::var("RECEPTOR_NODE_DATA_DIR") {
            info!("data dir overridden by environment: {}", data_dir);
            self.node.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(listen) = std::env::var("RECEPTOR_NODE_LISTEN") {
            self.node.listen = split_list(&listen);
            info!("listeners overridden by environment: {:?}", self.node.listen);
        }
        if let Ok(peers) = std::env::var("RECEPTOR_NODE_PEERS") {
            self.node.peers = split_list(&peers);
            info!("peers overridden by environment: {:?}", self.node.peers);
        }
        if let Ok(interval) = std::env::var("RECEPTOR_NODE_KEEPALIVE_INTERVAL") {
            match interval.parse() {
                Ok(secs) => {
                    self.node.keepalive_interval = secs;
                    info!("keepalive interval overridden by environment: {}s", secs);
                }
                Err(_) => warn!("ignoring bad RECEPTOR_NODE_KEEPALIVE_INTERVAL {:?}", interval),
            }
        }
        if let Ok(cert) = std::env::var("RECEPTOR_TLS_CERT_FILE") {
            self.tls.cert_file = cert;
        }
        if let Ok(key) = std::env::var("RECEPTOR_TLS_KEY_FILE") {
            self.tls.key_file = key;
        }
        if let Ok(ca) = std::env::var("RECEPTOR_TLS_CA_FILE") {
            self.tls.ca_file = ca;
        }
        if let Ok(format) = std::env::var("RECEPTOR_LOGGING_FORMAT") {
            self.logging.format = format;
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolve the node id, persisting it in `<data_dir>/node_id`.
///
/// An explicitly supplied id always wins and is written back; otherwise a
/// previously persisted id is reused, and a fresh one is generated on the
/// very first start.
pub fn resolve_node_id(data_dir: &Path, explicit: Option<String>) -> Result<String> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data dir {data_dir:?}"))?;
    let id_path = data_dir.join("node_id");

    if let Some(id) = explicit {
        std::fs::write(&id_path, &id)
            .with_context(|| format!("failed to persist node id to {id_path:?}"))?;
        return Ok(id);
    }

    if let Ok(existing) = std::fs::read_to_string(&id_path) {
        let existing = existing.trim().to_string();
        if !existing.is_empty() {
            return Ok(existing);
        }
    }

    let generated = Uuid::new_v4().to_string();
    std::fs::write(&id_path, &generated)
        .with_context(|| format!("failed to persist node id to {id_path:?}"))?;
    info!("generated node id {}", generated);
    Ok(generated)
}
