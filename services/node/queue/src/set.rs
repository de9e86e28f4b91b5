//! Per-node collection of peer queues.

use crate::{PeerQueue, QueueError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// All durable queues owned by one local node.
///
/// Owns `<data_dir>/<node_id>/` and creates peer queues on first use.
/// Queues that had pending entries when the process last stopped are
/// reopened eagerly so recovery happens before any new traffic.
pub struct QueueSet {
    node_dir: PathBuf,
    queues: DashMap<String, PeerQueue>,
}

impl QueueSet {
    /// Open the queue set, creating the directory layout if needed and
    /// recovering every `manifest-<peer>` found on disk.
    pub fn open(data_dir: &Path, node_id: &str) -> Result<Self, QueueError> {
        let node_dir = data_dir.join(node_id);
        std::fs::create_dir_all(node_dir.join("messages"))?;

        let set = Self {
            node_dir,
            queues: DashMap::new(),
        };

        for entry in std::fs::read_dir(&set.node_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(peer_id) = name.to_str().and_then(|n| n.strip_prefix("manifest-")) else {
                continue;
            };
            let queue = PeerQueue::open(peer_id, &set.node_dir)?;
            if !queue.is_empty() {
                info!(peer = peer_id, pending = queue.len(), "recovered peer queue");
            }
            set.queues.insert(peer_id.to_string(), queue);
        }

        Ok(set)
    }

    /// Queue for `peer_id`, created on first use.
    pub fn for_peer(&self, peer_id: &str) -> Result<PeerQueue, QueueError> {
        match self.queues.entry(peer_id.to_string()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let queue = PeerQueue::open(peer_id, &self.node_dir)?;
                v.insert(queue.clone());
                Ok(queue)
            }
        }
    }

    /// Peers with an open queue, in no particular order.
    pub fn peers(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    /// Total entries pending across all peers.
    pub fn pending_total(&self) -> usize {
        self.queues.iter().map(|e| e.value().len()).sum()
    }

    /// Flush every manifest immediately. Used at shutdown and in tests.
    pub fn sync_all(&self) -> Result<(), QueueError> {
        for entry in self.queues.iter() {
            entry.value().sync()?;
        }
        Ok(())
    }
}
