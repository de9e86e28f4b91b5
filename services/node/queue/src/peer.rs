//! Single-peer durable FIFO queue.

use crate::QueueError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Manifest writes triggered within this window collapse into one flush.
const FLUSH_WINDOW: Duration = Duration::from_millis(100);

/// An entry checked out of a [`PeerQueue`] by `get`.
///
/// The entry stays on disk and in the manifest until it is either
/// `close`d (transmitted) or `put_ident`ed back (send failure).
#[derive(Debug)]
pub struct QueueHandle {
    id: String,
}

impl QueueHandle {
    /// Backing filename under `messages/`.
    pub fn id(&self) -> &str {
        &self.id
    }
}

struct QueueState {
    /// Entries not yet checked out, oldest first
    pending: VecDeque<String>,
    /// Entries checked out but not yet closed, in checkout order
    outstanding: Vec<String>,
}

struct Inner {
    peer_id: String,
    messages_dir: PathBuf,
    manifest_path: PathBuf,
    state: Mutex<QueueState>,
    /// Woken whenever an entry becomes available to `get`
    available: Notify,
    /// Signals the flusher task that the manifest is dirty
    flush_tx: mpsc::UnboundedSender<()>,
}

impl Inner {
    /// Snapshot the ordered id list and rewrite the manifest.
    fn write_manifest(&self) -> Result<(), QueueError> {
        let snapshot = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let mut ids =
                Vec::with_capacity(state.outstanding.len() + state.pending.len());
            ids.extend(state.outstanding.iter().cloned());
            ids.extend(state.pending.iter().cloned());
            ids.join("\n")
        };
        std::fs::write(&self.manifest_path, snapshot)?;
        Ok(())
    }
}

/// Durable FIFO queue of outbound messages for one remote peer.
///
/// Cheap to clone; all clones share the same on-disk state. Must be created
/// inside a tokio runtime (a background flusher task is spawned).
#[derive(Clone)]
pub struct PeerQueue {
    inner: Arc<Inner>,
}

impl PeerQueue {
    /// Open (or create) the queue for `peer_id` under `node_dir`, recovering
    /// any pending entries from the manifest. Manifest ids whose backing file
    /// is gone are dropped and the manifest rewritten.
    pub(crate) fn open(peer_id: &str, node_dir: &Path) -> Result<Self, QueueError> {
        let messages_dir = node_dir.join("messages");
        let manifest_path = node_dir.join(format!("manifest-{}", peer_id));

        let mut pending = VecDeque::new();
        let mut repaired = false;
        if manifest_path.is_file() {
            let content = std::fs::read_to_string(&manifest_path)?;
            for id in content.lines().filter(|l| !l.is_empty()) {
                if messages_dir.join(id).is_file() {
                    pending.push_back(id.to_string());
                } else {
                    warn!(peer = peer_id, id, "dropping manifest entry with no backing file");
                    repaired = true;
                }
            }
        }
        if !pending.is_empty() {
            debug!(peer = peer_id, entries = pending.len(), "recovered pending queue");
        }

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            peer_id: peer_id.to_string(),
            messages_dir,
            manifest_path,
            state: Mutex::new(QueueState {
                pending,
                outstanding: Vec::new(),
            }),
            available: Notify::new(),
            flush_tx,
        });

        if repaired {
            inner.write_manifest()?;
        }
        spawn_flusher(Arc::downgrade(&inner), flush_rx);

        Ok(Self { inner })
    }

    /// Append a message. The payload is written to its own file before the
    /// entry becomes visible, so memory use is bounded by the transport.
    pub fn put(&self, bytes: &[u8]) -> Result<(), QueueError> {
        let id = Uuid::new_v4().to_string();
        std::fs::write(self.inner.messages_dir.join(&id), bytes)?;
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.push_back(id);
        }
        let _ = self.inner.flush_tx.send(());
        self.inner.available.notify_one();
        Ok(())
    }

    /// Check out the oldest pending entry, waiting until one exists.
    pub async fn get(&self) -> QueueHandle {
        loop {
            {
                let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(id) = state.pending.pop_front() {
                    state.outstanding.push(id.clone());
                    return QueueHandle { id };
                }
            }
            self.inner.available.notified().await;
        }
    }

    /// Read the bytes behind a checked-out handle.
    ///
    /// Returns `Ok(None)` when the backing file is gone or unreadable; the
    /// entry is skipped and the manifest repaired, the caller moves on.
    pub fn read(&self, handle: &QueueHandle) -> Result<Option<Bytes>, QueueError> {
        match std::fs::read(self.inner.messages_dir.join(&handle.id)) {
            Ok(bytes) => Ok(Some(bytes.into())),
            Err(e) => {
                warn!(
                    peer = %self.inner.peer_id,
                    id = %handle.id,
                    error = %e,
                    "skipping unreadable queue entry"
                );
                self.forget(&handle.id);
                let _ = self.inner.flush_tx.send(());
                Ok(None)
            }
        }
    }

    /// Delete a transmitted entry: remove its file and drop it from the
    /// manifest.
    pub fn close(&self, handle: QueueHandle) -> Result<(), QueueError> {
        self.forget(&handle.id);
        match std::fs::remove_file(self.inner.messages_dir.join(&handle.id)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let _ = self.inner.flush_tx.send(());
        Ok(())
    }

    /// Reinsert a checked-out entry at the head of the queue. Used on send
    /// failure so the message is neither lost nor reordered past entries
    /// already transmitted.
    pub fn put_ident(&self, handle: QueueHandle) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.outstanding.retain(|id| id != &handle.id);
            state.pending.push_front(handle.id);
        }
        self.inner.available.notify_one();
    }

    /// Number of entries pending or checked out.
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.len() + state.outstanding.len()
    }

    /// True when nothing is pending or checked out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush the manifest immediately, bypassing the coalescing window.
    pub fn sync(&self) -> Result<(), QueueError> {
        self.inner.write_manifest()
    }

    fn forget(&self, id: &str) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.retain(|p| p != id);
        state.outstanding.retain(|p| p != id);
    }
}

/// Background manifest flusher. Signals arriving within [`FLUSH_WINDOW`] of
/// each other collapse into a single write. Exits when the queue is dropped.
fn spawn_flusher(inner: Weak<Inner>, mut flush_rx: mpsc::UnboundedReceiver<()>) {
    tokio::spawn(async move {
        while flush_rx.recv().await.is_some() {
            tokio::time::sleep(FLUSH_WINDOW).await;
            while flush_rx.try_recv().is_ok() {}
            let Some(inner) = inner.upgrade() else { break };
            if let Err(e) = inner.write_manifest() {
                warn!(peer = %inner.peer_id, error = %e, "manifest flush failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_queue(dir: &TempDir) -> PeerQueue {
        std::fs::create_dir_all(dir.path().join("messages")).unwrap();
        PeerQueue::open("peer-1", dir.path()).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let dir = TempDir::new().unwrap();
        let q = open_queue(&dir);

        q.put(b"first").unwrap();
        q.put(b"second").unwrap();
        q.put(b"third").unwrap();

        for expected in [&b"first"[..], b"second", b"third"] {
            let handle = q.get().await;
            let bytes = q.read(&handle).unwrap().unwrap();
            assert_eq!(&bytes[..], expected);
            q.close(handle).unwrap();
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_get_blocks_until_put() {
        let dir = TempDir::new().unwrap();
        let q = open_queue(&dir);

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move {
                let handle = q.get().await;
                q.read(&handle).unwrap().unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        q.put(b"arrived").unwrap();
        let bytes = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&bytes[..], b"arrived");
    }

    #[tokio::test]
    async fn test_put_ident_goes_to_head() {
        let dir = TempDir::new().unwrap();
        let q = open_queue(&dir);

        q.put(b"one").unwrap();
        q.put(b"two").unwrap();

        let handle = q.get().await;
        assert_eq!(&q.read(&handle).unwrap().unwrap()[..], b"one");
        q.put_ident(handle);

        // "one" must come out again before "two".
        let handle = q.get().await;
        assert_eq!(&q.read(&handle).unwrap().unwrap()[..], b"one");
        q.close(handle).unwrap();

        let handle = q.get().await;
        assert_eq!(&q.read(&handle).unwrap().unwrap()[..], b"two");
        q.close(handle).unwrap();
    }

    #[tokio::test]
    async fn test_recovery_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let q = open_queue(&dir);
            q.put(b"alpha").unwrap();
            q.put(b"beta").unwrap();
            q.sync().unwrap();
        }

        let q = open_queue(&dir);
        assert_eq!(q.len(), 2);
        let handle = q.get().await;
        assert_eq!(&q.read(&handle).unwrap().unwrap()[..], b"alpha");
    }

    #[tokio::test]
    async fn test_recovery_skips_missing_files() {
        let dir = TempDir::new().unwrap();
        {
            let q = open_queue(&dir);
            q.put(b"kept").unwrap();
            q.put(b"deleted").unwrap();
            q.sync().unwrap();
        }

        // Remove the second entry's backing file behind the queue's back.
        let manifest =
            std::fs::read_to_string(dir.path().join("manifest-peer-1")).unwrap();
        let victim = manifest.lines().nth(1).unwrap();
        std::fs::remove_file(dir.path().join("messages").join(victim)).unwrap();

        let q = open_queue(&dir);
        assert_eq!(q.len(), 1);
        let handle = q.get().await;
        assert_eq!(&q.read(&handle).unwrap().unwrap()[..], b"kept");
    }

    #[tokio::test]
    async fn test_read_missing_file_skips_entry() {
        let dir = TempDir::new().unwrap();
        let q = open_queue(&dir);

        q.put(b"gone").unwrap();
        q.put(b"still here").unwrap();

        let handle = q.get().await;
        std::fs::remove_file(dir.path().join("messages").join(handle.id())).unwrap();
        assert!(q.read(&handle).unwrap().is_none());

        let handle = q.get().await;
        assert_eq!(&q.read(&handle).unwrap().unwrap()[..], b"still here");
    }

    #[tokio::test]
    async fn test_closed_entries_not_redelivered() {
        let dir = TempDir::new().unwrap();
        {
            let q = open_queue(&dir);
            q.put(b"one").unwrap();
            q.put(b"two").unwrap();
            let handle = q.get().await;
            q.close(handle).unwrap();
            q.sync().unwrap();
        }

        let q = open_queue(&dir);
        assert_eq!(q.len(), 1);
        let handle = q.get().await;
        assert_eq!(&q.read(&handle).unwrap().unwrap()[..], b"two");
    }
}
