//! # Announcement Bus
//!
//! Publishes this node's capability record (and digest set) on the
//! namespace's announce channel every sync interval — and immediately
//! when the local store changes — and turns peer announcements into
//! download jobs for whatever we are missing.
//!
//! Replay guard: announcements older than the configured maximum age
//! are dropped. De-duplication: a digest already queued or in flight is
//! never enqueued twice.

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::identity::NodeId;
use crate::mesh::{announce_channel, SharedMesh};
use crate::peers::{Announcement, Capabilities, PeerTable};
use crate::store::digest::is_valid_digest;
use crate::store::LocalStore;
use crate::time::now_timestamp_millis;

/// A queued request to fetch one digest from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub digest: String,
    pub source: NodeId,
    pub priority: i32,
}

/// Digests currently queued or in flight; the announcer inserts, the
/// download queue removes when a transfer reaches a terminal state.
#[derive(Default)]
pub struct PendingDigests {
    inner: Mutex<HashSet<String>>,
}

impl PendingDigests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert if absent; `false` means someone already owns this digest.
    pub fn try_claim(&self, digest: &str) -> bool {
        self.inner.lock().insert(digest.to_string())
    }

    pub fn release(&self, digest: &str) {
        self.inner.lock().remove(digest);
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.inner.lock().contains(digest)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// The announcer's moving parts, shared with the node.
pub struct Announcer {
    pub mesh: SharedMesh,
    pub namespace: String,
    pub local_id: NodeId,
    pub store: Arc<LocalStore>,
    pub peers: Arc<PeerTable>,
    /// Live capability record; the node updates it as NAT results land
    pub capabilities: Arc<RwLock<Capabilities>>,
    /// Peers we refuse to deal with (strike threshold exceeded)
    pub blacklist: Arc<RwLock<HashSet<NodeId>>>,
    pub pending: Arc<PendingDigests>,
    pub job_tx: mpsc::Sender<DownloadJob>,
    pub interval: Duration,
    pub max_announcement_age_ms: i64,
}

/// Handle to the announcer's tasks.
pub struct AnnouncerHandle {
    publisher: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl AnnouncerHandle {
    pub fn stop(&self) {
        self.publisher.abort();
        self.receiver.abort();
    }
}

impl Drop for AnnouncerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Announcer {
    /// Start the publish and receive tasks.
    pub async fn spawn(self: Arc<Self>) -> Result<AnnouncerHandle> {
        let channel = announce_channel(&self.namespace);
        let mut rx = self.mesh.subscribe(&channel).await?;

        let publisher = {
            let announcer = self.clone();
            let mut store_events = announcer.store.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(announcer.interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        event = store_events.recv() => {
                            if event.is_err() {
                                // Lagged or closed; the periodic tick
                                // still covers us.
                                continue;
                            }
                        }
                    }
                    announcer.peers.prune();
                    if let Err(e) = announcer.publish_once().await {
                        tracing::warn!(error = %e, "announcement publish failed");
                    }
                }
            })
        };

        let receiver = {
            let announcer = self.clone();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    announcer.handle_announcement(&msg.payload).await;
                }
            })
        };

        Ok(AnnouncerHandle { publisher, receiver })
    }

    /// Build and publish the current capability record.
    pub async fn publish_once(&self) -> Result<()> {
        let announcement = Announcement {
            node_id: self.local_id,
            timestamp: now_timestamp_millis(),
            capabilities: self.capabilities.read().clone(),
            digests: self.store.digests(),
        };
        let payload = serde_json::to_vec(&announcement)?;
        self.mesh
            .publish(&announce_channel(&self.namespace), payload)
            .await
    }

    /// Process one peer announcement.
    pub async fn handle_announcement(&self, payload: &[u8]) {
        let announcement: Announcement = match serde_json::from_slice(payload) {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring malformed announcement");
                return;
            }
        };
        if announcement.node_id == self.local_id {
            return;
        }
        let age = now_timestamp_millis() - announcement.timestamp;
        if age > self.max_announcement_age_ms {
            tracing::debug!(peer = %announcement.node_id, age, "dropping stale announcement");
            return;
        }
        if self.blacklist.read().contains(&announcement.node_id) {
            tracing::debug!(peer = %announcement.node_id, "ignoring blacklisted peer");
            return;
        }

        self.peers.upsert(&announcement);

        for digest in &announcement.digests {
            if !is_valid_digest(digest) {
                continue;
            }
            if self.store.lookup(digest).is_some() {
                continue;
            }
            if !self.pending.try_claim(digest) {
                continue;
            }
            let job = DownloadJob {
                digest: digest.clone(),
                source: announcement.node_id,
                priority: 0,
            };
            if self.job_tx.send(job).await.is_err() {
                self.pending.release(digest);
                return;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
