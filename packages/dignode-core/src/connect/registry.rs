//! # Success Registry
//!
//! Persistent memory of which transport and endpoint last worked for
//! each peer. One JSON file per peer under the platform data directory
//! (filename = the peer's hex id); entries older than the configured
//! maximum age are pruned at load and on save.
//!
//! Mutations are serialized through a single writer task so concurrent
//! transfers never interleave partial writes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::time::now_timestamp_millis;
use crate::transport::TransportKind;

/// One peer's persisted record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuccessRecord {
    pub peer_id: NodeId,
    pub connection_type: TransportKind,
    /// Remote IP for address-bearing transports, empty otherwise
    pub address: String,
    pub port: u16,
    /// Unix millis of the latest success
    pub last_success_time: i64,
    pub success_count: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SuccessRecord {
    fn is_fresh(&self, max_age_ms: i64) -> bool {
        now_timestamp_millis() - self.last_success_time < max_age_ms
    }
}

enum WriteOp {
    Save(SuccessRecord),
    Remove(NodeId),
    Flush(oneshot::Sender<()>),
}

/// The registry: an in-memory view backed by one file per peer.
pub struct SuccessRegistry {
    dir: PathBuf,
    max_age_ms: i64,
    cache: RwLock<HashMap<NodeId, SuccessRecord>>,
    writer_tx: mpsc::UnboundedSender<WriteOp>,
    writer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Default registry directory under the OS data dir.
pub fn default_registry_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("dignode").join("registry"))
        .ok_or_else(|| Error::Io("no platform data directory".into()))
}

impl SuccessRegistry {
    /// Load the registry, pruning entries older than `max_age_days`.
    pub async fn load(dir: PathBuf, max_age_days: u32) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&dir).await?;
        let max_age_ms = max_age_days as i64 * 24 * 60 * 60 * 1000;

        let mut cache = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let record: SuccessRecord = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "dropping unreadable registry record");
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read registry record");
                    continue;
                }
            };
            if record.is_fresh(max_age_ms) {
                cache.insert(record.peer_id, record);
            } else {
                tracing::debug!(peer = %record.peer_id, "pruning stale registry record");
                let _ = tokio::fs::remove_file(&path).await;
            }
        }

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_loop(dir.clone(), writer_rx));

        Ok(Arc::new(Self {
            dir,
            max_age_ms,
            cache: RwLock::new(cache),
            writer_tx,
            writer: parking_lot::Mutex::new(Some(writer)),
        }))
    }

    /// The fresh record for `peer`, if any.
    pub fn get(&self, peer: &NodeId) -> Option<SuccessRecord> {
        self.cache
            .read()
            .get(peer)
            .filter(|r| r.is_fresh(self.max_age_ms))
            .cloned()
    }

    /// All fresh records.
    pub fn list(&self) -> Vec<SuccessRecord> {
        self.cache
            .read()
            .values()
            .filter(|r| r.is_fresh(self.max_age_ms))
            .cloned()
            .collect()
    }

    /// Record a successful connection; repeat successes on the same
    /// transport bump the count, a different transport resets it.
    pub fn record_success(
        &self,
        peer: NodeId,
        kind: TransportKind,
        remote: Option<std::net::SocketAddr>,
    ) {
        let mut cache = self.cache.write();
        let record = match cache.get(&peer) {
            Some(old) if old.connection_type == kind => {
                let mut updated = old.clone();
                updated.last_success_time = now_timestamp_millis();
                updated.success_count += 1;
                if let Some(addr) = remote {
                    updated.address = addr.ip().to_string();
                    updated.port = addr.port();
                }
                updated
            }
            _ => SuccessRecord {
                peer_id: peer,
                connection_type: kind,
                address: remote.map(|a| a.ip().to_string()).unwrap_or_default(),
                port: remote.map(|a| a.port()).unwrap_or(0),
                last_success_time: now_timestamp_millis(),
                success_count: 1,
                metadata: HashMap::new(),
            },
        };
        cache.insert(peer, record.clone());
        drop(cache);

        // Piggyback stale pruning on every save.
        self.prune_stale();
        let _ = self.writer_tx.send(WriteOp::Save(record));
    }

    fn prune_stale(&self) {
        let stale: Vec<NodeId> = {
            let cache = self.cache.read();
            cache
                .values()
                .filter(|r| !r.is_fresh(self.max_age_ms))
                .map(|r| r.peer_id)
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        let mut cache = self.cache.write();
        for peer in stale {
            cache.remove(&peer);
            let _ = self.writer_tx.send(WriteOp::Remove(peer));
        }
    }

    /// Wait until every queued write has hit disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer_tx.send(WriteOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Flush and stop the writer.
    pub async fn shutdown(&self) {
        self.flush().await;
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            writer.abort();
        }
    }

    /// Where `peer`'s record lives on disk.
    pub fn record_path(&self, peer: &NodeId) -> PathBuf {
        self.dir.join(format!("{}.json", peer.to_hex()))
    }
}

async fn writer_loop(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Save(record) => {
                let path = dir.join(format!("{}.json", record.peer_id.to_hex()));
                match serde_json::to_vec_pretty(&record) {
                    Ok(bytes) => {
                        if let Err(e) = tokio::fs::write(&path, bytes).await {
                            tracing::warn!(path = %path.display(), error = %e, "registry write failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "registry serialize failed");
                    }
                }
            }
            WriteOp::Remove(peer) => {
                let path = dir.join(format!("{}.json", peer.to_hex()));
                let _ = tokio::fs::remove_file(&path).await;
            }
            WriteOp::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
