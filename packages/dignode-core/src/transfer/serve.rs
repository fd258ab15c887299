//! # Serving Side
//!
//! Answers metadata and chunk requests out of the local store, under
//! the choke scheduler's admission control. One serving loop per
//! connection, fed request frames by the connection's dispatcher.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::choke::{Choker, GrantDecision};
use super::{CancelFlag, Connection};
use crate::store::{digest as digestmod, LocalStore};
use crate::wire::Frame;

/// Shared dependencies of every serving loop.
pub struct ServeDeps {
    pub store: Arc<LocalStore>,
    pub choker: Arc<Choker>,
    pub chunk_size: u32,
}

/// Serve one connection until it closes or the node shuts down.
pub async fn serve_connection(
    deps: Arc<ServeDeps>,
    connection: Arc<Connection>,
    mut requests: mpsc::Receiver<Frame>,
    cancel: CancelFlag,
) {
    let peer = connection.remote;
    let mut cancelled: HashSet<(String, u64)> = HashSet::new();

    loop {
        let frame = tokio::select! {
            frame = requests.recv() => frame,
            _ = cancel.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        match frame {
            Frame::MetadataRequest { digest } => {
                let response = match deps.store.record(&digest) {
                    Some(record) => Frame::MetadataResponse {
                        digest,
                        total_bytes: record.size,
                        total_chunks: digestmod::chunk_count(record.size, deps.chunk_size),
                        chunk_size: deps.chunk_size,
                    },
                    None => Frame::Error {
                        reason: "not-found".into(),
                        digest: Some(digest),
                        chunk_index: None,
                    },
                };
                if connection.send(response).await.is_err() {
                    break;
                }
            }

            Frame::ChunkRequest { digest, chunk_index } => {
                if cancelled.remove(&(digest.clone(), chunk_index)) {
                    tracing::trace!(digest, chunk_index, "skipping cancelled chunk");
                    continue;
                }
                let decision = deps.choker.grant(peer, &digest, chunk_index);
                if decision == GrantDecision::Refuse {
                    if connection
                        .send(Frame::choked_error(&digest, chunk_index))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }

                let response = read_chunk_response(&deps, &digest, chunk_index).await;
                let served = matches!(&response, Frame::ChunkResponse { .. });
                if let Frame::ChunkResponse { data, .. } = &response {
                    deps.choker.record_served(peer, data.len() as u64);
                }
                if connection.send(response).await.is_err() {
                    break;
                }
                if served && decision == GrantDecision::AllowThenChoke {
                    connection.set_choked_by_us(true);
                    if connection.send(Frame::Choke).await.is_err() {
                        break;
                    }
                }
            }

            Frame::Cancel { digest, chunk_index } => {
                if cancelled.len() >= 1024 {
                    cancelled.clear();
                }
                cancelled.insert((digest, chunk_index));
            }

            Frame::Have { digest, chunk_index } => {
                deps.choker.note_have(&digest, chunk_index);
            }

            // Keepalives and late handshakes need no answer.
            Frame::Ping { .. } | Frame::Handshake { .. } => {}

            other => {
                tracing::trace!(kind = other.kind(), "unexpected frame on serve loop");
            }
        }
    }
}

async fn read_chunk_response(deps: &ServeDeps, digest: &str, chunk_index: u64) -> Frame {
    let Some(path) = deps.store.lookup(digest) else {
        return Frame::Error {
            reason: "not-found".into(),
            digest: Some(digest.to_string()),
            chunk_index: Some(chunk_index),
        };
    };
    match digestmod::read_chunk(&path, chunk_index, deps.chunk_size).await {
        Ok(Some(data)) => Frame::ChunkResponse {
            digest: digest.to_string(),
            chunk_index,
            data: data.to_vec(),
        },
        Ok(None) => Frame::Error {
            reason: "no-such-chunk".into(),
            digest: Some(digest.to_string()),
            chunk_index: Some(chunk_index),
        },
        Err(e) => {
            // Local I/O failure: the record leaves the index.
            tracing::warn!(digest, error = %e, "chunk read failed; evicting record");
            deps.store.evict(digest);
            Frame::Error {
                reason: "read-error".into(),
                digest: Some(digest.to_string()),
                chunk_index: Some(chunk_index),
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
