//! # File Transfer Protocol
//!
//! The chunked transfer protocol layered over any [`Channel`]:
//! metadata exchange, pipelined chunk requests with streaming
//! verification and resume on the client side; request serving with
//! choke/unchoke fairness on the server side.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        TRANSFER FLOW                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  Client                              Server                         │
//! │  ──────                              ──────                         │
//! │  metadata-request ──────────────────►                               │
//! │                   ◄────────────────── metadata-response             │
//! │                                       (size, chunks, chunk size)    │
//! │                                                                     │
//! │  chunk-request ×N ──────────────────►  (≤ max outstanding)          │
//! │                   ◄────────────────── chunk-response                │
//! │  write at offset,                     (refused with error           │
//! │  hash in index order                   "choked" when choked)        │
//! │                                                                     │
//! │  have ──────────────────────────────► feeds super-seed tracking    │
//! │                                                                     │
//! │  final hash == digest ?  rename into store : delete partial         │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A connection is shared: one dispatch task reads frames off the
//! channel, routes responses to the transfer registered for their
//! digest, and hands requests to the serving loop.

pub mod choke;
pub mod download;
pub mod serve;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::transport::{BoxedChannel, TransportKind};
use crate::wire::Frame;

// ============================================================================
// CANCELLATION
// ============================================================================

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// A cooperative cancellation signal shared across a transfer's tasks.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<CancelInner>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::Acquire)
    }

    /// Resolves once cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}

// ============================================================================
// TRANSFER EVENTS
// ============================================================================

/// Progress events surfaced to the orchestrator and the status CLI.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Started {
        digest: String,
        source: NodeId,
    },
    Progress {
        digest: String,
        received_chunks: u64,
        total_chunks: u64,
    },
    Completed {
        digest: String,
    },
    Failed {
        digest: String,
        /// Machine-readable error kind
        reason: &'static str,
    },
    Cancelled {
        digest: String,
    },
}

// ============================================================================
// CONNECTION
// ============================================================================

/// A live, handshaked connection as the transfer layer sees it: the
/// channel plus routing state, outstanding-request accounting, and the
/// choke flags for both directions.
pub struct Connection {
    pub remote: NodeId,
    pub kind: TransportKind,
    channel: BoxedChannel,
    /// digest → sender feeding the transfer that owns that digest
    transfers: parking_lot::Mutex<HashMap<String, mpsc::Sender<Frame>>>,
    /// Requests we have issued and not yet heard back on
    outstanding: AtomicUsize,
    /// The remote told us `choke`
    choked_by_them: AtomicBool,
    /// We told the remote `choke` (maintained by the choker)
    choked_by_us: AtomicBool,
    closed: AtomicBool,
    dispatch: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap a handshaked channel. Returns the connection and the stream
    /// of request frames for the serving side.
    pub fn new(
        remote: NodeId,
        kind: TransportKind,
        channel: BoxedChannel,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (server_tx, server_rx) = mpsc::channel(64);
        let connection = Arc::new(Self {
            remote,
            kind,
            channel,
            transfers: parking_lot::Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            choked_by_them: AtomicBool::new(false),
            choked_by_us: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dispatch: parking_lot::Mutex::new(None),
        });

        let dispatch = tokio::spawn(dispatch_loop(connection.clone(), server_tx));
        *connection.dispatch.lock() = Some(dispatch);
        (connection, server_rx)
    }

    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed(self.remote.to_hex()));
        }
        self.channel.send(frame).await
    }

    /// Register a transfer to receive response frames for `digest`.
    pub fn register_transfer(&self, digest: &str) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(64);
        self.transfers.lock().insert(digest.to_string(), tx);
        rx
    }

    pub fn unregister_transfer(&self, digest: &str) {
        self.transfers.lock().remove(digest);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn note_request_sent(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub fn note_response(&self) {
        // Saturating: late responses after a source switch.
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn reset_outstanding(&self) {
        self.outstanding.store(0, Ordering::Release);
    }

    pub fn is_choked_by_them(&self) -> bool {
        self.choked_by_them.load(Ordering::Acquire)
    }

    pub fn is_choked_by_us(&self) -> bool {
        self.choked_by_us.load(Ordering::Acquire)
    }

    pub fn set_choked_by_us(&self, choked: bool) {
        self.choked_by_us.store(choked, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.channel.remote_addr()
    }

    /// Close the underlying channel; cancels everything outstanding on
    /// both sides per the protocol.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transfers.lock().clear();
        self.channel.close().await;
        if let Some(task) = self.dispatch.lock().take() {
            task.abort();
        }
    }
}

/// Read frames off the channel and route them: responses to their
/// transfer, requests to the server loop, choke signals to both.
async fn dispatch_loop(connection: Arc<Connection>, server_tx: mpsc::Sender<Frame>) {
    loop {
        let Some(frame) = connection.channel.recv().await else {
            break;
        };
        match &frame {
            Frame::MetadataResponse { digest, .. }
            | Frame::ChunkResponse { digest, .. } => {
                route_to_transfer(&connection, digest, frame.clone()).await;
            }
            Frame::Error { digest: Some(digest), .. } => {
                route_to_transfer(&connection, digest, frame.clone()).await;
            }
            Frame::Choke => {
                connection.choked_by_them.store(true, Ordering::Release);
                broadcast_to_transfers(&connection, frame.clone()).await;
            }
            Frame::Unchoke => {
                connection.choked_by_them.store(false, Ordering::Release);
                broadcast_to_transfers(&connection, frame.clone()).await;
            }
            Frame::Error { digest: None, .. } => {
                broadcast_to_transfers(&connection, frame.clone()).await;
            }
            Frame::Handshake { .. }
            | Frame::MetadataRequest { .. }
            | Frame::ChunkRequest { .. }
            | Frame::Cancel { .. }
            | Frame::Have { .. }
            | Frame::Ping { .. } => {
                if server_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }
    // Channel gone: wake every registered transfer by dropping senders.
    connection.transfers.lock().clear();
    connection.closed.store(true, Ordering::Release);
}

async fn route_to_transfer(connection: &Arc<Connection>, digest: &str, frame: Frame) {
    let tx = connection.transfers.lock().get(digest).cloned();
    if let Some(tx) = tx {
        let _ = tx.send(frame).await;
    } else {
        tracing::trace!(digest, kind = frame.kind(), "response for unregistered transfer");
    }
}

async fn broadcast_to_transfers(connection: &Arc<Connection>, frame: Frame) {
    let txs: Vec<mpsc::Sender<Frame>> = connection.transfers.lock().values().cloned().collect();
    for tx in txs {
        let _ = tx.send(frame.clone()).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================
