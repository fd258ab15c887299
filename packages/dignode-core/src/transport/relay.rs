//! # Relay Transport
//!
//! Last-resort transport: frames tunnelled through the gossip substrate
//! on a pair of directional channels keyed by `(sender, receiver,
//! nonce)`. The dialer posts an open request to the remote's relay
//! inbox, subscribes to the remote→local channel, and the remote
//! answers with a `ready` marker before frames flow. Slow and chatty,
//! but it works wherever the mesh does.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{Channel, TransportKind};
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::mesh::{relay_inbox_channel, SharedMesh};
use crate::time::now_timestamp_millis;
use crate::wire::{self, Frame, MAX_FRAME_SIZE};

/// How long the dialer waits for the remote's `ready`.
const OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Open requests older than this are ignored (replay guard).
const MAX_OPEN_AGE_MS: i64 = 30_000;

/// Posted to the remote's relay inbox to request a tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayOpen {
    from: NodeId,
    to: NodeId,
    nonce: String,
    timestamp: i64,
}

/// Everything that travels on a relay data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum RelayPayload {
    /// The receiver is subscribed; frames may flow.
    Ready,
    /// One tunnelled frame.
    Frame { frame: Frame },
}

/// Directional data channel name: `sender → receiver`.
fn data_channel(namespace: &str, sender: &NodeId, receiver: &NodeId, nonce: &str) -> String {
    format!("{namespace}/relay/{sender}/{receiver}/{nonce}")
}

/// A framed channel tunnelled over the mesh.
pub struct RelayChannel {
    mesh: SharedMesh,
    remote: NodeId,
    send_channel: String,
    recv_channel: String,
    in_rx: Mutex<mpsc::Receiver<Frame>>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RelayChannel {
    async fn assemble(
        mesh: SharedMesh,
        remote: NodeId,
        send_channel: String,
        recv_channel: String,
        mut mesh_rx: mpsc::Receiver<crate::mesh::MeshMessage>,
        ready_tx: Option<tokio::sync::oneshot::Sender<()>>,
    ) -> Self {
        let (in_tx, in_rx) = mpsc::channel(64);
        let pump = tokio::spawn(async move {
            let mut ready_tx = ready_tx;
            while let Some(msg) = mesh_rx.recv().await {
                if msg.payload.len() > MAX_FRAME_SIZE + 1024 {
                    tracing::warn!("dropping oversize relay payload");
                    continue;
                }
                match serde_json::from_slice::<RelayPayload>(&msg.payload) {
                    Ok(RelayPayload::Ready) => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    Ok(RelayPayload::Frame { frame }) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring malformed relay payload");
                    }
                }
            }
        });
        Self {
            mesh,
            remote,
            send_channel,
            recv_channel,
            in_rx: Mutex::new(in_rx),
            pump: parking_lot::Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        }
    }

    /// The node on the far end of the tunnel.
    pub fn remote_node(&self) -> NodeId {
        self.remote
    }

    async fn publish(&self, payload: &RelayPayload) -> Result<()> {
        self.mesh
            .publish(&self.send_channel, serde_json::to_vec(payload)?)
            .await
    }
}

#[async_trait]
impl Channel for RelayChannel {
    fn transport(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed(self.remote.to_hex()));
        }
        wire::encode(&frame, MAX_FRAME_SIZE)?;
        self.publish(&RelayPayload::Frame { frame }).await
    }

    async fn recv(&self) -> Option<Frame> {
        self.in_rx.lock().await.recv().await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.mesh.unsubscribe(&self.recv_channel).await;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

// ============================================================================
// OPEN / LISTEN
// ============================================================================

/// Dial a relay tunnel to `remote`.
pub async fn open(
    mesh: SharedMesh,
    namespace: &str,
    local: NodeId,
    remote: NodeId,
) -> Result<RelayChannel> {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let send_channel = data_channel(namespace, &local, &remote, &nonce);
    let recv_channel = data_channel(namespace, &remote, &local, &nonce);

    let mesh_rx = mesh.subscribe(&recv_channel).await?;
    let (ready_tx, mut ready_rx) = tokio::sync::oneshot::channel();
    let channel = RelayChannel::assemble(
        mesh.clone(),
        remote,
        send_channel,
        recv_channel,
        mesh_rx,
        Some(ready_tx),
    )
    .await;

    let open = RelayOpen { from: local, to: remote, nonce, timestamp: now_timestamp_millis() };
    let open_bytes = serde_json::to_vec(&open)?;
    let inbox = relay_inbox_channel(namespace, &remote);

    // Repost the open request until the remote subscribes and answers.
    let deadline = tokio::time::Instant::now() + OPEN_TIMEOUT;
    loop {
        mesh.publish(&inbox, open_bytes.clone()).await?;
        match tokio::time::timeout(Duration::from_secs(1), &mut ready_rx).await {
            Ok(Ok(())) => return Ok(channel),
            Ok(Err(_)) => {
                channel.close().await;
                return Err(Error::ConnectionFailed("relay pump died".into()));
            }
            Err(_) => {
                if tokio::time::Instant::now() >= deadline {
                    channel.close().await;
                    return Err(Error::ConnectionFailed(format!(
                        "relay open to {remote} timed out"
                    )));
                }
            }
        }
    }
}

/// Inbound relay tunnels for this node.
pub struct RelayListener {
    rx: mpsc::Receiver<RelayChannel>,
    task: JoinHandle<()>,
}

impl RelayListener {
    /// Subscribe to the local relay inbox and answer open requests.
    pub async fn spawn(mesh: SharedMesh, namespace: &str, local: NodeId) -> Result<Self> {
        let mut inbox_rx = mesh.subscribe(&relay_inbox_channel(namespace, &local)).await?;
        let namespace = namespace.to_string();
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let mut seen: Vec<(NodeId, String)> = Vec::new();
            while let Some(msg) = inbox_rx.recv().await {
                let open: RelayOpen = match serde_json::from_slice(&msg.payload) {
                    Ok(open) => open,
                    Err(_) => continue,
                };
                if open.to != local {
                    continue;
                }
                if (now_timestamp_millis() - open.timestamp).abs() > MAX_OPEN_AGE_MS {
                    continue;
                }
                // The dialer reposts until our ready lands; answer once.
                let key = (open.from, open.nonce.clone());
                if seen.contains(&key) {
                    continue;
                }
                if seen.len() >= 64 {
                    seen.remove(0);
                }
                seen.push(key);

                let send_channel = data_channel(&namespace, &local, &open.from, &open.nonce);
                let recv_channel = data_channel(&namespace, &open.from, &local, &open.nonce);
                let mesh_rx = match mesh.subscribe(&recv_channel).await {
                    Ok(rx) => rx,
                    Err(e) => {
                        tracing::warn!(error = %e, "relay subscribe failed");
                        continue;
                    }
                };
                let channel = RelayChannel::assemble(
                    mesh.clone(),
                    open.from,
                    send_channel,
                    recv_channel,
                    mesh_rx,
                    None,
                )
                .await;
                if channel.publish(&RelayPayload::Ready).await.is_err() {
                    continue;
                }
                if tx.send(channel).await.is_err() {
                    break;
                }
            }
        });
        Ok(Self { rx, task })
    }

    /// Next inbound tunnel.
    pub async fn accept(&mut self) -> Option<RelayChannel> {
        self.rx.recv().await
    }

    /// Stop answering open requests.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MemoryMeshHub;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_open_and_exchange_frames() {
        let hub = MemoryMeshHub::new();
        let id_a = NodeId::random();
        let id_b = NodeId::random();
        let mesh_a: SharedMesh = Arc::new(hub.handle());
        let mesh_b: SharedMesh = Arc::new(hub.handle());

        let mut listener = RelayListener::spawn(mesh_b, "ns", id_b).await.unwrap();
        let dialed = open(mesh_a, "ns", id_a, id_b).await.unwrap();
        let accepted = listener.accept().await.unwrap();

        assert_eq!(dialed.transport(), TransportKind::Relay);
        assert_eq!(accepted.remote_node(), id_a);

        dialed.send(Frame::Ping { nonce: 1 }).await.unwrap();
        assert_eq!(accepted.recv().await.unwrap(), Frame::Ping { nonce: 1 });

        accepted.send(Frame::Ping { nonce: 2 }).await.unwrap();
        assert_eq!(dialed.recv().await.unwrap(), Frame::Ping { nonce: 2 });

        dialed.close().await;
        accepted.close().await;
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_frames_in_order_through_tunnel() {
        let hub = MemoryMeshHub::new();
        let id_a = NodeId::random();
        let id_b = NodeId::random();

        let mut listener =
            RelayListener::spawn(Arc::new(hub.handle()), "ns", id_b).await.unwrap();
        let dialed = open(Arc::new(hub.handle()), "ns", id_a, id_b).await.unwrap();
        let accepted = listener.accept().await.unwrap();

        for nonce in 0..10u64 {
            dialed.send(Frame::Ping { nonce }).await.unwrap();
        }
        for nonce in 0..10u64 {
            assert_eq!(accepted.recv().await.unwrap(), Frame::Ping { nonce });
        }

        dialed.close().await;
        accepted.close().await;
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_open_times_out_without_listener() {
        // Nobody answers on this namespace.
        let hub = MemoryMeshHub::new();
        let result = tokio::time::timeout(
            Duration::from_secs(20),
            open(Arc::new(hub.handle()), "ns", NodeId::random(), NodeId::random()),
        )
        .await
        .expect("open should time out on its own");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_open_answered_once() {
        let hub = MemoryMeshHub::new();
        let id_a = NodeId::random();
        let id_b = NodeId::random();

        let mut listener =
            RelayListener::spawn(Arc::new(hub.handle()), "ns", id_b).await.unwrap();
        let _dialed = open(Arc::new(hub.handle()), "ns", id_a, id_b).await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        // The repost loop may have published several opens; no second
        // channel appears.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), listener.accept())
                .await
                .is_err()
        );
        listener.shutdown();
    }
}
