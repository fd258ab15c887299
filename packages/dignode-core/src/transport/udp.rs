//! # UDP Transport
//!
//! One frame per datagram, with three pieces of machinery layered on the
//! raw socket:
//!
//! - **Fragmentation.** A frame larger than the datagram budget is split
//!   into fragments behind a 3-byte header `{msg_id, frag_index, flags}`
//!   and reassembled on the far side.
//! - **Reliability for requests.** Request-class frames (see
//!   [`Frame::needs_ack`]) are retransmitted with exponential backoff
//!   until the receiver acks the message id. Chunk responses are
//!   fire-and-forget; a lost response is recovered by request retry.
//! - **Ordering.** Message ids double as per-peer sequence numbers; a
//!   reorder buffer delivers frames to the application in send order.
//!
//! A single bound socket serves every peer; the endpoint demuxes by
//! source address. Datagrams above the packet-size limit are dropped
//! without any connection state change. 16-byte hole-punch test packets
//! share the socket and are routed to the puncher, not the framing layer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{Channel, TransportKind};
use crate::error::{Error, Result};
use crate::nat::punch::{is_test_packet, TEST_PACKET_LEN};
use crate::wire::{self, Frame, MAX_UDP_FRAME_SIZE};

/// Fragment payload budget, leaving header room inside a safe MTU.
const FRAG_PAYLOAD: usize = 1200;

/// Fragment count is a u8, so this bounds the encoded frame size.
pub const MAX_UDP_MESSAGE_SIZE: usize = FRAG_PAYLOAD * 256;

/// Datagram header length.
const HEADER_LEN: usize = 3;

/// Final-fragment flag.
const FLAG_FINAL: u8 = 0b0000_0001;
/// Acknowledgement datagram (no payload).
const FLAG_ACK: u8 = 0b0000_0010;

/// Retransmit schedule for request-class frames.
const RETRANSMIT_BACKOFF: [Duration; 6] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

/// Reorder buffer size at which head-of-line loss is declared and the
/// sequence skips forward.
const REORDER_SKIP_THRESHOLD: usize = 32;

type PeerMap = Arc<parking_lot::Mutex<HashMap<SocketAddr, Arc<PeerShared>>>>;

/// Per-peer state shared between the endpoint's receive loop and the
/// peer's channel.
struct PeerShared {
    in_tx: mpsc::Sender<Frame>,
    pending_acks: parking_lot::Mutex<HashMap<u8, oneshot::Sender<()>>>,
}

/// Receive-side state, owned exclusively by the endpoint's receive loop.
#[derive(Default)]
struct RecvState {
    /// msg_id → (total fragment count once known, fragments)
    reassembly: HashMap<u8, (Option<usize>, HashMap<u8, Vec<u8>>)>,
    /// Completed-but-early frames waiting for their turn
    reorder: HashMap<u8, Frame>,
    /// Next msg_id owed to the application
    next_expected: u8,
    /// Recently completed ids, for duplicate suppression and re-acking
    recently_done: Vec<u8>,
}

impl RecvState {
    fn mark_done(&mut self, msg_id: u8) {
        if self.recently_done.len() >= 64 {
            self.recently_done.remove(0);
        }
        self.recently_done.push(msg_id);
    }
}

/// The shared UDP socket plus its demultiplexing receive loop.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peers: PeerMap,
    punch_sink: Arc<parking_lot::Mutex<Option<mpsc::Sender<(SocketAddr, Vec<u8>)>>>>,
    stun_sink: Arc<parking_lot::Mutex<Option<mpsc::Sender<(SocketAddr, Vec<u8>)>>>>,
    recv_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Queue of inbound channels from peers we had no state for.
pub struct UdpAcceptQueue {
    rx: mpsc::Receiver<UdpChannel>,
}

impl UdpAcceptQueue {
    /// Next inbound channel. `None` once the endpoint shuts down.
    pub async fn accept(&mut self) -> Option<UdpChannel> {
        self.rx.recv().await
    }
}

impl UdpEndpoint {
    /// Bind the shared socket (port 0 picks any) and start demuxing.
    pub async fn bind(addr: SocketAddr) -> Result<(Arc<Self>, UdpAcceptQueue)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let peers: PeerMap = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let punch_sink = Arc::new(parking_lot::Mutex::new(None));
        let (accept_tx, accept_rx) = mpsc::channel(16);

        let endpoint = Arc::new(Self {
            socket: socket.clone(),
            local,
            peers: peers.clone(),
            punch_sink: punch_sink.clone(),
            stun_sink: Arc::new(parking_lot::Mutex::new(None)),
            recv_task: parking_lot::Mutex::new(None),
        });

        let recv_endpoint = endpoint.clone();
        let task = tokio::spawn(async move {
            recv_loop(recv_endpoint, accept_tx).await;
        });
        *endpoint.recv_task.lock() = Some(task);

        Ok((endpoint, UdpAcceptQueue { rx: accept_rx }))
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Send raw bytes (hole-punch test packets) through the shared socket.
    pub async fn send_raw(&self, bytes: &[u8], to: SocketAddr) -> Result<()> {
        self.socket.send_to(bytes, to).await?;
        Ok(())
    }

    /// Route incoming 16-byte test packets to the puncher while a punch
    /// attempt is in flight.
    pub fn set_punch_sink(&self, sink: Option<mpsc::Sender<(SocketAddr, Vec<u8>)>>) {
        *self.punch_sink.lock() = sink;
    }

    /// Route incoming STUN messages to the discovery client. STUN shares
    /// this socket so the mapping it discovers is the transport's own.
    pub fn set_stun_sink(&self, sink: Option<mpsc::Sender<(SocketAddr, Vec<u8>)>>) {
        *self.stun_sink.lock() = sink;
    }

    /// Open a channel to `remote` over the shared socket.
    pub fn connect(self: &Arc<Self>, remote: SocketAddr, kind: TransportKind) -> UdpChannel {
        let (channel, shared) = UdpChannel::new(self.clone(), remote, kind);
        self.peers.lock().insert(remote, shared);
        channel
    }

    /// Drop all peers and stop the receive loop.
    pub fn shutdown(&self) {
        self.peers.lock().clear();
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
    }

    fn remove_peer(&self, remote: &SocketAddr) {
        self.peers.lock().remove(remote);
    }

    async fn send_ack(&self, msg_id: u8, to: SocketAddr) {
        let ack = [msg_id, 0, FLAG_ACK];
        let _ = self.socket.send_to(&ack, to).await;
    }
}

async fn recv_loop(endpoint: Arc<UdpEndpoint>, accept_tx: mpsc::Sender<UdpChannel>) {
    let mut states: HashMap<SocketAddr, RecvState> = HashMap::new();
    let mut buf = vec![0u8; MAX_UDP_FRAME_SIZE + 1];
    loop {
        let (len, from) = match endpoint.socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(error = %e, "udp recv ended");
                break;
            }
        };

        // Oversize packets are dropped; no state change.
        if len > MAX_UDP_FRAME_SIZE {
            tracing::warn!(%from, len, "dropping oversize udp packet");
            continue;
        }

        // Hole-punch test packets bypass the framing layer entirely.
        if len == TEST_PACKET_LEN && is_test_packet(&buf[..len]) {
            let sink = endpoint.punch_sink.lock().clone();
            if let Some(sink) = sink {
                let _ = sink.send((from, buf[..len].to_vec())).await;
            }
            continue;
        }

        // So do STUN responses (magic cookie at bytes 4..8).
        if stun::message::is_message(&buf[..len]) {
            let sink = endpoint.stun_sink.lock().clone();
            if let Some(sink) = sink {
                let _ = sink.send((from, buf[..len].to_vec())).await;
            }
            continue;
        }

        if len < HEADER_LEN {
            continue;
        }
        let (msg_id, frag_index, flags) = (buf[0], buf[1], buf[2]);

        if flags & FLAG_ACK != 0 {
            let shared = endpoint.peers.lock().get(&from).cloned();
            if let Some(shared) = shared {
                if let Some(tx) = shared.pending_acks.lock().remove(&msg_id) {
                    let _ = tx.send(());
                }
            }
            continue;
        }

        // Data fragment. Unknown source ⇒ new inbound channel.
        let shared = {
            let existing = endpoint.peers.lock().get(&from).cloned();
            match existing {
                Some(s) => s,
                None => {
                    let (channel, shared) =
                        UdpChannel::new(endpoint.clone(), from, TransportKind::DirectUdp);
                    endpoint.peers.lock().insert(from, shared.clone());
                    if accept_tx.send(channel).await.is_err() {
                        break;
                    }
                    shared
                }
            }
        };
        let state = states.entry(from).or_default();

        // Duplicate of a finished message: re-ack and drop.
        if state.recently_done.contains(&msg_id) {
            endpoint.send_ack(msg_id, from).await;
            continue;
        }

        let payload = buf[HEADER_LEN..len].to_vec();
        let entry = state.reassembly.entry(msg_id).or_insert((None, HashMap::new()));
        entry.1.insert(frag_index, payload);
        if flags & FLAG_FINAL != 0 {
            entry.0 = Some(frag_index as usize + 1);
        }

        let complete = matches!(entry.0, Some(total) if entry.1.len() == total);
        if !complete {
            continue;
        }

        let (total, mut frags) = state.reassembly.remove(&msg_id).expect("entry just seen");
        let total = total.expect("total known for complete message");
        let mut bytes = Vec::new();
        for i in 0..total {
            match frags.remove(&(i as u8)) {
                Some(frag) => bytes.extend_from_slice(&frag),
                None => {
                    // Gap despite matching count; discard the message.
                    tracing::warn!(%from, msg_id, "udp reassembly gap");
                    bytes.clear();
                    break;
                }
            }
        }
        if bytes.is_empty() && total > 0 {
            continue;
        }

        let frame = match wire::decode(&bytes, MAX_UDP_MESSAGE_SIZE) {
            Ok(frame) => frame,
            Err(e) => {
                // Malformed frame: a protocol error closes this peer.
                tracing::warn!(%from, error = %e, "malformed udp frame; closing peer");
                endpoint.remove_peer(&from);
                states.remove(&from);
                continue;
            }
        };

        state.mark_done(msg_id);
        if frame.needs_ack() {
            endpoint.send_ack(msg_id, from).await;
        }

        // Old message that already went past: drop.
        let distance = msg_id.wrapping_sub(state.next_expected);
        if distance >= 128 {
            continue;
        }
        state.reorder.insert(msg_id, frame);

        // Head-of-line loss: skip to the earliest buffered message.
        if state.reorder.len() >= REORDER_SKIP_THRESHOLD
            && !state.reorder.contains_key(&state.next_expected)
        {
            if let Some(&earliest) = state
                .reorder
                .keys()
                .min_by_key(|id| id.wrapping_sub(state.next_expected))
            {
                tracing::debug!(%from, skipped_to = earliest, "udp sequence skip");
                state.next_expected = earliest;
            }
        }

        while let Some(frame) = state.reorder.remove(&state.next_expected) {
            state.next_expected = state.next_expected.wrapping_add(1);
            if shared.in_tx.send(frame).await.is_err() {
                endpoint.remove_peer(&from);
                states.remove(&from);
                break;
            }
        }
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

/// A framed channel to one peer over the shared UDP socket.
pub struct UdpChannel {
    endpoint: Arc<UdpEndpoint>,
    kind: TransportKind,
    remote: SocketAddr,
    out_tx: mpsc::Sender<Frame>,
    in_rx: Mutex<mpsc::Receiver<Frame>>,
    shared: Arc<PeerShared>,
    out_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl UdpChannel {
    fn new(
        endpoint: Arc<UdpEndpoint>,
        remote: SocketAddr,
        kind: TransportKind,
    ) -> (Self, Arc<PeerShared>) {
        let (in_tx, in_rx) = mpsc::channel::<Frame>(64);
        let (out_tx, out_rx) = mpsc::channel::<Frame>(64);
        let shared = Arc::new(PeerShared {
            in_tx,
            pending_acks: parking_lot::Mutex::new(HashMap::new()),
        });

        let out_task = tokio::spawn(out_loop(
            endpoint.clone(),
            remote,
            out_rx,
            shared.clone(),
        ));

        let channel = Self {
            endpoint,
            kind,
            remote,
            out_tx,
            in_rx: Mutex::new(in_rx),
            shared: shared.clone(),
            out_task: parking_lot::Mutex::new(Some(out_task)),
            closed: AtomicBool::new(false),
        };
        (channel, shared)
    }
}

#[async_trait]
impl Channel for UdpChannel {
    fn transport(&self) -> TransportKind {
        self.kind
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.endpoint.local_addr())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed(self.remote.to_string()));
        }
        wire::encode(&frame, MAX_UDP_MESSAGE_SIZE)?;
        self.out_tx
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed(self.remote.to_string()))
    }

    async fn recv(&self) -> Option<Frame> {
        self.in_rx.lock().await.recv().await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.endpoint.remove_peer(&self.remote);
        self.shared.pending_acks.lock().clear();
        if let Some(task) = self.out_task.lock().take() {
            task.abort();
        }
    }
}

/// Serializes outbound frames so message ids follow send order, and
/// drives retransmission for request-class frames.
async fn out_loop(
    endpoint: Arc<UdpEndpoint>,
    remote: SocketAddr,
    mut out_rx: mpsc::Receiver<Frame>,
    shared: Arc<PeerShared>,
) {
    let mut next_msg_id: u8 = 0;
    while let Some(frame) = out_rx.recv().await {
        let msg_id = next_msg_id;
        next_msg_id = next_msg_id.wrapping_add(1);

        let bytes = match wire::encode(&frame, MAX_UDP_MESSAGE_SIZE) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%remote, error = %e, "dropping unencodable udp frame");
                continue;
            }
        };
        let datagrams = fragment(msg_id, &bytes);

        for dg in &datagrams {
            if endpoint.socket.send_to(dg, remote).await.is_err() {
                return;
            }
        }

        if frame.needs_ack() {
            let (ack_tx, ack_rx) = oneshot::channel();
            shared.pending_acks.lock().insert(msg_id, ack_tx);
            let endpoint = endpoint.clone();
            let shared = shared.clone();
            tokio::spawn(async move {
                retransmit(endpoint, remote, msg_id, datagrams, ack_rx, shared).await;
            });
        }
    }
}

/// Resend the whole fragment set on the backoff schedule until acked.
/// Exhausting the schedule abandons the peer.
async fn retransmit(
    endpoint: Arc<UdpEndpoint>,
    remote: SocketAddr,
    msg_id: u8,
    datagrams: Vec<Vec<u8>>,
    mut ack_rx: oneshot::Receiver<()>,
    shared: Arc<PeerShared>,
) {
    for delay in RETRANSMIT_BACKOFF {
        match tokio::time::timeout(delay, &mut ack_rx).await {
            Ok(_) => return,
            Err(_) => {
                for dg in &datagrams {
                    if endpoint.socket.send_to(dg, remote).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    tracing::warn!(%remote, msg_id, "udp request unacked after retries; dropping peer");
    shared.pending_acks.lock().remove(&msg_id);
    endpoint.remove_peer(&remote);
}

fn fragment(msg_id: u8, bytes: &[u8]) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[][..]]
    } else {
        bytes.chunks(FRAG_PAYLOAD).collect()
    };
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut dg = Vec::with_capacity(HEADER_LEN + chunk.len());
            dg.push(msg_id);
            dg.push(i as u8);
            dg.push(if i == last { FLAG_FINAL } else { 0 });
            dg.extend_from_slice(chunk);
            dg
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
