//! # TCP Transport
//!
//! Length-prefixed frames over a TCP connection: 4-byte big-endian
//! length, then the JSON payload. One logical channel per socket.
//!
//! An oversize incoming frame is discarded in place (its bytes are read
//! and dropped) so the stream stays framed; malformed JSON closes the
//! connection as a protocol error.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{Channel, TransportKind};
use crate::error::{Error, Result};
use crate::wire::{self, Frame, MAX_FRAME_SIZE};

/// A framed channel over one TCP socket.
pub struct TcpChannel {
    kind: TransportKind,
    local: SocketAddr,
    remote: SocketAddr,
    out_tx: mpsc::Sender<Frame>,
    in_rx: Mutex<mpsc::Receiver<Frame>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpChannel {
    /// Dial `addr` and wrap the socket. `kind` records how the address
    /// was obtained (direct, mapped, hole-punched).
    pub async fn connect(addr: SocketAddr, kind: TransportKind) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("tcp connect {addr}: {e}")))?;
        Self::from_stream(stream, kind)
    }

    /// Wrap an already-connected socket (accepted, or the winner of a
    /// simultaneous-open hole punch).
    pub fn from_stream(stream: TcpStream, kind: TransportKind) -> Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let (out_tx, out_rx) = mpsc::channel::<Frame>(64);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(64);

        let reader = tokio::spawn(read_pump(read_half, in_tx, remote));
        let writer = tokio::spawn(write_pump(write_half, out_rx, remote));

        Ok(Self {
            kind,
            local,
            remote,
            out_tx,
            in_rx: Mutex::new(in_rx),
            tasks: parking_lot::Mutex::new(vec![reader, writer]),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn transport(&self) -> TransportKind {
        self.kind
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed(self.remote.to_string()));
        }
        // Size check up front so oversize frames fail loudly at the caller
        // instead of inside the write task.
        wire::encode(&frame, MAX_FRAME_SIZE)?;
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
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn read_pump(read_half: OwnedReadHalf, in_tx: mpsc::Sender<Frame>, remote: SocketAddr) {
    let mut reader = BufReader::new(read_half);
    loop {
        match wire::read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(Error::FrameTooLarge { size, limit }) => {
                // Keep the stream framed: consume and discard the payload.
                tracing::warn!(%remote, size, limit, "dropping oversize tcp frame");
                if discard(&mut reader, size).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(%remote, error = %e, "tcp read ended");
                break;
            }
        }
    }
    // in_tx drops here; recv() yields None once drained.
}

async fn write_pump(
    write_half: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Frame>,
    remote: SocketAddr,
) {
    let mut writer = BufWriter::new(write_half);
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = wire::write_frame(&mut writer, &frame).await {
            tracing::debug!(%remote, error = %e, "tcp write ended");
            break;
        }
    }
}

async fn discard<R>(reader: &mut R, mut remaining: usize) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut sink = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(sink.len());
        let n = reader.read(&mut sink[..want]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        remaining -= n;
    }
    Ok(())
}

// ============================================================================
// LISTENER
// ============================================================================

/// A bound TCP listener handing accepted sockets out as channels.
pub struct TcpAcceptor {
    local: SocketAddr,
    rx: mpsc::Receiver<TcpChannel>,
    task: JoinHandle<()>,
}

impl TcpAcceptor {
    /// Bind `addr` (port 0 picks any) and start accepting.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        match TcpChannel::from_stream(stream, TransportKind::DirectTcp) {
                            Ok(channel) => {
                                if tx.send(channel).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(%peer, error = %e, "failed to wrap accepted socket");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "tcp accept failed");
                    }
                }
            }
        });
        Ok(Self { local, rx, task })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Next inbound channel. `None` after [`shutdown`](Self::shutdown).
    pub async fn accept(&mut self) -> Option<TcpChannel> {
        self.rx.recv().await
    }

    /// Stop accepting and release the socket.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for TcpAcceptor {
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
    use crate::identity::NodeId;
    use crate::wire::PROTOCOL_VERSION;

    async fn pair() -> (TcpChannel, TcpChannel) {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let dialer = TcpChannel::connect(acceptor.local_addr(), TransportKind::DirectTcp)
            .await
            .unwrap();
        let accepted = acceptor.accept().await.unwrap();
        (dialer, accepted)
    }

    #[tokio::test]
    async fn test_frames_cross_in_order() {
        let (a, b) = pair().await;

        for nonce in 0..10u64 {
            a.send(Frame::Ping { nonce }).await.unwrap();
        }
        for nonce in 0..10u64 {
            assert_eq!(b.recv().await.unwrap(), Frame::Ping { nonce });
        }
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_handshake_both_directions() {
        let (a, b) = pair().await;
        let id_a = NodeId::random();
        let id_b = NodeId::random();

        a.send(Frame::Handshake { node_id: id_a, version: PROTOCOL_VERSION })
            .await
            .unwrap();
        b.send(Frame::Handshake { node_id: id_b, version: PROTOCOL_VERSION })
            .await
            .unwrap();

        match b.recv().await.unwrap() {
            Frame::Handshake { node_id, .. } => assert_eq!(node_id, id_a),
            other => panic!("unexpected {other:?}"),
        }
        match a.recv().await.unwrap() {
            Frame::Handshake { node_id, .. } => assert_eq!(node_id, id_b),
            other => panic!("unexpected {other:?}"),
        }
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_close_ends_remote_recv() {
        let (a, b) = pair().await;
        a.close().await;
        assert!(b.recv().await.is_none());
        b.close().await;
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, b) = pair().await;
        a.close().await;
        let err = a.send(Frame::Ping { nonce: 1 }).await.unwrap_err();
        assert_eq!(err.kind(), "connection-closed");
        b.close().await;
    }

    #[tokio::test]
    async fn test_oversize_send_rejected_without_closing() {
        let (a, b) = pair().await;
        let too_big = Frame::ChunkResponse {
            digest: "00".repeat(32),
            chunk_index: 0,
            data: vec![0u8; 2 * MAX_FRAME_SIZE],
        };
        assert_eq!(a.send(too_big).await.unwrap_err().kind(), "frame-too-large");

        // Channel still works.
        a.send(Frame::Ping { nonce: 42 }).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Frame::Ping { nonce: 42 });
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_chunk_payload_round_trip() {
        let (a, b) = pair().await;
        let data: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        a.send(Frame::ChunkResponse {
            digest: "ab".repeat(32),
            chunk_index: 7,
            data: data.clone(),
        })
        .await
        .unwrap();

        match b.recv().await.unwrap() {
            Frame::ChunkResponse { chunk_index, data: got, .. } => {
                assert_eq!(chunk_index, 7);
                assert_eq!(got, data);
            }
            other => panic!("unexpected {other:?}"),
        }
        a.close().await;
        b.close().await;
    }
}
