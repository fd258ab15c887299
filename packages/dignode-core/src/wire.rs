//! # Wire Frames
//!
//! The typed message set every transport speaks. Frames are tagged JSON
//! (`type` field, kebab-case) so the same codec serves TCP, UDP, WebRTC
//! data channels, and the mesh relay; chunk bodies travel base64-encoded.
//!
//! Stream transports carry frames behind a 4-byte big-endian length
//! prefix. Datagram transports carry one frame per datagram (fragmented
//! above the MTU, see `transport::udp`). Every transport enforces a
//! per-frame maximum and drops oversize frames without state change.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::identity::NodeId;

/// Maximum encoded frame size on stream transports (TCP, WebRTC, relay).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum datagram payload on the UDP transport.
pub const MAX_UDP_FRAME_SIZE: usize = 1500;

/// Wire protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// A protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// First frame on every new channel, in both directions.
    Handshake {
        /// Sender's node id
        node_id: NodeId,
        /// Wire protocol version
        version: u32,
    },

    /// Ask for the shape of a blob.
    MetadataRequest {
        /// Content digest
        digest: String,
    },

    /// Answer to a metadata request.
    MetadataResponse {
        digest: String,
        /// Total blob size in bytes
        total_bytes: u64,
        /// Number of chunks at `chunk_size`
        total_chunks: u64,
        /// Negotiated chunk size
        chunk_size: u32,
    },

    /// Ask for one chunk.
    ChunkRequest {
        digest: String,
        chunk_index: u64,
    },

    /// One chunk of content.
    ChunkResponse {
        digest: String,
        chunk_index: u64,
        /// Chunk bytes, base64 in the JSON encoding
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Drop any in-flight or queued response for this chunk.
    Cancel {
        digest: String,
        chunk_index: u64,
    },

    /// Sender now holds this chunk; feeds super-seed spread tracking.
    Have {
        digest: String,
        chunk_index: u64,
    },

    /// Sender will refuse chunk requests from us until unchoked.
    Choke,

    /// Sender will serve our chunk requests again.
    Unchoke,

    /// Keepalive.
    Ping {
        nonce: u64,
    },

    /// Request-level failure; context fields are filled where they apply.
    Error {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        digest: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunk_index: Option<u64>,
    },
}

impl Frame {
    /// Stable frame-type name, as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Handshake { .. } => "handshake",
            Frame::MetadataRequest { .. } => "metadata-request",
            Frame::MetadataResponse { .. } => "metadata-response",
            Frame::ChunkRequest { .. } => "chunk-request",
            Frame::ChunkResponse { .. } => "chunk-response",
            Frame::Cancel { .. } => "cancel",
            Frame::Have { .. } => "have",
            Frame::Choke => "choke",
            Frame::Unchoke => "unchoke",
            Frame::Ping { .. } => "ping",
            Frame::Error { .. } => "error",
        }
    }

    /// Request-class frames get reliable delivery on the UDP transport
    /// (retransmit until acked). Responses are fire-and-forget there;
    /// loss is recovered by request retry.
    pub fn needs_ack(&self) -> bool {
        matches!(
            self,
            Frame::Handshake { .. }
                | Frame::MetadataRequest { .. }
                | Frame::ChunkRequest { .. }
                | Frame::Cancel { .. }
                | Frame::Choke
                | Frame::Unchoke
        )
    }

    /// A refusal because the requester is currently choked.
    pub fn choked_error(digest: &str, chunk_index: u64) -> Frame {
        Frame::Error {
            reason: "choked".into(),
            digest: Some(digest.to_string()),
            chunk_index: Some(chunk_index),
        }
    }
}

/// Encode a frame to its JSON wire form, enforcing `max` bytes.
pub fn encode(frame: &Frame, max: usize) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > max {
        return Err(Error::FrameTooLarge { size: bytes.len(), limit: max });
    }
    Ok(bytes)
}

/// Decode a frame from its JSON wire form, enforcing `max` bytes.
pub fn decode(bytes: &[u8], max: usize) -> Result<Frame> {
    if bytes.len() > max {
        return Err(Error::FrameTooLarge { size: bytes.len(), limit: max });
    }
    serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("malformed frame: {e}")))
}

// ============================================================================
// LENGTH-PREFIXED STREAM HELPERS
// ============================================================================

/// Write a frame behind a 4-byte big-endian length prefix.
pub async fn write_frame<W>(io: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let bytes = encode(frame, MAX_FRAME_SIZE)?;
    io.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` on clean end-of-stream.
pub async fn read_frame<R>(io: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    match io.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge { size: len, limit: MAX_FRAME_SIZE });
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    decode(&buf, MAX_FRAME_SIZE).map(Some)
}

// ============================================================================
// BASE64 BODY ADAPTER
// ============================================================================

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(de::Error::custom)
    }
}

// ============================================================================
// TESTS
// ============================================================================
