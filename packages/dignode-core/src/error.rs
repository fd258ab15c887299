//! # Error Handling
//!
//! Error types for dignode-core.
//!
//! Every error carries a machine-readable `kind()` so the orchestrator can
//! route it: transient network failures fall through to the next transport,
//! integrity failures count strikes against the serving peer, protocol
//! errors close the offending connection.

use thiserror::Error;

/// Result type alias for dignode-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dignode-core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle Errors
    // ========================================================================

    /// Node is already running
    #[error("Node is already running.")]
    AlreadyRunning,

    /// Node is not running
    #[error("Node is not running.")]
    NotRunning,

    /// Node is shutting down
    #[error("Node is shutting down.")]
    ShutdownInProgress,

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    // ========================================================================
    // Configuration Errors
    // ========================================================================

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Store Errors
    // ========================================================================

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Digest string is not 64 lowercase hex chars
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Computed digest differs from the expected one
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the caller asked for
        expected: String,
        /// The digest the bytes actually hash to
        actual: String,
    },

    /// No local record for the requested digest
    #[error("Content not found: {0}")]
    NotFound(String),

    // ========================================================================
    // Wire / Protocol Errors
    // ========================================================================

    /// Malformed or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame exceeds the transport's maximum size
    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Encoded frame size
        size: usize,
        /// Transport limit
        limit: usize,
    },

    /// Serialization / deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ========================================================================
    // Network Errors
    // ========================================================================

    /// Failed to establish a connection
    #[error("Failed to connect to peer: {0}")]
    ConnectionFailed(String),

    /// Connection closed under us
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Peer is unknown or no longer live
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote refused the request because we are choked
    #[error("Request refused: choked")]
    Choked,

    // ========================================================================
    // NAT Traversal Errors
    // ========================================================================

    /// STUN discovery failed
    #[error("STUN error: {0}")]
    Stun(String),

    /// UPnP / NAT-PMP port mapping failed
    #[error("Port mapping error: {0}")]
    PortMapping(String),

    /// Hole punch attempt failed
    #[error("Hole punch failed: {0}")]
    HolePunch(String),

    /// Address failed validation (loopback/private range, bad port)
    #[error("Address rejected: {0}")]
    AddressRejected(String),

    /// Signaling message failed validation
    #[error("Invalid signaling message: {0}")]
    InvalidSignaling(String),

    // ========================================================================
    // Transfer Errors
    // ========================================================================

    /// No metadata response within the request timeout
    #[error("Metadata request timed out for {0}")]
    MetadataTimeout(String),

    /// A chunk exhausted its retry budget on every peer
    #[error("Chunk {chunk} of {digest} unavailable")]
    ChunkUnavailable {
        /// Content digest
        digest: String,
        /// Chunk index that could not be fetched
        chunk: u64,
    },

    /// Final hash did not match the requested digest
    #[error("Integrity failure for {digest}")]
    IntegrityFailure {
        /// The digest the download was verifying against
        digest: String,
    },

    /// A transfer for this digest is already in flight
    #[error("Transfer already in progress for {0}")]
    TransferInProgress(String),

    // ========================================================================
    // Mesh Errors
    // ========================================================================

    /// Gossip substrate failure
    #[error("Mesh error: {0}")]
    Mesh(String),

    // ========================================================================
    // Internal Errors
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Machine-readable error kind, stable across message wording changes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AlreadyRunning => "already-running",
            Error::NotRunning => "not-running",
            Error::ShutdownInProgress => "shutting-down",
            Error::Cancelled => "cancelled",
            Error::InvalidConfig(_) => "invalid-config",
            Error::Io(_) => "io",
            Error::InvalidDigest(_) => "invalid-digest",
            Error::DigestMismatch { .. } => "digest-mismatch",
            Error::NotFound(_) => "not-found",
            Error::Protocol(_) => "protocol",
            Error::FrameTooLarge { .. } => "frame-too-large",
            Error::Serialization(_) => "serialization",
            Error::ConnectionFailed(_) => "connection-failed",
            Error::ConnectionClosed(_) => "connection-closed",
            Error::Timeout(_) => "timeout",
            Error::PeerNotFound(_) => "peer-not-found",
            Error::Transport(_) => "transport",
            Error::Choked => "choked",
            Error::Stun(_) => "stun",
            Error::PortMapping(_) => "port-mapping",
            Error::HolePunch(_) => "hole-punch",
            Error::AddressRejected(_) => "address-rejected",
            Error::InvalidSignaling(_) => "invalid-signaling",
            Error::MetadataTimeout(_) => "metadata-timeout",
            Error::ChunkUnavailable { .. } => "chunk-unavailable",
            Error::IntegrityFailure { .. } => "integrity-failure",
            Error::TransferInProgress(_) => "transfer-in-progress",
            Error::Mesh(_) => "mesh",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether retrying (possibly on another transport) can help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::ConnectionClosed(_)
                | Error::Transport(_)
                | Error::Choked
                | Error::MetadataTimeout(_)
                | Error::HolePunch(_)
                | Error::Stun(_)
        )
    }

    /// Whether this failure counts as a strike against the serving peer.
    ///
    /// Nothing recovers silently from an integrity failure; repeated
    /// offenders get blacklisted by the orchestrator.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::IntegrityFailure { .. } | Error::DigestMismatch { .. }
        )
    }

    /// Whether the connection that produced this error should be closed.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::FrameTooLarge { .. } | Error::ConnectionClosed(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout("deadline elapsed".into())
    }
}

// ============================================================================
// TESTS
// ============================================================================
