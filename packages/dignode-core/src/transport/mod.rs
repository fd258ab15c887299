//! # Transport Endpoints
//!
//! Four ways to move frames between two nodes, all behind one trait.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        TRANSPORT STACK                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │                    ┌──────────────────────┐                         │
//! │                    │   Channel (trait)    │                         │
//! │                    │  send / recv / close │                         │
//! │                    └──────────┬───────────┘                         │
//! │                               │                                     │
//! │     ┌──────────────┬──────────┴─────┬──────────────────┐           │
//! │     ▼              ▼                ▼                  ▼           │
//! │  ┌───────┐   ┌───────────┐   ┌─────────────┐   ┌─────────────┐    │
//! │  │  TCP  │   │    UDP    │   │   WebRTC    │   │    Relay    │    │
//! │  │       │   │           │   │             │   │             │    │
//! │  │ 4-byte│   │ fragment/ │   │ reliable    │   │ frames over │    │
//! │  │ length│   │ ack/      │   │ ordered     │   │ paired mesh │    │
//! │  │ prefix│   │ reorder   │   │ data channel│   │ channels    │    │
//! │  └───────┘   └───────────┘   └─────────────┘   └─────────────┘    │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Frames on any single channel are delivered in send order; each
//! transport enforces its per-frame maximum and drops oversize frames
//! without touching connection state.

pub mod relay;
pub mod tcp;
pub mod udp;
pub mod webrtc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::error::Result;
use crate::wire::Frame;

/// How a connection was established. Also the unit of preference in the
/// connection selector and the `connectionType` persisted in the success
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportKind {
    /// Plain TCP to an advertised endpoint
    DirectTcp,
    /// Plain UDP to an advertised endpoint
    DirectUdp,
    /// TCP to a UPnP-mapped external port
    UpnpTcp,
    /// TCP to a NAT-PMP-mapped external port
    NatPmpTcp,
    /// TCP simultaneous-open hole punch
    TcpHolePunch,
    /// UDP hole punch
    UdpHolePunch,
    /// WebRTC data channel
    Webrtc,
    /// Frames tunnelled through the gossip substrate; last resort
    Relay,
}

impl TransportKind {
    /// Preference order, earliest wins.
    pub const PREFERENCE: [TransportKind; 8] = [
        TransportKind::DirectTcp,
        TransportKind::DirectUdp,
        TransportKind::UpnpTcp,
        TransportKind::NatPmpTcp,
        TransportKind::TcpHolePunch,
        TransportKind::UdpHolePunch,
        TransportKind::Webrtc,
        TransportKind::Relay,
    ];
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::DirectTcp => "DIRECT_TCP",
            TransportKind::DirectUdp => "DIRECT_UDP",
            TransportKind::UpnpTcp => "UPNP_TCP",
            TransportKind::NatPmpTcp => "NAT_PMP_TCP",
            TransportKind::TcpHolePunch => "TCP_HOLE_PUNCH",
            TransportKind::UdpHolePunch => "UDP_HOLE_PUNCH",
            TransportKind::Webrtc => "WEBRTC",
            TransportKind::Relay => "RELAY",
        };
        f.write_str(s)
    }
}

/// A bidirectional, ordered, framed message channel to one remote node.
///
/// The duck-typed per-transport connection objects of the original
/// design collapse into this one interface; message identification is by
/// tagged [`Frame`] variant, never string dispatch.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Which transport carries this channel.
    fn transport(&self) -> TransportKind;

    /// Local socket address, where the transport has one.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote socket address, where the transport has one.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Send one frame. Fails if the frame exceeds the transport limit or
    /// the channel is closed.
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Receive the next frame, in send order. `None` once the channel is
    /// closed and drained.
    async fn recv(&self) -> Option<Frame>;

    /// Close the channel and release its tasks and sockets. Idempotent.
    async fn close(&self);
}

/// Boxed channel, as handed around by the selector and the node.
pub type BoxedChannel = std::sync::Arc<dyn Channel>;

// ============================================================================
// TESTS
// ============================================================================
