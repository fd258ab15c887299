//! # Gossip Mesh
//!
//! The eventually-consistent gossip substrate is an external collaborator;
//! the node only needs named channels it can publish to and subscribe on.
//! That contract is the [`Mesh`] trait. Announcements, hole-punch and
//! WebRTC signaling, and last-resort relay tunnelling all ride on it.
//!
//! Two implementations:
//! - [`MemoryMesh`] — an in-process hub, used by tests and single-host
//!   setups.
//! - [`GossipMesh`] — a libp2p swarm (gossipsub over TCP/noise/yamux)
//!   connecting to the configured bootstrap peers.

mod gossip;
mod memory;

pub use gossip::{GossipMesh, GossipMeshConfig};
pub use memory::{MemoryMesh, MemoryMeshHub};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct MeshMessage {
    /// Channel the message arrived on
    pub channel: String,
    /// Opaque payload (JSON for every shape this node publishes)
    pub payload: Vec<u8>,
}

/// Publish/subscribe over named channels on the gossip substrate.
///
/// Publishers do not receive their own messages back. Delivery is
/// best-effort and at-least-once; every consumer on top of this trait
/// (announcements, signaling, relay) tolerates duplicates.
#[async_trait]
pub trait Mesh: Send + Sync {
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to `channel`. Each call returns an independent receiver.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<MeshMessage>>;

    /// Drop every subscription this handle holds on `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;
}

/// Shared mesh handle, as threaded through the node's components.
pub type SharedMesh = Arc<dyn Mesh>;

// ============================================================================
// CHANNEL NAMES
// ============================================================================

/// Channel carrying capability announcements for a namespace.
pub fn announce_channel(namespace: &str) -> String {
    format!("{namespace}/announce")
}

/// Well-known per-node channel where peers open signaling exchanges.
pub fn signal_inbox_channel(namespace: &str, node: &crate::identity::NodeId) -> String {
    format!("{namespace}/signal/{node}")
}

/// Well-known per-node channel where peers request relay tunnels.
pub fn relay_inbox_channel(namespace: &str, node: &crate::identity::NodeId) -> String {
    format!("{namespace}/relay/{node}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;

    #[test]
    fn test_channel_names_are_namespaced() {
        let id = NodeId::random();
        assert_eq!(announce_channel("net1"), "net1/announce");
        assert_eq!(
            signal_inbox_channel("net1", &id),
            format!("net1/signal/{}", id.to_hex())
        );
        assert_eq!(
            relay_inbox_channel("net1", &id),
            format!("net1/relay/{}", id.to_hex())
        );
    }
}
