//! # In-Process Mesh
//!
//! A hub-and-handles mesh for tests and single-host setups. Every node
//! in the process takes a handle off one shared hub; publishes fan out
//! to every other handle's subscribers on that channel, mirroring the
//! "own messages are not delivered back" behavior of the gossip swarm.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Mesh, MeshMessage};
use crate::error::Result;

struct Subscription {
    handle_id: u64,
    tx: mpsc::Sender<MeshMessage>,
}

/// The shared hub. Cheap to clone via [`handle`](MemoryMeshHub::handle).
#[derive(Default)]
pub struct MemoryMeshHub {
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_handle: u64,
    subs: HashMap<String, Vec<Subscription>>,
}

impl MemoryMeshHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A mesh handle for one in-process node.
    pub fn handle(self: &Arc<Self>) -> MemoryMesh {
        let id = {
            let mut inner = self.inner.lock();
            inner.next_handle += 1;
            inner.next_handle
        };
        MemoryMesh { hub: self.clone(), handle_id: id }
    }
}

/// One node's view of the in-process hub.
#[derive(Clone)]
pub struct MemoryMesh {
    hub: Arc<MemoryMeshHub>,
    handle_id: u64,
}

#[async_trait]
impl Mesh for MemoryMesh {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let targets: Vec<mpsc::Sender<MeshMessage>> = {
            let mut inner = self.hub.inner.lock();
            if let Some(subs) = inner.subs.get_mut(channel) {
                subs.retain(|s| !s.tx.is_closed());
                subs.iter()
                    .filter(|s| s.handle_id != self.handle_id)
                    .map(|s| s.tx.clone())
                    .collect()
            } else {
                Vec::new()
            }
        };
        for tx in targets {
            let _ = tx
                .send(MeshMessage { channel: channel.to_string(), payload: payload.clone() })
                .await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<MeshMessage>> {
        let (tx, rx) = mpsc::channel(64);
        self.hub
            .inner
            .lock()
            .subs
            .entry(channel.to_string())
            .or_default()
            .push(Subscription { handle_id: self.handle_id, tx });
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut inner = self.hub.inner.lock();
        if let Some(subs) = inner.subs.get_mut(channel) {
            subs.retain(|s| s.handle_id != self.handle_id);
            if subs.is_empty() {
                inner.subs.remove(channel);
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_reaches_other_handles() {
        let hub = MemoryMeshHub::new();
        let a = hub.handle();
        let b = hub.handle();

        let mut rx = b.subscribe("room").await.unwrap();
        a.publish("room", b"hello".to_vec()).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "room");
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn test_own_publishes_not_delivered_back() {
        let hub = MemoryMeshHub::new();
        let a = hub.handle();

        let mut rx = a.subscribe("room").await.unwrap();
        a.publish("room", b"echo?".to_vec()).await.unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let hub = MemoryMeshHub::new();
        let a = hub.handle();
        let b = hub.handle();

        let mut rx = b.subscribe("one").await.unwrap();
        a.publish("two", b"elsewhere".to_vec()).await.unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = MemoryMeshHub::new();
        let a = hub.handle();
        let b = hub.handle();

        let mut rx = b.subscribe("room").await.unwrap();
        b.unsubscribe("room").await.unwrap();
        a.publish("room", b"gone".to_vec()).await.unwrap();

        // Sender side dropped; the receiver ends rather than yielding.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_get_a_copy() {
        let hub = MemoryMeshHub::new();
        let a = hub.handle();
        let b = hub.handle();
        let c = hub.handle();

        let mut rx_b = b.subscribe("room").await.unwrap();
        let mut rx_c = c.subscribe("room").await.unwrap();
        a.publish("room", b"fanout".to_vec()).await.unwrap();

        assert_eq!(rx_b.recv().await.unwrap().payload, b"fanout");
        assert_eq!(rx_c.recv().await.unwrap().payload, b"fanout");
    }
}
