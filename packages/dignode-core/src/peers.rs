//! # Peer Records
//!
//! What we know about each peer: the capabilities it announced, the
//! digests it claims to hold, and when we last heard from it. A record
//! is live only while its `last_seen` is inside the liveness window;
//! everything else in the node filters through [`PeerTable::live_peers`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::identity::NodeId;
use crate::time::now_timestamp_millis;

/// A plain `{ip, port}` endpoint in announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Result of a router port mapping, as announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedEndpoint {
    pub external_ip: IpAddr,
    pub external_port: u16,
}

impl MappedEndpoint {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.external_ip, self.external_port)
    }
}

/// WebRTC availability plus the STUN servers the peer uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcCapability {
    pub available: bool,
    #[serde(default)]
    pub stun_servers: Vec<String>,
}

/// Relay availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCapability {
    pub available: bool,
}

/// Everything a node advertises about how to reach it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_tcp: Option<Endpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_udp: Option<Endpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upnp: Option<MappedEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub natpmp: Option<MappedEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webrtc: Option<WebRtcCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayCapability>,
}

/// The capability record each node publishes every sync interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub node_id: NodeId,
    /// Unix millis at publish time
    pub timestamp: i64,
    pub capabilities: Capabilities,
    /// Digests the node holds
    pub digests: Vec<String>,
}

/// A peer as the table tracks it.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub capabilities: Capabilities,
    pub digests: Vec<String>,
    /// Unix millis when the last announcement arrived
    pub last_seen: i64,
}

// ============================================================================
// PEER TABLE
// ============================================================================

/// Frequently read, rarely mutated map of known peers.
pub struct PeerTable {
    liveness_window_ms: i64,
    peers: RwLock<HashMap<NodeId, PeerRecord>>,
}

impl PeerTable {
    pub fn new(liveness_window_ms: i64) -> Self {
        Self { liveness_window_ms, peers: RwLock::new(HashMap::new()) }
    }

    /// Insert or refresh a peer from its announcement.
    pub fn upsert(&self, announcement: &Announcement) {
        let record = PeerRecord {
            node_id: announcement.node_id,
            capabilities: announcement.capabilities.clone(),
            digests: announcement.digests.clone(),
            last_seen: now_timestamp_millis(),
        };
        self.peers.write().insert(announcement.node_id, record);
    }

    /// A live peer's record.
    pub fn get(&self, id: &NodeId) -> Option<PeerRecord> {
        self.peers
            .read()
            .get(id)
            .filter(|r| self.is_live(r))
            .cloned()
    }

    /// All peers inside the liveness window.
    pub fn live_peers(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .values()
            .filter(|r| self.is_live(r))
            .cloned()
            .collect()
    }

    /// Live peers that announced `digest`.
    pub fn holders_of(&self, digest: &str) -> Vec<NodeId> {
        self.peers
            .read()
            .values()
            .filter(|r| self.is_live(r) && r.digests.iter().any(|d| d == digest))
            .map(|r| r.node_id)
            .collect()
    }

    /// Whether no live peer holds `digest` (we are the unique source).
    pub fn is_unique_source(&self, digest: &str) -> bool {
        self.holders_of(digest).is_empty()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut peers = self.peers.write();
        let before = peers.len();
        let cutoff = now_timestamp_millis() - self.liveness_window_ms;
        peers.retain(|_, r| r.last_seen >= cutoff);
        before - peers.len()
    }

    /// Forget a peer entirely (blacklisting).
    pub fn remove(&self, id: &NodeId) {
        self.peers.write().remove(id);
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    fn is_live(&self, record: &PeerRecord) -> bool {
        now_timestamp_millis() - record.last_seen < self.liveness_window_ms
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(id: NodeId, digests: Vec<String>) -> Announcement {
        Announcement {
            node_id: id,
            timestamp: now_timestamp_millis(),
            capabilities: Capabilities {
                direct_tcp: Some(Endpoint { ip: "93.184.216.34".parse().unwrap(), port: 4001 }),
                ..Default::default()
            },
            digests,
        }
    }

    #[test]
    fn test_announcement_wire_shape() {
        let ann = Announcement {
            node_id: NodeId::random(),
            timestamp: 1700000000000,
            capabilities: Capabilities {
                direct_tcp: Some(Endpoint { ip: "93.184.216.34".parse().unwrap(), port: 4001 }),
                upnp: Some(MappedEndpoint {
                    external_ip: "93.184.216.34".parse().unwrap(),
                    external_port: 40000,
                }),
                webrtc: Some(WebRtcCapability {
                    available: true,
                    stun_servers: vec!["stun:stun.l.google.com:19302".into()],
                }),
                relay: Some(RelayCapability { available: true }),
                ..Default::default()
            },
            digests: vec!["ab".repeat(32)],
        };
        let json = serde_json::to_string(&ann).unwrap();
        assert!(json.contains("\"nodeId\""));
        assert!(json.contains("\"directTcp\""));
        assert!(json.contains("\"externalIp\""));
        assert!(json.contains("\"stunServers\""));
        assert!(json.contains("\"digests\""));
        // Unset capabilities are omitted, not null.
        assert!(!json.contains("directUdp"));

        let back: Announcement = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ann);
    }

    #[test]
    fn test_upsert_and_get() {
        let table = PeerTable::new(5 * 60 * 1000);
        let id = NodeId::random();
        table.upsert(&announcement(id, vec!["aa".repeat(32)]));

        let record = table.get(&id).unwrap();
        assert_eq!(record.node_id, id);
        assert_eq!(record.digests.len(), 1);
        assert_eq!(table.live_peers().len(), 1);
    }

    #[test]
    fn test_expired_peer_not_live() {
        let table = PeerTable::new(100);
        let id = NodeId::random();
        table.upsert(&announcement(id, vec![]));

        // Age the record past the window by hand.
        table.peers.write().get_mut(&id).unwrap().last_seen -= 1000;
        assert!(table.get(&id).is_none());
        assert!(table.live_peers().is_empty());
        assert_eq!(table.prune(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_holders_and_unique_source() {
        let table = PeerTable::new(5 * 60 * 1000);
        let holder = NodeId::random();
        let digest = "cd".repeat(32);
        table.upsert(&announcement(holder, vec![digest.clone()]));
        table.upsert(&announcement(NodeId::random(), vec![]));

        assert_eq!(table.holders_of(&digest), vec![holder]);
        assert!(!table.is_unique_source(&digest));
        assert!(table.is_unique_source(&"ef".repeat(32)));
    }

    #[test]
    fn test_refresh_replaces_digests() {
        let table = PeerTable::new(5 * 60 * 1000);
        let id = NodeId::random();
        table.upsert(&announcement(id, vec!["aa".repeat(32)]));
        table.upsert(&announcement(id, vec!["bb".repeat(32), "cc".repeat(32)]));

        let record = table.get(&id).unwrap();
        assert_eq!(record.digests.len(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_forgets_peer() {
        let table = PeerTable::new(5 * 60 * 1000);
        let id = NodeId::random();
        table.upsert(&announcement(id, vec![]));
        table.remove(&id);
        assert!(table.get(&id).is_none());
    }
}
