//! # Connection Selector
//!
//! Given a peer's advertised capabilities, find a transport that will
//! actually carry bytes. Preference order: direct TCP, direct UDP,
//! UPnP-mapped TCP, NAT-PMP-mapped TCP, TCP hole punch, UDP hole punch,
//! WebRTC, relay. A fresh success-registry entry short-circuits the walk
//! by retrying whatever worked last time.
//!
//! Every attempt runs the same shape: establish a raw channel, exchange
//! handshakes, verify the remote id. An attempt ends in `Connected` or
//! `Failed` — never a half-open socket — and `Closed` is reachable from
//! anywhere via cancel.

pub mod registry;

pub use registry::{default_registry_dir, SuccessRecord, SuccessRegistry};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::mesh::SharedMesh;
use crate::nat::punch::{TcpPuncher, UdpPuncher};
use crate::nat::AddressPolicy;
use crate::peers::PeerRecord;
use crate::transport::relay;
use crate::transport::tcp::TcpChannel;
use crate::transport::udp::UdpEndpoint;
use crate::transport::webrtc::WebRtcConnector;
use crate::transport::{BoxedChannel, Channel, TransportKind};
use crate::wire::{Frame, PROTOCOL_VERSION};

// ============================================================================
// ATTEMPT STATE MACHINE
// ============================================================================

/// States a single connection attempt moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Initializing,
    Discovering,
    Signaling,
    Connecting,
    Retrying,
    Connected,
    Failed,
    Closed,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Connected | AttemptState::Failed | AttemptState::Closed)
    }
}

/// One attempt's progression, with transition legality enforced.
#[derive(Debug)]
pub struct Attempt {
    pub kind: TransportKind,
    state: AttemptState,
}

impl Attempt {
    pub fn new(kind: TransportKind) -> Self {
        Self { kind, state: AttemptState::Idle }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Advance to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: AttemptState) -> Result<()> {
        use AttemptState::*;
        let legal = match (self.state, next) {
            // Cancellation reaches Closed from any non-terminal state.
            (from, Closed) if !from.is_terminal() => true,
            // Failure likewise ends any in-flight attempt.
            (from, Failed) if !from.is_terminal() => true,
            (Idle, Initializing) => true,
            (Initializing, Discovering | Signaling | Connecting) => true,
            (Discovering, Signaling | Connecting) => true,
            (Signaling, Connecting) => true,
            (Connecting, Retrying | Connected) => true,
            (Retrying, Signaling | Connecting) => true,
            _ => false,
        };
        if !legal {
            return Err(Error::Internal(format!(
                "illegal attempt transition {:?} -> {next:?}",
                self.state
            )));
        }
        self.state = next;
        Ok(())
    }
}

// ============================================================================
// SELECTOR
// ============================================================================

/// Per-transport enable flags from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct EnabledTransports {
    pub tcp: bool,
    pub udp: bool,
    pub webrtc: bool,
    pub relay: bool,
}

impl EnabledTransports {
    fn allows(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::DirectTcp
            | TransportKind::UpnpTcp
            | TransportKind::NatPmpTcp
            | TransportKind::TcpHolePunch => self.tcp,
            TransportKind::DirectUdp | TransportKind::UdpHolePunch => self.udp,
            TransportKind::Webrtc => self.webrtc,
            TransportKind::Relay => self.relay,
        }
    }
}

/// A live, handshaked connection.
pub struct Established {
    pub channel: BoxedChannel,
    pub kind: TransportKind,
    pub remote_id: NodeId,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("kind", &self.kind)
            .field("remote_id", &self.remote_id)
            .finish()
    }
}

/// Walks transports for one `(local, remote)` pair at a time.
pub struct ConnectionSelector {
    pub local_id: NodeId,
    pub mesh: SharedMesh,
    pub namespace: String,
    pub registry: Arc<SuccessRegistry>,
    pub udp_endpoint: Option<Arc<UdpEndpoint>>,
    pub policy: AddressPolicy,
    /// STUN-discovered public address of the UDP transport socket
    pub public_udp_addr: Option<SocketAddr>,
    /// STUN-discovered public IP (for TCP punching)
    pub public_ip: Option<IpAddr>,
    pub stun_servers: Vec<String>,
    pub enabled: EnabledTransports,
    pub attempt_timeout: Duration,
    pub punch_retries: u32,
}

impl ConnectionSelector {
    /// Try transports for `peer` in preference order (registry entry
    /// first) and return the first that completes a handshake.
    pub async fn connect(&self, peer: &PeerRecord) -> Result<Established> {
        let mut candidates = self.candidates(peer);

        // A recent success gets retried before the full walk.
        if let Some(record) = self.registry.get(&peer.node_id) {
            if self.enabled.allows(record.connection_type) {
                tracing::debug!(
                    peer = %peer.node_id,
                    kind = %record.connection_type,
                    "trying remembered transport first"
                );
                match self.attempt(record.connection_type, peer, Some(&record)).await {
                    Ok(established) => return Ok(established),
                    Err(e) => {
                        tracing::debug!(error = %e, "remembered transport failed");
                    }
                }
            }
        }

        let mut last_err = Error::ConnectionFailed(format!(
            "no usable transport for {}",
            peer.node_id
        ));
        for kind in candidates.drain(..) {
            match self.attempt(kind, peer, None).await {
                Ok(established) => return Ok(established),
                Err(e) => {
                    tracing::debug!(peer = %peer.node_id, %kind, error = %e, "transport attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Preference order filtered by config toggles and the peer's
    /// advertised capabilities.
    fn candidates(&self, peer: &PeerRecord) -> Vec<TransportKind> {
        let caps = &peer.capabilities;
        TransportKind::PREFERENCE
            .into_iter()
            .filter(|kind| self.enabled.allows(*kind))
            .filter(|kind| match kind {
                TransportKind::DirectTcp => caps.direct_tcp.is_some(),
                TransportKind::DirectUdp => {
                    caps.direct_udp.is_some() && self.udp_endpoint.is_some()
                }
                TransportKind::UpnpTcp => caps.upnp.is_some(),
                TransportKind::NatPmpTcp => caps.natpmp.is_some(),
                TransportKind::TcpHolePunch => true,
                TransportKind::UdpHolePunch => self.udp_endpoint.is_some(),
                TransportKind::Webrtc => {
                    caps.webrtc.as_ref().map_or(false, |w| w.available)
                }
                TransportKind::Relay => {
                    caps.relay.as_ref().map_or(false, |r| r.available)
                }
            })
            .collect()
    }

    /// One attempt: raw channel, then handshake, inside the per-attempt
    /// timeout. Failure closes whatever was opened.
    async fn attempt(
        &self,
        kind: TransportKind,
        peer: &PeerRecord,
        remembered: Option<&SuccessRecord>,
    ) -> Result<Established> {
        let mut attempt = Attempt::new(kind);
        attempt.advance(AttemptState::Initializing)?;

        let result = tokio::time::timeout(
            self.attempt_timeout,
            self.establish(kind, peer, remembered, &mut attempt),
        )
        .await
        .map_err(|_| Error::Timeout(format!("{kind} attempt")))
        .and_then(|r| r);

        match result {
            Ok(established) => {
                attempt.advance(AttemptState::Connected)?;
                self.registry.record_success(
                    peer.node_id,
                    kind,
                    established.channel.remote_addr(),
                );
                Ok(established)
            }
            Err(e) => {
                let _ = attempt.advance(AttemptState::Failed);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        kind: TransportKind,
        peer: &PeerRecord,
        remembered: Option<&SuccessRecord>,
        attempt: &mut Attempt,
    ) -> Result<Established> {
        let caps = &peer.capabilities;
        let channel: BoxedChannel = match kind {
            TransportKind::DirectTcp
            | TransportKind::UpnpTcp
            | TransportKind::NatPmpTcp => {
                let addr = remembered
                    .and_then(record_addr)
                    .or_else(|| match kind {
                        TransportKind::DirectTcp => caps.direct_tcp.map(|e| e.addr()),
                        TransportKind::UpnpTcp => caps.upnp.map(|m| m.addr()),
                        TransportKind::NatPmpTcp => caps.natpmp.map(|m| m.addr()),
                        _ => unreachable!(),
                    })
                    .ok_or_else(|| Error::ConnectionFailed(format!("no address for {kind}")))?;
                crate::nat::validate_ip(&addr.ip(), &self.policy)?;
                attempt.advance(AttemptState::Connecting)?;
                Arc::new(TcpChannel::connect(addr, kind).await?)
            }
            TransportKind::DirectUdp => {
                let endpoint = self.udp_endpoint()?;
                let addr = remembered
                    .and_then(record_addr)
                    .or_else(|| caps.direct_udp.map(|e| e.addr()))
                    .ok_or_else(|| Error::ConnectionFailed("no udp address".into()))?;
                crate::nat::validate_ip(&addr.ip(), &self.policy)?;
                attempt.advance(AttemptState::Connecting)?;
                Arc::new(endpoint.connect(addr, TransportKind::DirectUdp))
            }
            TransportKind::TcpHolePunch => {
                attempt.advance(AttemptState::Signaling)?;
                let puncher = TcpPuncher {
                    mesh: self.mesh.clone(),
                    namespace: self.namespace.clone(),
                    local_id: self.local_id,
                    policy: self.policy,
                    max_retries: self.punch_retries,
                    public_ip: self.public_ip,
                };
                let stream = puncher.dial(peer.node_id).await?;
                attempt.advance(AttemptState::Connecting)?;
                Arc::new(TcpChannel::from_stream(stream, TransportKind::TcpHolePunch)?)
            }
            TransportKind::UdpHolePunch => {
                let endpoint = self.udp_endpoint()?;
                attempt.advance(AttemptState::Signaling)?;
                let puncher = UdpPuncher {
                    endpoint: endpoint.clone(),
                    mesh: self.mesh.clone(),
                    namespace: self.namespace.clone(),
                    local_id: self.local_id,
                    policy: self.policy,
                    max_retries: self.punch_retries,
                };
                let remote = puncher.dial(peer.node_id, self.public_udp_addr).await?;
                attempt.advance(AttemptState::Connecting)?;
                Arc::new(endpoint.connect(remote, TransportKind::UdpHolePunch))
            }
            TransportKind::Webrtc => {
                attempt.advance(AttemptState::Signaling)?;
                let connector = WebRtcConnector {
                    mesh: self.mesh.clone(),
                    namespace: self.namespace.clone(),
                    local_id: self.local_id,
                    stun_servers: self.stun_servers.clone(),
                };
                let channel = connector.dial(peer.node_id).await?;
                attempt.advance(AttemptState::Connecting)?;
                Arc::new(channel)
            }
            TransportKind::Relay => {
                attempt.advance(AttemptState::Signaling)?;
                let channel = relay::open(
                    self.mesh.clone(),
                    &self.namespace,
                    self.local_id,
                    peer.node_id,
                )
                .await?;
                attempt.advance(AttemptState::Connecting)?;
                Arc::new(channel)
            }
        };

        match handshake(channel.as_ref(), self.local_id, Some(peer.node_id)).await {
            Ok(remote_id) => Ok(Established { channel, kind, remote_id }),
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    fn udp_endpoint(&self) -> Result<&Arc<UdpEndpoint>> {
        self.udp_endpoint
            .as_ref()
            .ok_or_else(|| Error::ConnectionFailed("udp transport disabled".into()))
    }
}

fn record_addr(record: &SuccessRecord) -> Option<SocketAddr> {
    if record.address.is_empty() || record.port == 0 {
        return None;
    }
    record
        .address
        .parse()
        .ok()
        .map(|ip: IpAddr| SocketAddr::new(ip, record.port))
}

// ============================================================================
// HANDSHAKE
// ============================================================================

/// Exchange handshakes on a fresh channel; verify the remote's identity
/// when one is expected.
pub async fn handshake(
    channel: &dyn Channel,
    local: NodeId,
    expected: Option<NodeId>,
) -> Result<NodeId> {
    channel
        .send(Frame::Handshake { node_id: local, version: PROTOCOL_VERSION })
        .await?;
    loop {
        let frame = channel
            .recv()
            .await
            .ok_or_else(|| Error::ConnectionClosed("before handshake".into()))?;
        match frame {
            Frame::Handshake { node_id, version } => {
                if version != PROTOCOL_VERSION {
                    return Err(Error::Protocol(format!(
                        "peer speaks protocol {version}, we speak {PROTOCOL_VERSION}"
                    )));
                }
                if let Some(expected) = expected {
                    if node_id != expected {
                        return Err(Error::Protocol(format!(
                            "handshake from {node_id}, expected {expected}"
                        )));
                    }
                }
                return Ok(node_id);
            }
            // Keepalives may race the handshake; anything else is noise
            // we refuse to build on.
            Frame::Ping { .. } => continue,
            other => {
                return Err(Error::Protocol(format!(
                    "{} before handshake",
                    other.kind()
                )));
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{MemoryMeshHub, SharedMesh};
    use crate::peers::{Capabilities, Endpoint, PeerRecord, RelayCapability};
    use crate::time::now_timestamp_millis;
    use crate::transport::relay::RelayListener;
    use crate::transport::tcp::TcpAcceptor;

    fn peer_record(id: NodeId, caps: Capabilities) -> PeerRecord {
        PeerRecord {
            node_id: id,
            capabilities: caps,
            digests: vec![],
            last_seen: now_timestamp_millis(),
        }
    }

    async fn selector(mesh: SharedMesh, dir: &std::path::Path, local: NodeId) -> ConnectionSelector {
        ConnectionSelector {
            local_id: local,
            mesh,
            namespace: "ns".into(),
            registry: SuccessRegistry::load(dir.to_path_buf(), 45).await.unwrap(),
            udp_endpoint: None,
            policy: AddressPolicy::permissive(),
            public_udp_addr: None,
            public_ip: None,
            stun_servers: vec![],
            enabled: EnabledTransports { tcp: true, udp: true, webrtc: true, relay: true },
            attempt_timeout: Duration::from_secs(5),
            punch_retries: 1,
        }
    }

    /// Accept inbound TCP channels and answer handshakes as `id`.
    fn respond_handshakes_tcp(mut acceptor: TcpAcceptor, id: NodeId) {
        tokio::spawn(async move {
            while let Some(channel) = acceptor.accept().await {
                tokio::spawn(async move {
                    let _ = handshake(&channel, id, None).await;
                    // Keep the channel alive briefly so the dialer's
                    // side survives the test body.
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    channel.close().await;
                });
            }
        });
    }

    #[test]
    fn test_attempt_transitions() {
        let mut attempt = Attempt::new(TransportKind::DirectTcp);
        assert_eq!(attempt.state(), AttemptState::Idle);
        attempt.advance(AttemptState::Initializing).unwrap();
        attempt.advance(AttemptState::Connecting).unwrap();
        attempt.advance(AttemptState::Connected).unwrap();
        // Terminal states are exclusive: no leaving Connected.
        assert!(attempt.advance(AttemptState::Failed).is_err());
        assert!(attempt.advance(AttemptState::Closed).is_err());
    }

    #[test]
    fn test_attempt_cancel_from_anywhere() {
        for intermediate in [
            AttemptState::Initializing,
            AttemptState::Discovering,
            AttemptState::Signaling,
            AttemptState::Connecting,
        ] {
            let mut attempt = Attempt::new(TransportKind::Relay);
            attempt.advance(AttemptState::Initializing).unwrap();
            if intermediate != AttemptState::Initializing {
                attempt.advance(intermediate).unwrap_or_else(|_| {
                    // Reach deeper states legally where needed.
                });
            }
            attempt.advance(AttemptState::Closed).unwrap();
            assert!(attempt.state().is_terminal());
        }
    }

    #[test]
    fn test_attempt_rejects_skipping_to_connected() {
        let mut attempt = Attempt::new(TransportKind::DirectTcp);
        assert!(attempt.advance(AttemptState::Connected).is_err());
    }

    #[tokio::test]
    async fn test_candidates_follow_preference_and_capabilities() {
        let hub = MemoryMeshHub::new();
        let dir = tempfile::tempdir().unwrap();
        let local = NodeId::random();
        let sel = selector(Arc::new(hub.handle()), dir.path(), local).await;

        let caps = Capabilities {
            direct_tcp: Some(Endpoint { ip: "93.184.216.34".parse().unwrap(), port: 4001 }),
            relay: Some(RelayCapability { available: true }),
            ..Default::default()
        };
        let kinds = sel.candidates(&peer_record(NodeId::random(), caps));
        // No UDP endpoint wired in, so UDP kinds drop out; webrtc not
        // advertised; punching and relay remain.
        assert_eq!(
            kinds,
            vec![
                TransportKind::DirectTcp,
                TransportKind::TcpHolePunch,
                TransportKind::Relay
            ]
        );
        sel.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_direct_tcp_and_record_success() {
        let hub = MemoryMeshHub::new();
        let dir = tempfile::tempdir().unwrap();
        let local = NodeId::random();
        let remote = NodeId::random();

        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = acceptor.local_addr();
        respond_handshakes_tcp(acceptor, remote);

        let sel = selector(Arc::new(hub.handle()), dir.path(), local).await;
        let peer = peer_record(
            remote,
            Capabilities {
                direct_tcp: Some(Endpoint { ip: addr.ip(), port: addr.port() }),
                ..Default::default()
            },
        );

        let established = sel.connect(&peer).await.unwrap();
        assert_eq!(established.kind, TransportKind::DirectTcp);
        assert_eq!(established.remote_id, remote);

        let record = sel.registry.get(&remote).unwrap();
        assert_eq!(record.connection_type, TransportKind::DirectTcp);
        assert_eq!(record.port, addr.port());

        established.channel.close().await;
        sel.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_peer() {
        let hub = MemoryMeshHub::new();
        let dir = tempfile::tempdir().unwrap();
        let local = NodeId::random();
        let expected = NodeId::random();
        let actual = NodeId::random();

        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = acceptor.local_addr();
        respond_handshakes_tcp(acceptor, actual);

        let sel = selector(Arc::new(hub.handle()), dir.path(), local).await;
        let peer = peer_record(
            expected,
            Capabilities {
                direct_tcp: Some(Endpoint { ip: addr.ip(), port: addr.port() }),
                ..Default::default()
            },
        );
        let err = sel.connect(&peer).await.unwrap_err();
        assert!(!err.is_integrity());
        assert!(sel.registry.get(&expected).is_none(), "failure must not be recorded");
        sel.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_fallback_to_relay_when_tcp_dead() {
        let hub = MemoryMeshHub::new();
        let dir = tempfile::tempdir().unwrap();
        let local = NodeId::random();
        let remote = NodeId::random();

        // Remote answers relay opens and handshakes there.
        let remote_mesh: SharedMesh = Arc::new(hub.handle());
        let mut listener = RelayListener::spawn(remote_mesh, "ns", remote).await.unwrap();
        tokio::spawn(async move {
            while let Some(channel) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = handshake(&channel, remote, None).await;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    channel.close().await;
                });
            }
        });

        let mut sel = selector(Arc::new(hub.handle()), dir.path(), local).await;
        // Keep the walk fast: skip hole punching.
        sel.enabled = EnabledTransports { tcp: true, udp: false, webrtc: false, relay: true };
        sel.attempt_timeout = Duration::from_secs(20);

        // A dead TCP endpoint (nothing listens on port 1) plus relay.
        let peer = peer_record(
            remote,
            Capabilities {
                direct_tcp: Some(Endpoint { ip: "127.0.0.1".parse().unwrap(), port: 1 }),
                relay: Some(RelayCapability { available: true }),
                ..Default::default()
            },
        );

        let established = sel.connect(&peer).await.unwrap();
        assert_eq!(established.kind, TransportKind::Relay);
        assert_eq!(
            sel.registry.get(&remote).unwrap().connection_type,
            TransportKind::Relay
        );
        established.channel.close().await;
        sel.registry.shutdown().await;
    }
}
