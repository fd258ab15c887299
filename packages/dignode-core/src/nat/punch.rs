//! # Hole Punching
//!
//! Coordinated simultaneous outbound traffic so that return packets
//! traverse both NATs' freshly created state.
//!
//! Both sides publish a punch message on a fresh signaling session
//! channel, validate what the other side advertised, then:
//!
//! - **UDP:** emit 16-byte test packets (4-byte magic + 12 random bytes)
//!   at the remote's external address and, where the policy allows, its
//!   private address, staggered by 500 ms. Success is a correctly-magic'd
//!   packet back within 2 s.
//! - **TCP:** bind a fresh port, then simultaneously listen on it and
//!   `connect()` to the remote's external address from it. The first of
//!   (incoming accept, successful connect) wins; the loser is torn down.
//!   Success window 5 s.
//!
//! A failed attempt retries with a fresh session channel, up to the
//! configured budget.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;

use super::{validate_ip, validate_port, AddressPolicy};
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::mesh::SharedMesh;
use crate::signaling::{self, SignalEnvelope, SignalIntent, MAX_SIGNAL_SKEW_MS};
use crate::time::now_timestamp_millis;
use crate::transport::udp::UdpEndpoint;

/// Magic prefix of a punch test packet.
pub const TEST_PACKET_MAGIC: u32 = 0xF5A9_B3C7;

/// Test packets are exactly magic + 12 random bytes.
pub const TEST_PACKET_LEN: usize = 16;

/// Stagger between probing the external and the private address.
const PROBE_STAGGER: Duration = Duration::from_millis(500);

/// Window for a UDP test packet to come back.
const UDP_SUCCESS_WINDOW: Duration = Duration::from_secs(2);

/// Window for the TCP simultaneous open to produce a socket.
const TCP_SUCCESS_WINDOW: Duration = Duration::from_secs(5);

/// How long to wait for the remote's punch message on the session channel.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Build a fresh test packet.
pub fn make_test_packet() -> [u8; TEST_PACKET_LEN] {
    let mut packet = [0u8; TEST_PACKET_LEN];
    packet[..4].copy_from_slice(&TEST_PACKET_MAGIC.to_be_bytes());
    rand::Rng::fill(&mut rand::thread_rng(), &mut packet[4..]);
    packet
}

/// Whether `bytes` is a correctly-magic'd test packet.
pub fn is_test_packet(bytes: &[u8]) -> bool {
    bytes.len() == TEST_PACKET_LEN
        && bytes[..4] == TEST_PACKET_MAGIC.to_be_bytes()
}

// ============================================================================
// PUNCH MESSAGES
// ============================================================================

/// Which side of the exchange a message comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PunchRole {
    Offer,
    Answer,
}

/// Address family advertised in a punch message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamily {
    V4,
    V6,
}

/// The coordination message both sides publish on the session channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchMessage {
    pub from: NodeId,
    pub role: PunchRole,
    /// `udp` or `tcp`
    pub protocol: String,
    pub external_addr: IpAddr,
    pub external_port: u16,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub family: AddrFamily,
    pub timestamp: i64,
    pub nonce: String,
}

impl PunchMessage {
    /// Validate a remote punch message: well-formed addresses per the
    /// policy, ports in range, recent timestamp, and the expected sender
    /// when identity validation is on.
    pub fn validate(
        &self,
        policy: &AddressPolicy,
        expected_from: Option<&NodeId>,
    ) -> Result<()> {
        if let Some(expected) = expected_from {
            if self.from != *expected {
                return Err(Error::InvalidSignaling(format!(
                    "punch message from {} but expected {}",
                    self.from, expected
                )));
            }
        }
        validate_ip(&self.external_addr, policy)?;
        validate_port(self.external_port)?;
        // The private address is only probed when the policy admits it,
        // but it must still be well-formed.
        validate_port(self.local_port)?;
        let age = now_timestamp_millis() - self.timestamp;
        if age.abs() > MAX_SIGNAL_SKEW_MS {
            return Err(Error::InvalidSignaling(format!(
                "punch timestamp {} ms out of window",
                age
            )));
        }
        Ok(())
    }

    /// The probe targets in order: external first, private second when
    /// the policy allows it.
    pub fn probe_targets(&self, policy: &AddressPolicy) -> Vec<SocketAddr> {
        let mut targets = vec![SocketAddr::new(self.external_addr, self.external_port)];
        if validate_ip(&self.local_addr, &AddressPolicy::permissive()).is_ok()
            && (policy.allow_private || policy.allow_loopback)
        {
            let private = SocketAddr::new(self.local_addr, self.local_port);
            if private != targets[0] {
                targets.push(private);
            }
        }
        targets
    }
}

/// Local addressing facts fed into a punch attempt.
#[derive(Debug, Clone, Copy)]
pub struct PunchAddrs {
    /// STUN-discovered public address (falls back to local when absent)
    pub external: SocketAddr,
    /// Bound local address
    pub local: SocketAddr,
}

fn punch_message(
    from: NodeId,
    role: PunchRole,
    protocol: &str,
    addrs: PunchAddrs,
    nonce: &str,
) -> PunchMessage {
    PunchMessage {
        from,
        role,
        protocol: protocol.to_string(),
        external_addr: addrs.external.ip(),
        external_port: addrs.external.port(),
        local_addr: addrs.local.ip(),
        local_port: addrs.local.port(),
        family: if addrs.external.is_ipv4() { AddrFamily::V4 } else { AddrFamily::V6 },
        timestamp: now_timestamp_millis(),
        nonce: nonce.to_string(),
    }
}

/// Publish our message on the session channel and wait for the remote's.
///
/// Our message is republished once a second until the remote's arrives:
/// whichever side reaches the session channel first would otherwise
/// publish into nobody's subscription.
async fn exchange_messages(
    mesh: &SharedMesh,
    session: &str,
    ours: PunchMessage,
    policy: &AddressPolicy,
    expected_from: Option<&NodeId>,
) -> Result<PunchMessage> {
    let mut rx = mesh.subscribe(session).await?;
    let encoded = serde_json::to_vec(&ours)?;
    mesh.publish(session, encoded.clone()).await?;

    let deadline = tokio::time::Instant::now() + EXCHANGE_TIMEOUT;
    let mut resend = tokio::time::interval(Duration::from_secs(1));
    resend.tick().await; // immediate first tick
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let msg = msg.ok_or_else(|| Error::HolePunch("session channel closed".into()))?;
                let remote: PunchMessage = match serde_json::from_slice(&msg.payload) {
                    Ok(remote) => remote,
                    Err(_) => continue,
                };
                // Skip our own message if the mesh echoes it.
                if remote.role == ours.role {
                    continue;
                }
                remote.validate(policy, expected_from)?;
                let _ = mesh.unsubscribe(session).await;
                return Ok(remote);
            }
            _ = resend.tick() => {
                mesh.publish(session, encoded.clone()).await?;
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = mesh.unsubscribe(session).await;
                return Err(Error::HolePunch("no punch message from peer".into()));
            }
        }
    }
}

// ============================================================================
// UDP PUNCH
// ============================================================================

/// UDP hole puncher over the node's shared UDP endpoint.
pub struct UdpPuncher {
    pub endpoint: Arc<UdpEndpoint>,
    pub mesh: SharedMesh,
    pub namespace: String,
    pub local_id: NodeId,
    pub policy: AddressPolicy,
    pub max_retries: u32,
}

impl UdpPuncher {
    fn local_addrs(&self, external: Option<SocketAddr>) -> PunchAddrs {
        let local = self.endpoint.local_addr();
        PunchAddrs { external: external.unwrap_or(local), local }
    }

    /// Dial side: open a session, coordinate, probe. Returns the remote
    /// address that produced a verified test packet.
    pub async fn dial(
        &self,
        peer: NodeId,
        external: Option<SocketAddr>,
    ) -> Result<SocketAddr> {
        let mut last_err = Error::HolePunch("no attempts made".into());
        for attempt in 0..self.max_retries.max(1) {
            let session = signaling::open_session(
                &self.mesh,
                &self.namespace,
                self.local_id,
                peer,
                SignalIntent::UdpPunch,
            )
            .await?;
            match self.run(&session, PunchRole::Offer, Some(&peer), external).await {
                Ok(addr) => return Ok(addr),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "udp punch attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Answer side: the dispatcher handed us an envelope; coordinate on
    /// its session channel.
    pub async fn answer(
        &self,
        envelope: &SignalEnvelope,
        external: Option<SocketAddr>,
    ) -> Result<SocketAddr> {
        self.run(&envelope.channel, PunchRole::Answer, Some(&envelope.from), external)
            .await
    }

    async fn run(
        &self,
        session: &str,
        role: PunchRole,
        expected_from: Option<&NodeId>,
        external: Option<SocketAddr>,
    ) -> Result<SocketAddr> {
        let nonce = format!("{:08x}", rand::random::<u32>());
        let ours = punch_message(
            self.local_id,
            role,
            "udp",
            self.local_addrs(external),
            &nonce,
        );
        let remote =
            exchange_messages(&self.mesh, session, ours, &self.policy, expected_from).await?;

        // Route incoming test packets to us for the duration of the probe.
        let (packet_tx, mut packet_rx) = mpsc::channel(8);
        self.endpoint.set_punch_sink(Some(packet_tx));
        let result = self.probe(&remote, &mut packet_rx).await;
        self.endpoint.set_punch_sink(None);
        result
    }

    async fn probe(
        &self,
        remote: &PunchMessage,
        packet_rx: &mut mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    ) -> Result<SocketAddr> {
        let targets = remote.probe_targets(&self.policy);
        let packet = make_test_packet();

        let deadline = tokio::time::Instant::now() + UDP_SUCCESS_WINDOW + PROBE_STAGGER;
        let mut next_target = 0usize;
        let mut next_send = tokio::time::Instant::now();
        loop {
            tokio::select! {
                received = packet_rx.recv() => {
                    match received {
                        Some((from, bytes)) if is_test_packet(&bytes) => {
                            // Answer with one more packet so the other
                            // side succeeds even if its first probe was
                            // eaten by our NAT.
                            let _ = self.endpoint.send_raw(&make_test_packet(), from).await;
                            return Ok(from);
                        }
                        Some(_) => continue,
                        None => return Err(Error::HolePunch("endpoint closed".into())),
                    }
                }
                _ = tokio::time::sleep_until(next_send), if next_target < targets.len() => {
                    let target = targets[next_target];
                    next_target += 1;
                    next_send = tokio::time::Instant::now() + PROBE_STAGGER;
                    if let Err(e) = self.endpoint.send_raw(&packet, target).await {
                        tracing::debug!(%target, error = %e, "test packet send failed");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::HolePunch("no test packet within window".into()));
                }
            }
        }
    }
}

// ============================================================================
// TCP PUNCH
// ============================================================================

/// TCP simultaneous-open puncher.
pub struct TcpPuncher {
    pub mesh: SharedMesh,
    pub namespace: String,
    pub local_id: NodeId,
    pub policy: AddressPolicy,
    pub max_retries: u32,
    /// STUN-discovered public IP; external port assumes a
    /// port-preserving NAT.
    pub public_ip: Option<IpAddr>,
}

impl TcpPuncher {
    /// Dial side.
    pub async fn dial(&self, peer: NodeId) -> Result<TcpStream> {
        let mut last_err = Error::HolePunch("no attempts made".into());
        for attempt in 0..self.max_retries.max(1) {
            let session = signaling::open_session(
                &self.mesh,
                &self.namespace,
                self.local_id,
                peer,
                SignalIntent::TcpPunch,
            )
            .await?;
            match self.run(&session, PunchRole::Offer, Some(&peer)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "tcp punch attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Answer side.
    pub async fn answer(&self, envelope: &SignalEnvelope) -> Result<TcpStream> {
        self.run(&envelope.channel, PunchRole::Answer, Some(&envelope.from))
            .await
    }

    async fn run(
        &self,
        session: &str,
        role: PunchRole,
        expected_from: Option<&NodeId>,
    ) -> Result<TcpStream> {
        // A fresh port for this attempt; both the listener and the
        // outbound connect share it so the NAT sees one flow.
        let listen_sock = new_reusable_socket()?;
        listen_sock.bind("0.0.0.0:0".parse().expect("valid bind addr"))?;
        let local = listen_sock.local_addr()?;
        let listener = listen_sock.listen(8)?;

        let external = SocketAddr::new(
            self.public_ip.unwrap_or_else(|| local.ip()),
            local.port(),
        );
        let nonce = format!("{:08x}", rand::random::<u32>());
        let ours = punch_message(
            self.local_id,
            role,
            "tcp",
            PunchAddrs { external, local },
            &nonce,
        );
        let remote =
            exchange_messages(&self.mesh, session, ours, &self.policy, expected_from).await?;

        let targets = remote.probe_targets(&self.policy);
        let connect_target = targets[0];
        let fallback_target = targets.get(1).copied();

        // First of (incoming accept, successful connect) wins.
        let result = tokio::time::timeout(TCP_SUCCESS_WINDOW, async {
            tokio::select! {
                accepted = listener.accept() => {
                    accepted.map(|(stream, _)| stream).map_err(Error::from)
                }
                connected = connect_from(local, connect_target, fallback_target) => connected,
            }
        })
        .await
        .map_err(|_| Error::HolePunch("tcp punch window elapsed".into()))??;

        Ok(result)
    }
}

fn new_reusable_socket() -> Result<TcpSocket> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    Ok(socket)
}

/// Keep attempting outbound connects from our punched port; the remote's
/// SYNs are doing the same towards us.
async fn connect_from(
    local: SocketAddr,
    target: SocketAddr,
    fallback: Option<SocketAddr>,
) -> Result<TcpStream> {
    let mut to = target;
    loop {
        let socket = new_reusable_socket()?;
        socket.bind(SocketAddr::new("0.0.0.0".parse().expect("valid ip"), local.port()))?;
        match socket.connect(to).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::trace!(%to, error = %e, "tcp punch connect attempt");
                if let Some(fb) = fallback {
                    to = fb;
                }
                tokio::time::sleep(PROBE_STAGGER).await;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
