//! # Out-of-Band Signaling
//!
//! Hole punching and WebRTC need a rendezvous before any direct packet
//! can flow. Each node subscribes to a well-known inbox channel on the
//! mesh; a dialer posts an envelope there that names a freshly derived
//! session channel (`{namespace}/signal/{peer-id}/{timestamp}/{nonce}`),
//! and the actual exchange (punch coordination, SDP offer/answer)
//! continues on that channel.
//!
//! Envelopes are validated before use: the `to` field must be us, the
//! timestamp must be recent, the session channel must match the derived
//! pattern, and — when an expected peer is known — `from` must match it.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::mesh::{signal_inbox_channel, SharedMesh};
use crate::time::now_timestamp_millis;

/// Maximum accepted age (and future skew) of a signaling timestamp.
pub const MAX_SIGNAL_SKEW_MS: i64 = 30_000;

/// What the dialer wants to do on the session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalIntent {
    /// Coordinate a UDP hole punch
    UdpPunch,
    /// Coordinate a TCP simultaneous-open punch
    TcpPunch,
    /// Exchange WebRTC SDP offer/answer
    Webrtc,
}

/// The rendezvous message posted to a peer's inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub from: NodeId,
    pub to: NodeId,
    pub intent: SignalIntent,
    /// Freshly derived session channel for the rest of the exchange
    pub channel: String,
    /// Unix millis at send time
    pub timestamp: i64,
    /// Random tag tying the exchange together
    pub nonce: String,
}

/// Derive a fresh session channel for an exchange with `peer`.
pub fn fresh_session_channel(namespace: &str, peer: &NodeId) -> (String, String) {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let ts = now_timestamp_millis();
    (format!("{namespace}/signal/{peer}/{ts}/{nonce}"), nonce)
}

/// Validate an inbound envelope against local identity and freshness.
pub fn validate_envelope(
    envelope: &SignalEnvelope,
    local: &NodeId,
    expected_from: Option<&NodeId>,
) -> Result<()> {
    if envelope.to != *local {
        return Err(Error::InvalidSignaling(format!(
            "addressed to {}, not us",
            envelope.to
        )));
    }
    if let Some(expected) = expected_from {
        if envelope.from != *expected {
            return Err(Error::InvalidSignaling(format!(
                "from {} but expected {}",
                envelope.from, expected
            )));
        }
    }
    let age = now_timestamp_millis() - envelope.timestamp;
    if age.abs() > MAX_SIGNAL_SKEW_MS {
        return Err(Error::InvalidSignaling(format!("stale timestamp ({age} ms old)")));
    }
    // The session channel must be one this exchange derived: it embeds
    // the recipient id and the envelope's own nonce.
    let expected_prefix = format!("signal/{}/", envelope.to);
    if !envelope.channel.contains(&expected_prefix)
        || !envelope.channel.ends_with(&envelope.nonce)
    {
        return Err(Error::InvalidSignaling(format!(
            "session channel {:?} does not match envelope",
            envelope.channel
        )));
    }
    Ok(())
}

/// Post an envelope to `peer`'s inbox and return the session channel.
pub async fn open_session(
    mesh: &SharedMesh,
    namespace: &str,
    from: NodeId,
    peer: NodeId,
    intent: SignalIntent,
) -> Result<String> {
    let (channel, nonce) = fresh_session_channel(namespace, &peer);
    let envelope = SignalEnvelope {
        from,
        to: peer,
        intent,
        channel: channel.clone(),
        timestamp: now_timestamp_millis(),
        nonce,
    };
    let payload = serde_json::to_vec(&envelope)?;
    mesh.publish(&signal_inbox_channel(namespace, &peer), payload)
        .await?;
    Ok(channel)
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Routes inbox envelopes to the connector interested in each intent.
pub struct SignalDispatcher {
    task: JoinHandle<()>,
}

impl SignalDispatcher {
    /// Subscribe to the local inbox and start routing. `routes` pairs an
    /// intent with the sender that should receive its envelopes.
    pub async fn spawn(
        mesh: SharedMesh,
        namespace: &str,
        local: NodeId,
        routes: Vec<(SignalIntent, mpsc::Sender<SignalEnvelope>)>,
    ) -> Result<Self> {
        let mut rx = mesh
            .subscribe(&signal_inbox_channel(namespace, &local))
            .await?;
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let envelope: SignalEnvelope = match serde_json::from_slice(&msg.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring malformed signal envelope");
                        continue;
                    }
                };
                if let Err(e) = validate_envelope(&envelope, &local, None) {
                    tracing::debug!(error = %e, "rejecting signal envelope");
                    continue;
                }
                if let Some((_, tx)) = routes.iter().find(|(i, _)| *i == envelope.intent) {
                    let _ = tx.send(envelope).await;
                }
            }
        });
        Ok(Self { task })
    }

    /// Stop routing.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SignalDispatcher {
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
    use crate::mesh::{MemoryMeshHub, Mesh};
    use std::sync::Arc;
    use std::time::Duration;

    fn envelope_for(local: NodeId, from: NodeId) -> SignalEnvelope {
        let (channel, nonce) = fresh_session_channel("ns", &local);
        SignalEnvelope {
            from,
            to: local,
            intent: SignalIntent::UdpPunch,
            channel,
            timestamp: now_timestamp_millis(),
            nonce,
        }
    }

    #[test]
    fn test_fresh_channel_shape() {
        let peer = NodeId::random();
        let (channel, nonce) = fresh_session_channel("mynet", &peer);
        let parts: Vec<&str> = channel.split('/').collect();
        assert_eq!(parts[0], "mynet");
        assert_eq!(parts[1], "signal");
        assert_eq!(parts[2], peer.to_hex());
        assert_eq!(parts[4], nonce);
        assert_eq!(parts.len(), 5);
    }

    #[test]
    fn test_validate_accepts_fresh_envelope() {
        let local = NodeId::random();
        let from = NodeId::random();
        let envelope = envelope_for(local, from);
        validate_envelope(&envelope, &local, None).unwrap();
        validate_envelope(&envelope, &local, Some(&from)).unwrap();
    }

    #[test]
    fn test_validate_rejects_wrong_recipient() {
        let local = NodeId::random();
        let envelope = envelope_for(NodeId::random(), NodeId::random());
        let err = validate_envelope(&envelope, &local, None).unwrap_err();
        assert_eq!(err.kind(), "invalid-signaling");
    }

    #[test]
    fn test_validate_rejects_unexpected_sender() {
        let local = NodeId::random();
        let envelope = envelope_for(local, NodeId::random());
        let someone_else = NodeId::random();
        assert!(validate_envelope(&envelope, &local, Some(&someone_else)).is_err());
    }

    #[test]
    fn test_validate_rejects_stale_timestamp() {
        let local = NodeId::random();
        let mut envelope = envelope_for(local, NodeId::random());
        envelope.timestamp -= MAX_SIGNAL_SKEW_MS + 1_000;
        assert!(validate_envelope(&envelope, &local, None).is_err());
    }

    #[test]
    fn test_validate_rejects_mismatched_channel() {
        let local = NodeId::random();
        let mut envelope = envelope_for(local, NodeId::random());
        envelope.channel = "ns/signal/somebody-else/0/deadbeef".into();
        assert!(validate_envelope(&envelope, &local, None).is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_intent() {
        let hub = MemoryMeshHub::new();
        let dialer_mesh: SharedMesh = Arc::new(hub.handle());
        let local_mesh: SharedMesh = Arc::new(hub.handle());
        let local = NodeId::random();
        let dialer = NodeId::random();

        let (punch_tx, mut punch_rx) = mpsc::channel(4);
        let (webrtc_tx, mut webrtc_rx) = mpsc::channel(4);
        let dispatcher = SignalDispatcher::spawn(
            local_mesh,
            "ns",
            local,
            vec![
                (SignalIntent::UdpPunch, punch_tx),
                (SignalIntent::Webrtc, webrtc_tx),
            ],
        )
        .await
        .unwrap();

        let session = open_session(&dialer_mesh, "ns", dialer, local, SignalIntent::UdpPunch)
            .await
            .unwrap();

        let envelope = punch_rx.recv().await.unwrap();
        assert_eq!(envelope.from, dialer);
        assert_eq!(envelope.channel, session);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), webrtc_rx.recv())
                .await
                .is_err()
        );
        dispatcher.stop();
    }
}
