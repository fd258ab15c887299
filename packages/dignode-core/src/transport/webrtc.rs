//! # WebRTC Transport
//!
//! Frames over a reliable, ordered WebRTC data channel, one frame per
//! message. SDP offer/answer travels out-of-band on a mesh signaling
//! session; ICE gathering runs non-trickle so each side publishes a
//! single blob. The configured STUN servers feed ICE its server-
//! reflexive candidates.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{Channel, TransportKind};
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::mesh::SharedMesh;
use crate::signaling::{self, SignalEnvelope, SignalIntent};
use crate::wire::{self, Frame, MAX_FRAME_SIZE};

/// Label on the single data channel both sides use.
const DATA_CHANNEL_LABEL: &str = "dig";

/// How long a dial waits for the answer SDP and the channel to open.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Which side of the offer/answer exchange an SDP message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum SdpRole {
    Offer,
    Answer,
}

/// SDP blob published on the signaling session channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SdpMessage {
    from: NodeId,
    role: SdpRole,
    sdp: RTCSessionDescription,
}

/// Dials and answers WebRTC connections for this node.
pub struct WebRtcConnector {
    pub mesh: SharedMesh,
    pub namespace: String,
    pub local_id: NodeId,
    /// `stun:host:port` URIs for ICE
    pub stun_servers: Vec<String>,
}

impl WebRtcConnector {
    /// Build a peer connection with the configured ICE servers.
    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| Error::Transport(format!("webrtc codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| Error::Transport(format!("webrtc interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.stun_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration { ice_servers, ..Default::default() };
        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("webrtc peer connection: {e}")))?;
        Ok(Arc::new(pc))
    }

    /// Offer side.
    pub async fn dial(&self, peer: NodeId) -> Result<WebRtcChannel> {
        let session = signaling::open_session(
            &self.mesh,
            &self.namespace,
            self.local_id,
            peer,
            SignalIntent::Webrtc,
        )
        .await?;
        let mut session_rx = self.mesh.subscribe(&session).await?;

        let pc = self.new_peer_connection().await?;
        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("create data channel: {e}")))?;

        // Non-trickle: gather every candidate, then ship one blob.
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("create offer: {e}")))?;
        let mut gather_done = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("set local: {e}")))?;
        let _ = gather_done.recv().await;
        let local_sdp = pc
            .local_description()
            .await
            .ok_or_else(|| Error::ConnectionFailed("no local description".into()))?;

        let offer_msg = SdpMessage { from: self.local_id, role: SdpRole::Offer, sdp: local_sdp };
        let offer_bytes = serde_json::to_vec(&offer_msg)?;

        let answer = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let mut resend = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = resend.tick() => {
                        self.mesh.publish(&session, offer_bytes.clone()).await?;
                    }
                    msg = session_rx.recv() => {
                        let Some(msg) = msg else {
                            return Err(Error::ConnectionFailed("signaling channel closed".into()));
                        };
                        if let Ok(parsed) = serde_json::from_slice::<SdpMessage>(&msg.payload) {
                            if parsed.role == SdpRole::Answer && parsed.from == peer {
                                return Ok(parsed.sdp);
                            }
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| Error::ConnectionFailed("no webrtc answer".into()))??;
        let _ = self.mesh.unsubscribe(&session).await;

        pc.set_remote_description(answer)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("set remote: {e}")))?;

        WebRtcChannel::assemble(pc, dc, peer).await
    }

    /// Answer side: the dispatcher handed us a validated envelope.
    pub async fn accept(&self, envelope: &SignalEnvelope) -> Result<WebRtcChannel> {
        let mut session_rx = self.mesh.subscribe(&envelope.channel).await?;

        // Wait for the offer SDP.
        let offer = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                let Some(msg) = session_rx.recv().await else {
                    return Err(Error::ConnectionFailed("signaling channel closed".into()));
                };
                if let Ok(parsed) = serde_json::from_slice::<SdpMessage>(&msg.payload) {
                    if parsed.role == SdpRole::Offer && parsed.from == envelope.from {
                        return Ok(parsed.sdp);
                    }
                }
            }
        })
        .await
        .map_err(|_| Error::ConnectionFailed("no webrtc offer".into()))??;

        let pc = self.new_peer_connection().await?;

        // The dialer created the channel; capture it when it arrives.
        let (dc_tx, dc_rx) = oneshot::channel();
        let dc_slot = Arc::new(parking_lot::Mutex::new(Some(dc_tx)));
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = dc_slot.clone();
            Box::pin(async move {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(dc);
                }
            })
        }));

        pc.set_remote_description(offer)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("set remote: {e}")))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("create answer: {e}")))?;
        let mut gather_done = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("set local: {e}")))?;
        let _ = gather_done.recv().await;
        let local_sdp = pc
            .local_description()
            .await
            .ok_or_else(|| Error::ConnectionFailed("no local description".into()))?;

        let answer_msg =
            SdpMessage { from: self.local_id, role: SdpRole::Answer, sdp: local_sdp };
        self.mesh
            .publish(&envelope.channel, serde_json::to_vec(&answer_msg)?)
            .await?;
        let _ = self.mesh.unsubscribe(&envelope.channel).await;

        let dc = tokio::time::timeout(CONNECT_TIMEOUT, dc_rx)
            .await
            .map_err(|_| Error::ConnectionFailed("data channel never arrived".into()))?
            .map_err(|_| Error::ConnectionFailed("data channel slot dropped".into()))?;

        WebRtcChannel::assemble(pc, dc, envelope.from).await
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

/// A framed channel over one WebRTC data channel.
pub struct WebRtcChannel {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    remote: NodeId,
    in_rx: Mutex<mpsc::Receiver<Frame>>,
    closed: AtomicBool,
}

impl WebRtcChannel {
    /// Wire the handlers and wait for the channel to open.
    async fn assemble(
        pc: Arc<RTCPeerConnection>,
        dc: Arc<RTCDataChannel>,
        remote: NodeId,
    ) -> Result<Self> {
        let (in_tx, in_rx) = mpsc::channel::<Frame>(64);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let in_tx = in_tx.clone();
            Box::pin(async move {
                match wire::decode(&msg.data, MAX_FRAME_SIZE) {
                    Ok(frame) => {
                        let _ = in_tx.send(frame).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping bad webrtc frame");
                    }
                }
            })
        }));

        let (open_tx, open_rx) = oneshot::channel();
        let open_slot = Arc::new(parking_lot::Mutex::new(Some(open_tx)));
        {
            let open_slot = open_slot.clone();
            dc.on_open(Box::new(move || {
                let open_slot = open_slot.clone();
                Box::pin(async move {
                    if let Some(tx) = open_slot.lock().take() {
                        let _ = tx.send(());
                    }
                })
            }));
        }
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if state == RTCPeerConnectionState::Failed {
                tracing::warn!("webrtc peer connection failed");
            }
            Box::pin(async {})
        }));

        // An inbound channel may have opened before the handler landed.
        if dc.ready_state() != RTCDataChannelState::Open {
            tokio::time::timeout(CONNECT_TIMEOUT, open_rx)
                .await
                .map_err(|_| Error::ConnectionFailed("webrtc channel never opened".into()))?
                .map_err(|_| Error::ConnectionFailed("webrtc open slot dropped".into()))?;
        }

        Ok(Self {
            pc,
            dc,
            remote,
            in_rx: Mutex::new(in_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// The node on the far end.
    pub fn remote_node(&self) -> NodeId {
        self.remote
    }
}

#[async_trait]
impl Channel for WebRtcChannel {
    fn transport(&self) -> TransportKind {
        TransportKind::Webrtc
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed(self.remote.to_hex()));
        }
        let bytes = wire::encode(&frame, MAX_FRAME_SIZE)?;
        self.dc
            .send(&Bytes::from(bytes))
            .await
            .map_err(|e| Error::Transport(format!("webrtc send: {e}")))?;
        Ok(())
    }

    async fn recv(&self) -> Option<Frame> {
        self.in_rx.lock().await.recv().await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.dc.close().await;
        let _ = self.pc.close().await;
    }
}

// ============================================================================
// TESTS
// ============================================================================
