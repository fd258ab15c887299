//! # Gossip Swarm Client
//!
//! [`Mesh`] implementation over a libp2p swarm: gossipsub for the
//! channels themselves, identify + ping for peer bookkeeping, TCP with
//! noise encryption and yamux multiplexing underneath.
//!
//! The swarm lives on its own task; the handle talks to it over a
//! command channel and fans incoming messages out to subscribers.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use libp2p::{
    gossipsub, identify, noise, ping,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, Swarm, SwarmBuilder,
};

use super::{Mesh, MeshMessage};
use crate::error::Error;
use crate::error::Result as CoreResult;

/// Protocol version advertised via identify.
const PROTOCOL_VERSION: &str = "/dignode/1.0.0";

/// Agent version advertised via identify.
const AGENT_VERSION: &str = concat!("dignode-core/", env!("CARGO_PKG_VERSION"));

/// Upper bound for a gossipsub message; relay-tunnelled frames are the
/// largest payload and are capped at 1 MiB before encoding.
const MAX_GOSSIP_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Gossip swarm configuration.
#[derive(Debug, Clone)]
pub struct GossipMeshConfig {
    /// TCP listen port for the swarm (0 = pick any)
    pub listen_port: u16,
    /// Bootstrap peer multiaddrs
    pub bootstrap_peers: Vec<String>,
}

impl Default for GossipMeshConfig {
    fn default() -> Self {
        Self { listen_port: 0, bootstrap_peers: vec![] }
    }
}

/// Combined behaviour for the mesh swarm.
#[derive(NetworkBehaviour)]
struct MeshBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

/// Commands sent to the swarm task.
enum MeshCommand {
    Publish {
        channel: String,
        payload: Vec<u8>,
    },
    Subscribe {
        channel: String,
        response_tx: oneshot::Sender<mpsc::Receiver<MeshMessage>>,
    },
    Unsubscribe {
        channel: String,
    },
    Shutdown,
}

/// A running gossip mesh client.
pub struct GossipMesh {
    command_tx: mpsc::Sender<MeshCommand>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl GossipMesh {
    /// Build the swarm, start listening, dial the bootstrap peers, and
    /// spawn the event loop.
    pub fn spawn(config: GossipMeshConfig) -> CoreResult<Arc<Self>> {
        let mut swarm = build_swarm()?;

        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|e| Error::Mesh(format!("listen addr: {e}")))?;
        swarm
            .listen_on(listen)
            .map_err(|e| Error::Mesh(format!("listen: {e}")))?;

        for peer in &config.bootstrap_peers {
            match peer.parse::<Multiaddr>() {
                Ok(addr) => {
                    if let Err(e) = swarm.dial(addr.clone()) {
                        tracing::warn!(%addr, error = %e, "failed to dial bootstrap peer");
                    }
                }
                Err(e) => {
                    tracing::warn!(peer, error = %e, "invalid bootstrap multiaddr");
                }
            }
        }

        let (command_tx, command_rx) = mpsc::channel(256);
        let listen_addrs = Arc::new(RwLock::new(Vec::new()));
        let loop_addrs = listen_addrs.clone();
        let task = tokio::spawn(async move {
            run_event_loop(swarm, command_rx, loop_addrs).await;
        });

        Ok(Arc::new(Self {
            command_tx,
            listen_addrs,
            task: parking_lot::Mutex::new(Some(task)),
        }))
    }

    /// Addresses the swarm is listening on.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.read().clone()
    }

    /// Stop the swarm and release its sockets.
    pub async fn stop(&self) {
        let _ = self.command_tx.send(MeshCommand::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl Mesh for GossipMesh {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> CoreResult<()> {
        self.command_tx
            .send(MeshCommand::Publish { channel: channel.to_string(), payload })
            .await
            .map_err(|_| Error::Mesh("swarm task gone".into()))
    }

    async fn subscribe(&self, channel: &str) -> CoreResult<mpsc::Receiver<MeshMessage>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(MeshCommand::Subscribe { channel: channel.to_string(), response_tx })
            .await
            .map_err(|_| Error::Mesh("swarm task gone".into()))?;
        response_rx
            .await
            .map_err(|_| Error::Mesh("swarm task gone".into()))
    }

    async fn unsubscribe(&self, channel: &str) -> CoreResult<()> {
        self.command_tx
            .send(MeshCommand::Unsubscribe { channel: channel.to_string() })
            .await
            .map_err(|_| Error::Mesh("swarm task gone".into()))
    }
}

/// Build the libp2p swarm: TCP + noise + yamux, gossipsub on top.
fn build_swarm() -> CoreResult<Swarm<MeshBehaviour>> {
    let swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| Error::Mesh(format!("tcp transport: {e}")))?
        .with_dns()
        .map_err(|e| Error::Mesh(format!("dns: {e}")))?
        .with_behaviour(|key| {
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(1))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .max_transmit_size(MAX_GOSSIP_MESSAGE_SIZE)
                .build()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )?;

            let identify = identify::Behaviour::new(
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_agent_version(AGENT_VERSION.to_string()),
            );

            let ping = ping::Behaviour::new(ping::Config::new());

            Ok(MeshBehaviour { gossipsub, identify, ping })
        })
        .map_err(|e| Error::Mesh(format!("behaviour: {e}")))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

/// Drive the swarm: fan incoming gossip out to subscribers, apply
/// commands from the handle.
async fn run_event_loop(
    mut swarm: Swarm<MeshBehaviour>,
    mut command_rx: mpsc::Receiver<MeshCommand>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
) {
    let mut subscribers: HashMap<String, Vec<mpsc::Sender<MeshMessage>>> = HashMap::new();

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(MeshCommand::Publish { channel, payload }) => {
                        let topic = gossipsub::IdentTopic::new(&channel);
                        if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic, payload) {
                            // Routine while the mesh is still forming.
                            tracing::debug!(channel, error = %e, "gossip publish not delivered");
                        }
                    }
                    Some(MeshCommand::Subscribe { channel, response_tx }) => {
                        let topic = gossipsub::IdentTopic::new(&channel);
                        if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                            tracing::warn!(channel, error = %e, "gossip subscribe failed");
                        }
                        let (tx, rx) = mpsc::channel(64);
                        subscribers.entry(channel).or_default().push(tx);
                        let _ = response_tx.send(rx);
                    }
                    Some(MeshCommand::Unsubscribe { channel }) => {
                        subscribers.remove(&channel);
                        let topic = gossipsub::IdentTopic::new(&channel);
                        let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
                    }
                    Some(MeshCommand::Shutdown) | None => {
                        tracing::debug!("gossip mesh shutting down");
                        break;
                    }
                }
            }
            event = swarm.select_next_some() => {
                handle_swarm_event(event, &mut subscribers, &listen_addrs);
            }
        }
    }
}

fn handle_swarm_event(
    event: SwarmEvent<MeshBehaviourEvent>,
    subscribers: &mut HashMap<String, Vec<mpsc::Sender<MeshMessage>>>,
    listen_addrs: &Arc<RwLock<Vec<Multiaddr>>>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            tracing::info!(%address, "gossip mesh listening");
            listen_addrs.write().push(address);
        }
        SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            message,
            ..
        })) => {
            let channel = message.topic.as_str().to_string();
            if let Some(subs) = subscribers.get_mut(&channel) {
                subs.retain(|tx| !tx.is_closed());
                for tx in subs.iter() {
                    // Slow subscribers shed load rather than stalling
                    // the swarm.
                    if let Err(e) = tx.try_send(MeshMessage {
                        channel: channel.clone(),
                        payload: message.data.clone(),
                    }) {
                        tracing::warn!(channel, error = %e, "dropping gossip message for slow subscriber");
                    }
                }
            }
        }
        SwarmEvent::Behaviour(MeshBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            ..
        })) => {
            tracing::debug!(%peer_id, "identified mesh peer");
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            tracing::debug!(%peer_id, "mesh peer connected");
        }
        SwarmEvent::ConnectionClosed { peer_id, .. } => {
            tracing::debug!(%peer_id, "mesh peer disconnected");
        }
        _ => {}
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let mesh = GossipMesh::spawn(GossipMeshConfig::default()).unwrap();
        // Publishing with no peers is fine; gossip is best-effort.
        mesh.publish("lonely", b"anyone?".to_vec()).await.unwrap();
        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_returns_receiver() {
        let mesh = GossipMesh::spawn(GossipMeshConfig::default()).unwrap();
        let rx = mesh.subscribe("room").await.unwrap();
        drop(rx);
        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_listen_addr_appears() {
        let mesh = GossipMesh::spawn(GossipMeshConfig::default()).unwrap();
        let mut addrs = Vec::new();
        for _ in 0..50 {
            addrs = mesh.listen_addrs();
            if !addrs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!addrs.is_empty(), "swarm never reported a listen addr");
        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_two_swarms_exchange_messages() {
        let a = GossipMesh::spawn(GossipMeshConfig::default()).unwrap();

        // Wait for A's listen address, then bootstrap B off it.
        let mut addr = None;
        for _ in 0..50 {
            if let Some(first) = a.listen_addrs().into_iter().next() {
                addr = Some(first);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let addr = addr.expect("no listen addr");

        let b = GossipMesh::spawn(GossipMeshConfig {
            listen_port: 0,
            bootstrap_peers: vec![addr.to_string()],
        })
        .unwrap();

        let mut rx = b.subscribe("room").await.unwrap();
        let _keepalive = a.subscribe("room").await.unwrap();

        // Re-publish until the gossip mesh forms and delivery succeeds.
        let mut received = None;
        for _ in 0..60 {
            a.publish("room", b"over the mesh".to_vec()).await.unwrap();
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(msg)) => {
                    received = Some(msg);
                    break;
                }
                _ => continue,
            }
        }
        let msg = received.expect("message never crossed the mesh");
        assert_eq!(msg.payload, b"over the mesh");

        a.stop().await;
        b.stop().await;
    }
}
