//! # Node Orchestrator
//!
//! Owns everything and wires it together: the local store and its
//! watcher, the transports and their accept loops, NAT discovery and
//! port mappings, the announcement bus, the connection table, the
//! download queue, and the per-peer strike ledger.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            NODE                                     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  store ──added/removed──► announcer ──record──► gossip mesh         │
//! │                                                      │              │
//! │  peer announcement ◄─────────────────────────────────┘              │
//! │        │ missing digests                                            │
//! │        ▼                                                            │
//! │  download queue ──► connection selector ──► transport channel       │
//! │        │                  (NAT walk)             │                  │
//! │        ▼                                         ▼                  │
//! │  downloader ◄──────── connection table ────► serve loop             │
//! │        │ verified bytes                          ▲ choke scheduler  │
//! │        ▼                                         │                  │
//! │      store ──────────────────────────────────────┘                  │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lifecycle: `new → starting → running → stopping → stopped`; `start`
//! on a running node fails with `already-running`, `stop` on a stopped
//! node is a no-op. Shutdown cancels transfers (partials stay for
//! resume), removes port mappings, closes every socket, and flushes the
//! success registry.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::announce::{Announcer, AnnouncerHandle, DownloadJob, PendingDigests};
use crate::config::NodeConfig;
use crate::connect::{
    default_registry_dir, handshake, ConnectionSelector, EnabledTransports, SuccessRegistry,
};
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::mesh::{GossipMesh, GossipMeshConfig, SharedMesh};
use crate::nat::natpmp::{NatPmpClient, PmpProtocol};
use crate::nat::punch::{TcpPuncher, UdpPuncher};
use crate::nat::stun::StunClient;
use crate::nat::upnp::{UpnpClient, UpnpProtocol};
use crate::nat::{AddressPolicy, MappingMethod, PortMapping};
use crate::peers::{
    Capabilities, Endpoint, MappedEndpoint, PeerTable, RelayCapability, WebRtcCapability,
};
use crate::signaling::{SignalDispatcher, SignalEnvelope, SignalIntent};
use crate::store::{LocalStore, WatcherHandle};
use crate::time::now_timestamp_millis;
use crate::transfer::choke::Choker;
use crate::transfer::download::Downloader;
use crate::transfer::serve::{serve_connection, ServeDeps};
use crate::transfer::{CancelFlag, Connection, TransferEvent};
use crate::transport::relay::RelayListener;
use crate::transport::tcp::{TcpAcceptor, TcpChannel};
use crate::transport::udp::UdpEndpoint;
use crate::transport::webrtc::WebRtcConnector;
use crate::transport::{BoxedChannel, TransportKind};

/// Budget for NAT discovery during start; failures are tolerated.
const NAT_DISCOVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Read-only snapshot for the `status` surface. Introspection only; it
/// never dials anything.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub state: NodeState,
    pub node_id: NodeId,
    pub held_digests: usize,
    pub live_peers: usize,
    pub open_connections: usize,
    pub queued_or_active_downloads: usize,
    pub blacklisted_peers: usize,
    pub port_mapping: Option<(IpAddr, u16)>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
}

struct StrikeLedger {
    threshold: u32,
    window_ms: i64,
    strikes: parking_lot::Mutex<HashMap<NodeId, Vec<i64>>>,
}

impl StrikeLedger {
    fn new(threshold: u32, window_ms: i64) -> Self {
        Self { threshold, window_ms, strikes: parking_lot::Mutex::new(HashMap::new()) }
    }

    /// Record a strike; `true` means the threshold was crossed.
    fn strike(&self, peer: NodeId) -> bool {
        let now = now_timestamp_millis();
        let mut strikes = self.strikes.lock();
        let entry = strikes.entry(peer).or_default();
        entry.push(now);
        entry.retain(|ts| now - *ts < self.window_ms);
        entry.len() as u32 >= self.threshold
    }
}

/// Everything alive between `start` and `stop`.
struct Running {
    mesh: SharedMesh,
    /// Set when we built the gossip swarm ourselves and must stop it
    own_mesh: Option<Arc<GossipMesh>>,
    store: Arc<LocalStore>,
    watcher: WatcherHandle,
    peers: Arc<PeerTable>,
    registry: Arc<SuccessRegistry>,
    choker: Arc<Choker>,
    pending: Arc<PendingDigests>,
    blacklist: Arc<RwLock<HashSet<NodeId>>>,
    connections: Arc<parking_lot::Mutex<HashMap<NodeId, Arc<Connection>>>>,
    udp_endpoint: Option<Arc<UdpEndpoint>>,
    tcp_port: Option<u16>,
    public_udp_addr: Option<SocketAddr>,
    public_ip: Option<IpAddr>,
    mapping: Option<PortMapping>,
    upnp: Option<Arc<UpnpClient>>,
    natpmp: Option<Arc<NatPmpClient>>,
    announcer: AnnouncerHandle,
    _dispatcher: SignalDispatcher,
    shutdown: CancelFlag,
    transfer_cancels: Arc<parking_lot::Mutex<HashMap<String, CancelFlag>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// The orchestrator.
pub struct Node {
    config: NodeConfig,
    id: NodeId,
    state: RwLock<NodeState>,
    running: tokio::sync::Mutex<Option<Arc<Running>>>,
    events_tx: broadcast::Sender<TransferEvent>,
    /// Passes the job receiver from announcer wiring to the queue task.
    job_rx: parking_lot::Mutex<Option<mpsc::Receiver<DownloadJob>>>,
}

impl Node {
    /// Validate the configuration and build an idle node.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let (events_tx, _) = broadcast::channel(256);
        Ok(Self {
            config,
            id: NodeId::random(),
            state: RwLock::new(NodeState::New),
            running: tokio::sync::Mutex::new(None),
            events_tx,
            job_rx: parking_lot::Mutex::new(None),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Subscribe to transfer progress events.
    pub fn events(&self) -> broadcast::Receiver<TransferEvent> {
        self.events_tx.subscribe()
    }

    /// Start with the gossip swarm from the configuration.
    pub async fn start(&self) -> Result<()> {
        self.start_with_mesh(None).await
    }

    /// Start with an injected mesh (tests, single-host hubs).
    pub async fn start_with_mesh(&self, mesh: Option<SharedMesh>) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                NodeState::New | NodeState::Stopped => *state = NodeState::Starting,
                NodeState::Running | NodeState::Starting => return Err(Error::AlreadyRunning),
                NodeState::Stopping => return Err(Error::ShutdownInProgress),
            }
        }
        match self.bring_up(mesh).await {
            Ok(running) => {
                *self.running.lock().await = Some(running);
                *self.state.write() = NodeState::Running;
                tracing::info!(id = %self.id, "node running");
                Ok(())
            }
            Err(e) => {
                *self.state.write() = NodeState::Stopped;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, mesh_override: Option<SharedMesh>) -> Result<Arc<Running>> {
        let config = &self.config;
        let policy = AddressPolicy::from_config(config);
        let shutdown = CancelFlag::new();

        // Store, initial scan, watcher.
        let store = LocalStore::open(&config.dig_directory).await?;
        store.scan().await?;
        let watcher = crate::store::watcher::spawn(store.clone())?;

        // Mesh: injected or our own gossip swarm.
        let (mesh, own_mesh): (SharedMesh, Option<Arc<GossipMesh>>) = match mesh_override {
            Some(mesh) => (mesh, None),
            None => {
                let gossip = GossipMesh::spawn(GossipMeshConfig {
                    listen_port: 0,
                    bootstrap_peers: config.gossip_peers.clone(),
                })?;
                (gossip.clone() as SharedMesh, Some(gossip))
            }
        };

        // Transport sockets.
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let (udp_endpoint, udp_accept) = if config.enable_udp {
            let (endpoint, accept) =
                UdpEndpoint::bind(SocketAddr::new("0.0.0.0".parse().expect("valid ip"), config.port))
                    .await?;
            (Some(endpoint), Some(accept))
        } else {
            (None, None)
        };
        let tcp_acceptor = if config.enable_tcp {
            Some(
                TcpAcceptor::bind(SocketAddr::new(
                    "0.0.0.0".parse().expect("valid ip"),
                    config.port,
                ))
                .await?,
            )
        } else {
            None
        };
        let tcp_port = tcp_acceptor.as_ref().map(|a| a.local_addr().port());
        let udp_port = udp_endpoint.as_ref().map(|e| e.local_addr().port());

        // NAT discovery, best effort within a bounded budget.
        let mut public_udp_addr = None;
        if let Some(endpoint) = &udp_endpoint {
            if !config.stun_servers.is_empty() {
                let stun = StunClient::new(endpoint.clone(), config.stun_addrs());
                match tokio::time::timeout(NAT_DISCOVERY_TIMEOUT, stun.discover()).await {
                    Ok(Ok(addr)) => public_udp_addr = Some(addr),
                    Ok(Err(e)) => tracing::debug!(error = %e, "stun discovery failed"),
                    Err(_) => tracing::debug!("stun discovery timed out"),
                }
            }
        }
        let mut public_ip = public_udp_addr.map(|a| a.ip());

        // Port mapping: UPnP first, NAT-PMP fallback.
        let mut mapping = None;
        let mut upnp_client = None;
        let mut natpmp_client = None;
        if let Some(port) = tcp_port {
            if config.enable_upnp {
                match tokio::time::timeout(
                    NAT_DISCOVERY_TIMEOUT,
                    UpnpClient::discover(std::time::Duration::from_secs(2)),
                )
                .await
                {
                    Ok(Ok(client)) => {
                        let client = Arc::new(client);
                        match client
                            .add_port_mapping(
                                UpnpProtocol::Tcp,
                                port,
                                port,
                                config.port_mapping_lifetime_s,
                                "dignode",
                            )
                            .await
                        {
                            Ok(m) => {
                                public_ip.get_or_insert(m.external_ip);
                                mapping = Some(m);
                                upnp_client = Some(client);
                            }
                            Err(e) => tracing::debug!(error = %e, "upnp mapping failed"),
                        }
                    }
                    Ok(Err(e)) => tracing::debug!(error = %e, "upnp discovery failed"),
                    Err(_) => tracing::debug!("upnp discovery timed out"),
                }
            }
            if mapping.is_none() && config.enable_natpmp {
                match tokio::time::timeout(NAT_DISCOVERY_TIMEOUT, NatPmpClient::probe()).await {
                    Ok(Ok(client)) => {
                        let client = Arc::new(client);
                        match client
                            .map(PmpProtocol::Tcp, port, port, config.port_mapping_lifetime_s)
                            .await
                        {
                            Ok(m) => {
                                public_ip.get_or_insert(m.external_ip);
                                mapping = Some(m);
                                natpmp_client = Some(client);
                            }
                            Err(e) => tracing::debug!(error = %e, "nat-pmp mapping failed"),
                        }
                    }
                    Ok(Err(e)) => tracing::debug!(error = %e, "nat-pmp probe failed"),
                    Err(_) => tracing::debug!("nat-pmp probe timed out"),
                }
            }
        }

        // What we tell the world about ourselves.
        let advertise_ip = public_ip
            .or_else(|| crate::nat::natpmp::local_ipv4().map(IpAddr::V4))
            .unwrap_or_else(|| "127.0.0.1".parse().expect("valid ip"));
        let capabilities = Arc::new(RwLock::new(Capabilities {
            direct_tcp: tcp_port.map(|port| Endpoint { ip: advertise_ip, port }),
            direct_udp: udp_port.map(|port| Endpoint { ip: advertise_ip, port }),
            upnp: mapping
                .as_ref()
                .filter(|m| m.method == MappingMethod::Upnp)
                .map(|m| MappedEndpoint { external_ip: m.external_ip, external_port: m.external_port }),
            natpmp: mapping
                .as_ref()
                .filter(|m| m.method == MappingMethod::NatPmp)
                .map(|m| MappedEndpoint { external_ip: m.external_ip, external_port: m.external_port }),
            webrtc: Some(WebRtcCapability {
                available: config.enable_webrtc,
                stun_servers: config.stun_servers.clone(),
            }),
            relay: Some(RelayCapability { available: config.enable_relay }),
        }));

        // Shared machinery.
        let registry_dir = match &config.registry_dir {
            Some(dir) => dir.clone(),
            None => default_registry_dir()?,
        };
        let registry = SuccessRegistry::load(registry_dir, config.registry_max_age_days).await?;
        let peers = Arc::new(PeerTable::new(config.peer_liveness_window_ms as i64));
        let choker = Arc::new(Choker::new(
            config.max_unchoked_peers,
            config.super_seed_chunk_allowance,
        ));
        let blacklist = Arc::new(RwLock::new(HashSet::new()));
        let pending = PendingDigests::new();
        let connections: Arc<parking_lot::Mutex<HashMap<NodeId, Arc<Connection>>>> =
            Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let serve_deps = Arc::new(ServeDeps {
            store: store.clone(),
            choker: choker.clone(),
            chunk_size: config.chunk_size,
        });

        // Signaling routes for punch answers and WebRTC offers.
        let (udp_punch_tx, udp_punch_rx) = mpsc::channel::<SignalEnvelope>(16);
        let (tcp_punch_tx, tcp_punch_rx) = mpsc::channel::<SignalEnvelope>(16);
        let (webrtc_tx, webrtc_rx) = mpsc::channel::<SignalEnvelope>(16);
        let dispatcher = SignalDispatcher::spawn(
            mesh.clone(),
            &config.namespace,
            self.id,
            vec![
                (SignalIntent::UdpPunch, udp_punch_tx),
                (SignalIntent::TcpPunch, tcp_punch_tx),
                (SignalIntent::Webrtc, webrtc_tx),
            ],
        )
        .await?;

        let running = Arc::new(Running {
            mesh: mesh.clone(),
            own_mesh,
            store: store.clone(),
            watcher,
            peers: peers.clone(),
            registry: registry.clone(),
            choker: choker.clone(),
            pending: pending.clone(),
            blacklist: blacklist.clone(),
            connections: connections.clone(),
            udp_endpoint: udp_endpoint.clone(),
            tcp_port,
            public_udp_addr,
            public_ip,
            mapping: mapping.clone(),
            upnp: upnp_client,
            natpmp: natpmp_client,
            announcer: self
                .spawn_announcer(
                    mesh.clone(),
                    store.clone(),
                    peers.clone(),
                    capabilities,
                    blacklist.clone(),
                    pending.clone(),
                )
                .await?,
            _dispatcher: dispatcher,
            shutdown: shutdown.clone(),
            transfer_cancels: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        // Accept loops for every enabled inbound path.
        if let Some(mut acceptor) = tcp_acceptor {
            let node = self.accept_ctx(&running, serve_deps.clone());
            let handle = tokio::spawn(async move {
                while let Some(channel) = acceptor.accept().await {
                    node.admit(Arc::new(channel) as BoxedChannel, TransportKind::DirectTcp);
                }
                acceptor.shutdown();
            });
            tasks.push(handle);
        }
        if let Some(mut accept) = udp_accept {
            let node = self.accept_ctx(&running, serve_deps.clone());
            tasks.push(tokio::spawn(async move {
                while let Some(channel) = accept.accept().await {
                    node.admit(Arc::new(channel) as BoxedChannel, TransportKind::DirectUdp);
                }
            }));
        }
        if config.enable_relay {
            let mut listener =
                RelayListener::spawn(mesh.clone(), &config.namespace, self.id).await?;
            let node = self.accept_ctx(&running, serve_deps.clone());
            tasks.push(tokio::spawn(async move {
                while let Some(channel) = listener.accept().await {
                    node.admit(Arc::new(channel) as BoxedChannel, TransportKind::Relay);
                }
            }));
        }

        // Punch answers.
        if let Some(endpoint) = udp_endpoint.clone() {
            let puncher = UdpPuncher {
                endpoint,
                mesh: mesh.clone(),
                namespace: config.namespace.clone(),
                local_id: self.id,
                policy,
                max_retries: config.punch_max_retries,
            };
            let public = public_udp_addr;
            let mut rx = udp_punch_rx;
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    if let Err(e) = puncher.answer(&envelope, public).await {
                        tracing::debug!(error = %e, "udp punch answer failed");
                    }
                    // The dialer's handshake arrives through the normal
                    // UDP accept queue once the pairing is open.
                }
            }));
        }
        if config.enable_tcp {
            let puncher = TcpPuncher {
                mesh: mesh.clone(),
                namespace: config.namespace.clone(),
                local_id: self.id,
                policy,
                max_retries: config.punch_max_retries,
                public_ip,
            };
            let node = self.accept_ctx(&running, serve_deps.clone());
            let mut rx = tcp_punch_rx;
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    match puncher.answer(&envelope).await {
                        Ok(stream) => {
                            match TcpChannel::from_stream(stream, TransportKind::TcpHolePunch) {
                                Ok(channel) => node
                                    .admit(Arc::new(channel) as BoxedChannel, TransportKind::TcpHolePunch),
                                Err(e) => tracing::debug!(error = %e, "punched socket unusable"),
                            }
                        }
                        Err(e) => tracing::debug!(error = %e, "tcp punch answer failed"),
                    }
                }
            }));
        }
        if config.enable_webrtc {
            let connector = WebRtcConnector {
                mesh: mesh.clone(),
                namespace: config.namespace.clone(),
                local_id: self.id,
                stun_servers: config.stun_servers.clone(),
            };
            let node = self.accept_ctx(&running, serve_deps.clone());
            let mut rx = webrtc_rx;
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    match connector.accept(&envelope).await {
                        Ok(channel) => {
                            node.admit(Arc::new(channel) as BoxedChannel, TransportKind::Webrtc)
                        }
                        Err(e) => tracing::debug!(error = %e, "webrtc accept failed"),
                    }
                }
            }));
        }

        // Download queue.
        tasks.push(self.spawn_queue(&running, serve_deps.clone()));

        // Choke updates and super-seed bookkeeping.
        {
            let choker = choker.clone();
            let connections = connections.clone();
            let store = store.clone();
            let peers = peers.clone();
            let interval = config.choke_update_interval();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.cancelled() => break,
                    }
                    for digest in store.digests() {
                        choker.set_super_seed(&digest, peers.is_unique_source(&digest));
                    }
                    for (peer, unchoke) in choker.rebalance() {
                        let connection = connections.lock().get(&peer).cloned();
                        if let Some(connection) = connection {
                            connection.set_choked_by_us(!unchoke);
                            let frame = if unchoke { crate::wire::Frame::Unchoke } else { crate::wire::Frame::Choke };
                            if let Err(e) = connection.send(frame).await {
                                tracing::debug!(peer = %peer, error = %e, "choke update send failed");
                            }
                        }
                    }
                }
            }));
        }

        // Mapping renewal.
        if let Some(m) = mapping.clone() {
            let upnp = running.upnp.clone();
            let natpmp = running.natpmp.clone();
            let lifetime = config.port_mapping_lifetime_s;
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut mapping = m;
                loop {
                    let wait_ms = (mapping.renew_at() - now_timestamp_millis()).max(0) as u64;
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(wait_ms)) => {}
                        _ = shutdown.cancelled() => break,
                    }
                    let renewed = match mapping.method {
                        MappingMethod::Upnp => match &upnp {
                            Some(client) => client
                                .add_port_mapping(
                                    UpnpProtocol::Tcp,
                                    mapping.external_port,
                                    mapping.internal_port,
                                    lifetime,
                                    "dignode",
                                )
                                .await,
                            None => break,
                        },
                        MappingMethod::NatPmp => match &natpmp {
                            Some(client) => client
                                .map(
                                    PmpProtocol::Tcp,
                                    mapping.internal_port,
                                    mapping.external_port,
                                    lifetime,
                                )
                                .await,
                            None => break,
                        },
                    };
                    match renewed {
                        Ok(next) => mapping = next,
                        Err(e) => {
                            tracing::warn!(error = %e, "port mapping renewal failed");
                            break;
                        }
                    }
                }
            }));
        }

        // Periodic full rescan reconciling watcher gaps, plus a strike
        // ledger owned by the queue: both live in tasks spawned above.
        {
            let store = store.clone();
            let interval = config.rescan_interval();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // skip the immediate tick; start already scanned
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.cancelled() => break,
                    }
                    if let Err(e) = store.scan().await {
                        tracing::warn!(error = %e, "periodic rescan failed");
                    }
                }
            }));
        }

        running.tasks.lock().extend(tasks);
        Ok(running)
    }

    async fn spawn_announcer(
        &self,
        mesh: SharedMesh,
        store: Arc<LocalStore>,
        peers: Arc<PeerTable>,
        capabilities: Arc<RwLock<Capabilities>>,
        blacklist: Arc<RwLock<HashSet<NodeId>>>,
        pending: Arc<PendingDigests>,
    ) -> Result<AnnouncerHandle> {
        let (job_tx, job_rx) = mpsc::channel::<DownloadJob>(256);
        // The queue consumes job_rx; stash it for spawn_queue.
        *self.job_rx.lock() = Some(job_rx);
        let announcer = Arc::new(Announcer {
            mesh,
            namespace: self.config.namespace.clone(),
            local_id: self.id,
            store,
            peers,
            capabilities,
            blacklist,
            pending,
            job_tx,
            interval: self.config.sync_interval(),
            max_announcement_age_ms: self.config.max_announcement_age_ms as i64,
        });
        announcer.spawn().await
    }

    fn accept_ctx(&self, running: &Arc<Running>, serve_deps: Arc<ServeDeps>) -> AcceptCtx {
        AcceptCtx {
            local_id: self.id,
            running: running.clone(),
            serve_deps,
            shutdown: running.shutdown.clone(),
        }
    }

    fn spawn_queue(&self, running: &Arc<Running>, serve_deps: Arc<ServeDeps>) -> JoinHandle<()> {
        let mut job_rx = self
            .job_rx
            .lock()
            .take()
            .expect("job receiver wired by spawn_announcer");
        let config = self.config.clone();
        let local_id = self.id;
        let running = running.clone();
        let events = self.events_tx.clone();
        let strikes = Arc::new(StrikeLedger::new(
            config.strike_threshold,
            config.strike_window_ms as i64,
        ));

        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(config.max_concurrent_downloads));
            loop {
                let job = tokio::select! {
                    job = job_rx.recv() => job,
                    _ = running.shutdown.cancelled() => break,
                };
                let Some(job) = job else { break };

                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => permit,
                    _ = running.shutdown.cancelled() => break,
                };
                let Ok(permit) = permit else { break };

                let running = running.clone();
                let config = config.clone();
                let events = events.clone();
                let strikes = strikes.clone();
                let serve_deps = serve_deps.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let digest = job.digest.clone();
                    let cancel = CancelFlag::new();
                    running
                        .transfer_cancels
                        .lock()
                        .insert(digest.clone(), cancel.clone());

                    let result = run_job(
                        &running,
                        &config,
                        local_id,
                        &job,
                        &events,
                        &serve_deps,
                        &cancel,
                    )
                    .await;

                    running.transfer_cancels.lock().remove(&digest);
                    running.pending.release(&digest);

                    if let Err(e) = result {
                        tracing::debug!(digest, error = %e, "download job failed");
                        if e.is_integrity() && strikes.strike(job.source) {
                            tracing::warn!(peer = %job.source, "peer blacklisted after repeated corruption");
                            running.blacklist.write().insert(job.source);
                            running.peers.remove(&job.source);
                            let connection = running.connections.lock().remove(&job.source);
                            if let Some(connection) = connection {
                                connection.close().await;
                            }
                        }
                    }
                });
            }
        })
    }

    /// Graceful shutdown; see the module docs for the guarantees.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                NodeState::Running => *state = NodeState::Stopping,
                NodeState::Stopped | NodeState::New => return Ok(()),
                NodeState::Starting | NodeState::Stopping => {
                    return Err(Error::ShutdownInProgress)
                }
            }
        }
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            // Stop intake first.
            running.announcer.stop();
            // Cancel in-flight transfers; partials stay for resume.
            running.shutdown.cancel();
            let cancels: Vec<CancelFlag> =
                running.transfer_cancels.lock().values().cloned().collect();
            for cancel in cancels {
                cancel.cancel();
            }
            // Give transfers a beat to unwind before tearing sockets down.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;

            // Remove port mappings.
            if let Some(mapping) = &running.mapping {
                match mapping.method {
                    MappingMethod::Upnp => {
                        if let Some(client) = &running.upnp {
                            let _ = client
                                .delete_port_mapping(UpnpProtocol::Tcp, mapping.external_port)
                                .await;
                        }
                    }
                    MappingMethod::NatPmp => {
                        if let Some(client) = &running.natpmp {
                            let _ = client.unmap(PmpProtocol::Tcp, mapping.internal_port).await;
                        }
                    }
                }
            }

            // Close connections and transports.
            let connections: Vec<Arc<Connection>> =
                running.connections.lock().drain().map(|(_, c)| c).collect();
            for connection in connections {
                connection.close().await;
            }
            if let Some(endpoint) = &running.udp_endpoint {
                endpoint.shutdown();
            }
            for task in running.tasks.lock().drain(..) {
                task.abort();
            }
            if let Some(mesh) = &running.own_mesh {
                mesh.stop().await;
            }
            running.watcher.stop();
            running.registry.shutdown().await;
        }
        *self.state.write() = NodeState::Stopped;
        tracing::info!(id = %self.id, "node stopped");
        Ok(())
    }

    /// Read-only status snapshot.
    pub async fn status(&self) -> NodeStatus {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) => NodeStatus {
                state: self.state(),
                node_id: self.id,
                held_digests: running.store.digests().len(),
                live_peers: running.peers.live_peers().len(),
                open_connections: running.connections.lock().len(),
                queued_or_active_downloads: running.pending.len(),
                blacklisted_peers: running.blacklist.read().len(),
                port_mapping: running
                    .mapping
                    .as_ref()
                    .map(|m| (m.external_ip, m.external_port)),
                tcp_port: running.tcp_port,
                udp_port: running.udp_endpoint.as_ref().map(|e| e.local_addr().port()),
            },
            None => NodeStatus {
                state: self.state(),
                node_id: self.id,
                held_digests: 0,
                live_peers: 0,
                open_connections: 0,
                queued_or_active_downloads: 0,
                blacklisted_peers: 0,
                port_mapping: None,
                tcp_port: None,
                udp_port: None,
            },
        }
    }
}

/// Context shared by the accept loops: admit a handshaked channel into
/// the connection table and start serving it.
#[derive(Clone)]
struct AcceptCtx {
    local_id: NodeId,
    running: Arc<Running>,
    serve_deps: Arc<ServeDeps>,
    shutdown: CancelFlag,
}

impl AcceptCtx {
    fn admit(&self, channel: BoxedChannel, kind: TransportKind) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let remote = match handshake(channel.as_ref(), ctx.local_id, None).await {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::debug!(error = %e, "inbound handshake failed");
                    channel.close().await;
                    return;
                }
            };
            if ctx.running.blacklist.read().contains(&remote) {
                tracing::debug!(peer = %remote, "refusing blacklisted peer");
                channel.close().await;
                return;
            }
            register_connection(&ctx.running, &ctx.serve_deps, remote, kind, channel, &ctx.shutdown);
        });
    }
}

/// Insert a connection into the table (replacing any dead predecessor)
/// and spawn its serving loop.
fn register_connection(
    running: &Arc<Running>,
    serve_deps: &Arc<ServeDeps>,
    remote: NodeId,
    kind: TransportKind,
    channel: BoxedChannel,
    shutdown: &CancelFlag,
) -> Arc<Connection> {
    let (connection, server_rx) = Connection::new(remote, kind, channel);
    let old = running.connections.lock().insert(remote, connection.clone());
    if let Some(old) = old {
        tokio::spawn(async move { old.close().await });
    }
    running.choker.register_peer(remote);

    let deps = serve_deps.clone();
    let serve_conn = connection.clone();
    let cancel = shutdown.clone();
    let connections = running.connections.clone();
    let choker = running.choker.clone();
    tokio::spawn(async move {
        serve_connection(deps, serve_conn.clone(), server_rx, cancel).await;
        // Serving ends when the connection dies; drop the table entry.
        let mut table = connections.lock();
        if table
            .get(&serve_conn.remote)
            .map_or(false, |c| Arc::ptr_eq(c, &serve_conn))
        {
            table.remove(&serve_conn.remote);
        }
        drop(table);
        choker.remove_peer(&serve_conn.remote);
    });

    tracing::info!(peer = %remote, %kind, "connection established");
    connection
}

/// One download job end to end: find or build a connection, run the
/// download, feed events.
async fn run_job(
    running: &Arc<Running>,
    config: &NodeConfig,
    local_id: NodeId,
    job: &DownloadJob,
    events: &broadcast::Sender<TransferEvent>,
    serve_deps: &Arc<ServeDeps>,
    cancel: &CancelFlag,
) -> Result<()> {
    if running.store.lookup(&job.digest).is_some() {
        return Ok(());
    }
    if running.blacklist.read().contains(&job.source) {
        return Err(Error::PeerNotFound(format!("{} is blacklisted", job.source)));
    }

    // Existing healthy connection, or a fresh one through the selector.
    let primary = match running.connections.lock().get(&job.source).cloned() {
        Some(connection) if !connection.is_closed() => Some(connection),
        _ => None,
    };
    let primary = match primary {
        Some(connection) => connection,
        None => {
            let peer = running
                .peers
                .get(&job.source)
                .ok_or_else(|| Error::PeerNotFound(job.source.to_hex()))?;
            let selector = ConnectionSelector {
                local_id,
                mesh: running.mesh.clone(),
                namespace: config.namespace.clone(),
                registry: running.registry.clone(),
                udp_endpoint: running.udp_endpoint.clone(),
                policy: AddressPolicy::from_config(config),
                public_udp_addr: running.public_udp_addr,
                public_ip: running.public_ip,
                stun_servers: config.stun_servers.clone(),
                enabled: EnabledTransports {
                    tcp: config.enable_tcp,
                    udp: config.enable_udp,
                    webrtc: config.enable_webrtc,
                    relay: config.enable_relay,
                },
                attempt_timeout: config.connect_timeout(),
                punch_retries: config.punch_max_retries,
            };
            let established = selector.connect(&peer).await?;
            register_connection(
                running,
                serve_deps,
                established.remote_id,
                established.kind,
                established.channel,
                &running.shutdown,
            )
        }
    };

    // Secondary sources: other live holders we already have channels to.
    let mut sources = vec![primary];
    for holder in running.peers.holders_of(&job.digest) {
        if holder == job.source {
            continue;
        }
        let connection = running.connections.lock().get(&holder).cloned();
        if let Some(connection) = connection {
            if !connection.is_closed() {
                sources.push(connection);
            }
        }
    }

    let downloader = Downloader {
        store: running.store.clone(),
        request_timeout: config.request_timeout(),
        max_outstanding: config.max_outstanding_requests,
        max_chunk_retries: config.max_chunk_retries,
        events: events.clone(),
        choker: Some(running.choker.clone()),
    };
    downloader.download(&job.digest, &sources, cancel).await?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MemoryMeshHub;
    use crate::store::digest::bytes_digest;
    use std::time::Duration;

    /// Test configuration: loopback-friendly, fast sync, no router
    /// protocols, isolated registry.
    fn test_config(dig_dir: &std::path::Path, registry_dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            port: 0,
            dig_directory: dig_dir.to_path_buf(),
            namespace: "testnet".into(),
            sync_interval_ms: 300,
            stun_servers: vec![],
            enable_webrtc: false,
            enable_upnp: false,
            enable_natpmp: false,
            allow_private_addresses: true,
            allow_loopback_addresses: true,
            registry_dir: Some(registry_dir.to_path_buf()),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            ..Default::default()
        }
    }

    async fn wait_for<F>(what: &str, timeout: Duration, mut check: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while !check() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_two_node_sync() {
        let hub = MemoryMeshHub::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let reg_a = tempfile::tempdir().unwrap();
        let reg_b = tempfile::tempdir().unwrap();

        // Node A holds one 17-byte blob; B starts empty.
        let payload = b"seventeen bytes!!";
        let digest = bytes_digest(payload);
        std::fs::write(dir_a.path().join(format!("{digest}.dig")), payload).unwrap();

        let node_a = Node::new(test_config(dir_a.path(), reg_a.path())).unwrap();
        let node_b = Node::new(test_config(dir_b.path(), reg_b.path())).unwrap();

        node_a
            .start_with_mesh(Some(Arc::new(hub.handle())))
            .await
            .unwrap();
        node_b
            .start_with_mesh(Some(Arc::new(hub.handle())))
            .await
            .unwrap();

        // After a sync interval or two, B holds a byte-identical blob.
        let expected = dir_b.path().join(format!("{digest}.dig"));
        wait_for("two-node sync", Duration::from_secs(30), || expected.exists()).await;
        assert_eq!(std::fs::read(&expected).unwrap(), payload);
        assert_eq!(bytes_digest(&std::fs::read(&expected).unwrap()), digest);

        // B remembers which transport reached A.
        let status = node_b.status().await;
        assert!(status.open_connections >= 1);

        node_a.stop().await.unwrap();
        node_b.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lifecycle_idempotence() {
        let hub = MemoryMeshHub::new();
        let dir = tempfile::tempdir().unwrap();
        let reg = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path(), reg.path())).unwrap();

        assert_eq!(node.state(), NodeState::New);
        node.start_with_mesh(Some(Arc::new(hub.handle())))
            .await
            .unwrap();
        assert_eq!(node.state(), NodeState::Running);

        // Start on running fails with already-running.
        let err = node
            .start_with_mesh(Some(Arc::new(hub.handle())))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "already-running");

        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        // Stop on stopped is a no-op.
        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_construction() {
        let config = NodeConfig { chunk_size: 0, ..Default::default() };
        assert!(Node::new(config).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_snapshot() {
        let hub = MemoryMeshHub::new();
        let dir = tempfile::tempdir().unwrap();
        let reg = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.dig"), b"held content").unwrap();

        let node = Node::new(test_config(dir.path(), reg.path())).unwrap();
        node.start_with_mesh(Some(Arc::new(hub.handle())))
            .await
            .unwrap();

        let status = node.status().await;
        assert_eq!(status.state, NodeState::Running);
        assert_eq!(status.node_id, node.id());
        assert_eq!(status.held_digests, 1);
        assert_eq!(status.live_peers, 0);
        assert!(status.tcp_port.is_some());
        assert!(status.udp_port.is_some());
        assert!(status.port_mapping.is_none());

        node.stop().await.unwrap();
        let status = node.status().await;
        assert_eq!(status.state, NodeState::Stopped);
        assert!(status.tcp_port.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_releases_listen_sockets() {
        let hub = MemoryMeshHub::new();
        let dir = tempfile::tempdir().unwrap();
        let reg = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path(), reg.path())).unwrap();
        node.start_with_mesh(Some(Arc::new(hub.handle())))
            .await
            .unwrap();

        let port = node.status().await.tcp_port.unwrap();
        // Listener answers while running.
        assert!(
            tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok(),
            "listener should accept while running"
        );

        node.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(
            tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err(),
            "no socket may stay in LISTEN after stop"
        );
    }

    #[test]
    fn test_strike_ledger_threshold() {
        let ledger = StrikeLedger::new(3, 10 * 60 * 1000);
        let peer = NodeId::random();
        assert!(!ledger.strike(peer));
        assert!(!ledger.strike(peer));
        // Third strike inside the window crosses the threshold.
        assert!(ledger.strike(peer));
    }

    #[test]
    fn test_strike_ledger_window_expiry() {
        let ledger = StrikeLedger::new(2, 50);
        let peer = NodeId::random();
        assert!(!ledger.strike(peer));
        std::thread::sleep(std::time::Duration::from_millis(80));
        // The first strike has aged out of the window.
        assert!(!ledger.strike(peer));
    }
}
