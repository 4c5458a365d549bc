//! Network service.
//!
//! Owns the transport, the peer registry and the protocol subsystems, and
//! drives them from a single event loop:
//! - peer events (messages, handshake completion, disconnects)
//! - connect completions and accepted inbound connections
//! - commands from the rest of the node
//! - timers for outbound connection attempts, feelers, maintenance and
//!   announcement flushing

use crate::addrman::AddressSource;
use crate::anchors::{self, ANCHORS_FILE_NAME};
use crate::ban::BanStore;
use crate::chain::{ChainState, HeaderSync};
use crate::discovery::PeerDiscovery;
use crate::dispatch::{DispatchOutcome, MessageHandlerRegistry};
use crate::manager::{PeerCounts, PeerManager, PeerManagerConfig};
use crate::message::Message;
use crate::notifications::{NetworkNotification, NetworkNotifications};
use crate::peer::{ConnectionType, Peer, PeerConfig, PeerEvent, PeerId, PeerInfo, Permissions};
use crate::protocol::{unix_time, BlockHash, NetworkType};
use crate::relay::{BlockRelay, BlockRelayConfig};
use crate::timedata::TimeData;
use crate::transport::{ConnectionRef, Transport};
use crate::{NetworkError, NetworkResult};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

/// Outbound connection attempts are made this often.
pub const CONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Periodic housekeeping: removals, ban sweep, tip announcement.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Queued block announcements are flushed this often.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Mean of the exponentially distributed delay between feelers.
pub const FEELER_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Address selections tried per connect cycle.
pub const MAX_CONNECTION_ATTEMPTS_PER_CYCLE: usize = 100;

/// Network service configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: NetworkType,
    pub listen: bool,
    pub listen_port: u16,
    /// Peers connected to manually at start.
    pub connect: Vec<SocketAddr>,
    /// Directory for the anchors file. `None` disables anchors.
    pub data_dir: Option<PathBuf>,
    pub enable_feelers: bool,
    pub connect_interval: Duration,
    pub maintenance_interval: Duration,
    pub flush_interval: Duration,
    pub feeler_interval: Duration,
    pub peer: PeerConfig,
    pub manager: PeerManagerConfig,
    pub relay: BlockRelayConfig,
}

impl NetworkConfig {
    /// Defaults for `network`: magic and port follow the network.
    pub fn for_network(network: NetworkType) -> Self {
        let peer = PeerConfig {
            magic: network.magic(),
            ..PeerConfig::default()
        };
        Self {
            network,
            listen: true,
            listen_port: network.default_port(),
            connect: Vec::new(),
            data_dir: None,
            enable_feelers: true,
            connect_interval: CONNECT_INTERVAL,
            maintenance_interval: MAINTENANCE_INTERVAL,
            flush_interval: FLUSH_INTERVAL,
            feeler_interval: FEELER_INTERVAL,
            peer,
            manager: PeerManagerConfig::default(),
            relay: BlockRelayConfig::default(),
        }
    }

    fn anchors_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(ANCHORS_FILE_NAME))
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::for_network(NetworkType::Mainnet)
    }
}

/// Commands accepted by the service loop.
#[derive(Debug)]
pub enum NetworkCommand {
    /// Open a manual connection.
    Connect { addr: SocketAddr },
    Disconnect { peer: PeerId },
    /// Queue the current tip for every ready peer.
    AnnounceTip,
    /// Announce a freshly accepted block immediately.
    RelayBlock { hash: BlockHash },
    Shutdown,
}

/// Work posted to the loop by transport callbacks.
enum ServiceEvent {
    ConnectComplete { peer: PeerId, success: bool },
    Inbound(ConnectionRef),
}

/// Snapshot returned by [`NetworkService::stats`].
#[derive(Debug, Clone)]
pub struct NetworkStats {
    pub counts: PeerCounts,
    pub peers: Vec<PeerInfo>,
    pub known_addresses: usize,
    pub time_offset: i64,
}

/// The P2P connection orchestrator.
pub struct NetworkService {
    config: NetworkConfig,
    peer_config: Arc<PeerConfig>,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerManager>,
    addresses: Arc<dyn AddressSource>,
    chain: Arc<dyn ChainState>,
    relay: BlockRelay,
    discovery: PeerDiscovery,
    header_sync: RwLock<Option<Arc<dyn HeaderSync>>>,
    notifications: Arc<NetworkNotifications>,
    registry: MessageHandlerRegistry,
    time_data: TimeData,
    pending_anchors: Mutex<Vec<SocketAddr>>,
    /// Outbound ids between `allocate_id` and registration, with any
    /// completion that arrived early.
    pending_connects: Mutex<HashMap<PeerId, Option<bool>>>,
    running: AtomicBool,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    event_tx: mpsc::UnboundedSender<ServiceEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ServiceEvent>>>,
    command_tx: mpsc::Sender<NetworkCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<NetworkCommand>>>,
}

impl NetworkService {
    pub fn new(
        config: NetworkConfig,
        transport: Arc<dyn Transport>,
        addresses: Arc<dyn AddressSource>,
        bans: Arc<dyn BanStore>,
        chain: Arc<dyn ChainState>,
    ) -> Arc<Self> {
        let notifications = NetworkNotifications::new();
        let peers = Arc::new(PeerManager::new(
            config.manager.clone(),
            bans,
            Arc::clone(&notifications),
        ));
        let relay = BlockRelay::new(config.relay.clone(), Arc::clone(&peers), Arc::clone(&chain));
        let discovery =
            PeerDiscovery::new(config.network, Arc::clone(&peers), Arc::clone(&addresses));
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(100);

        Arc::new(Self {
            peer_config: Arc::new(config.peer.clone()),
            config,
            transport,
            peers,
            addresses,
            chain,
            relay,
            discovery,
            header_sync: RwLock::new(None),
            notifications,
            registry: MessageHandlerRegistry::new(),
            time_data: TimeData::new(),
            pending_anchors: Mutex::new(Vec::new()),
            pending_connects: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            peer_tx,
            peer_rx: Mutex::new(Some(peer_rx)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn relay(&self) -> &BlockRelay {
        &self.relay
    }

    pub fn registry(&self) -> &MessageHandlerRegistry {
        &self.registry
    }

    pub fn notifications(&self) -> &Arc<NetworkNotifications> {
        &self.notifications
    }

    pub fn time_data(&self) -> &TimeData {
        &self.time_data
    }

    pub fn command_sender(&self) -> mpsc::Sender<NetworkCommand> {
        self.command_tx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_header_sync(&self, sync: Arc<dyn HeaderSync>) {
        *self.header_sync.write() = Some(sync);
    }

    fn header_sync(&self) -> Option<Arc<dyn HeaderSync>> {
        self.header_sync.read().clone()
    }

    /// Listen, load anchors, seed the address source and dial manual peers.
    pub async fn start(&self) -> NetworkResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.config.listen {
            let tx = self.event_tx.clone();
            let listening = self.transport.listen(
                self.config.listen_port,
                Arc::new(move |conn| {
                    let _ = tx.send(ServiceEvent::Inbound(conn));
                }),
            );
            if !listening {
                self.running.store(false, Ordering::SeqCst);
                return Err(NetworkError::ConnectionFailed(format!(
                    "cannot listen on port {}",
                    self.config.listen_port
                )));
            }
            info!(port = self.config.listen_port, network = %self.config.network, "Listening for peers");
        }

        if let Some(path) = self.config.anchors_path() {
            let anchors: Vec<SocketAddr> = anchors::load_anchors(&path)
                .iter()
                .map(|a| a.socket_addr())
                .collect();
            if !anchors.is_empty() {
                info!(count = anchors.len(), "Reconnecting to anchors");
            }
            *self.pending_anchors.lock() = anchors;
        }

        self.discovery.bootstrap().await;

        for addr in self.config.connect.clone() {
            if let Err(e) = self.connect_to(addr, ConnectionType::Manual) {
                warn!(addr = %addr, error = %e, "Manual connection failed");
            }
        }
        Ok(())
    }

    /// Save anchors, drop every peer and stop the transport. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(path) = self.config.anchors_path() {
            let anchors = anchors::select_anchors(&self.peers);
            if let Err(e) = anchors::save_anchors(&path, &anchors) {
                warn!(error = %e, "Failed to save anchors");
            }
        }
        self.peers.disconnect_all();
        self.transport.stop();
        info!("Network service stopped");
    }

    /// Run the event loop until shutdown.
    pub async fn run(self: Arc<Self>) -> NetworkResult<()> {
        let (mut peer_rx, mut event_rx, mut command_rx) = match (
            self.peer_rx.lock().take(),
            self.event_rx.lock().take(),
            self.command_rx.lock().take(),
        ) {
            (Some(p), Some(e), Some(c)) => (p, e, c),
            _ => return Err(NetworkError::NotRunning),
        };
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }

        let mut connect = interval(self.config.connect_interval);
        let mut maintenance = interval(self.config.maintenance_interval);
        let mut flush = interval(self.config.flush_interval);
        for timer in [&mut connect, &mut maintenance, &mut flush] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        let feeler = sleep(next_feeler_delay(self.config.feeler_interval));
        tokio::pin!(feeler);

        info!("Network service running");
        loop {
            tokio::select! {
                Some(event) = peer_rx.recv() => self.handle_peer_event(event),
                Some(event) = event_rx.recv() => self.handle_service_event(event),
                Some(command) = command_rx.recv() => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                _ = connect.tick() => {
                    self.attempt_outbound_connections();
                }
                _ = maintenance.tick() => self.run_maintenance(),
                _ = flush.tick() => {
                    self.relay.flush();
                }
                _ = &mut feeler => {
                    self.attempt_feeler_connection();
                    feeler
                        .as_mut()
                        .reset(Instant::now() + next_feeler_delay(self.config.feeler_interval));
                }
            }
            if !self.is_running() {
                break;
            }
        }

        self.stop();
        Ok(())
    }

    /// Drain queued events without waiting. Used when the loop is not running.
    pub fn process_pending_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            let service = self
                .event_rx
                .lock()
                .as_mut()
                .and_then(|rx| rx.try_recv().ok());
            if let Some(event) = service {
                self.handle_service_event(event);
                progressed = true;
            }
            let peer = self
                .peer_rx
                .lock()
                .as_mut()
                .and_then(|rx| rx.try_recv().ok());
            if let Some(event) = peer {
                self.handle_peer_event(event);
                progressed = true;
            }
            let command = self
                .command_rx
                .lock()
                .as_mut()
                .and_then(|rx| rx.try_recv().ok());
            if let Some(command) = command {
                self.handle_command(command);
                progressed = true;
            }
            if !progressed {
                return handled;
            }
            handled += 1;
        }
    }

    fn handle_service_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ConnectComplete { peer, success } => self.on_connect_complete(peer, success),
            ServiceEvent::Inbound(conn) => self.handle_inbound_connection(conn),
        }
    }

    /// Returns `false` once the loop should exit.
    fn handle_command(&self, command: NetworkCommand) -> bool {
        match command {
            NetworkCommand::Connect { addr } => {
                if let Err(e) = self.connect_to(addr, ConnectionType::Manual) {
                    warn!(addr = %addr, error = %e, "Manual connection failed");
                }
            }
            NetworkCommand::Disconnect { peer } => self.remove_peer(peer),
            NetworkCommand::AnnounceTip => {
                self.relay.announce_tip_to_all();
            }
            NetworkCommand::RelayBlock { hash } => {
                self.relay.relay_now(hash);
            }
            NetworkCommand::Shutdown => {
                info!("Network service shutting down");
                self.stop();
                return false;
            }
        }
        true
    }

    /// Begin an outbound connection of `kind` to `addr`.
    ///
    /// The peer is registered in `Connecting` state right away; the transport's
    /// completion is handled on the event loop.
    #[instrument(skip(self))]
    pub fn connect_to(&self, addr: SocketAddr, kind: ConnectionType) -> NetworkResult<PeerId> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        if self.peers.is_refused(&addr.ip()) {
            return Err(NetworkError::PeerBanned(addr.ip().to_string()));
        }
        if self.peers.find_peer_by_address(&addr).is_some() {
            return Err(NetworkError::AlreadyConnected(addr.to_string()));
        }
        if kind == ConnectionType::Outbound && !self.peers.needs_more_outbound() {
            return Err(NetworkError::TooManyConnections {
                count: self.peers.outbound_count(),
                max: self.peers.config().max_outbound,
            });
        }

        self.addresses.mark_attempt(&addr);
        let id = self.peers.allocate_id();
        self.pending_connects.lock().insert(id, None);
        let tx = self.event_tx.clone();
        let conn = self.transport.connect(
            addr,
            Box::new(move |success| {
                let _ = tx.send(ServiceEvent::ConnectComplete { peer: id, success });
            }),
        );
        let Some(conn) = conn else {
            self.pending_connects.lock().remove(&id);
            self.addresses.mark_failed(&addr);
            return Err(NetworkError::ConnectionFailed(addr.to_string()));
        };

        let permissions = match kind {
            ConnectionType::Manual => Permissions::MANUAL,
            _ => Permissions::NONE,
        };
        let peer = Peer::new(
            id,
            Arc::clone(&conn),
            kind,
            permissions,
            Arc::clone(&self.peer_config),
            self.chain.current_height(),
            self.peer_tx.clone(),
        );
        let admitted = self.peers.add_peer(peer);
        let early = self.pending_connects.lock().remove(&id).flatten();
        if let Err(e) = admitted {
            conn.close();
            return Err(e);
        }
        debug!(peer = %id, addr = %addr, kind = %kind, "Connecting");
        if let Some(success) = early {
            trace!(peer = %id, success, "Replaying early connect completion");
            let _ = self
                .event_tx
                .send(ServiceEvent::ConnectComplete { peer: id, success });
        }
        Ok(id)
    }

    pub fn connect_manual(&self, addr: SocketAddr) -> NetworkResult<PeerId> {
        self.connect_to(addr, ConnectionType::Manual)
    }

    /// Resolve a pending outbound connection.
    ///
    /// A completion that overtakes registration is parked and replayed by
    /// [`connect_to`](Self::connect_to).
    pub fn on_connect_complete(&self, id: PeerId, success: bool) {
        if let Some(slot) = self.pending_connects.lock().get_mut(&id) {
            *slot = Some(success);
            return;
        }
        let Some(peer) = self.peers.get_peer(id) else {
            return;
        };
        let addr = peer.addr();
        if success && self.is_running() {
            self.addresses.mark_good(&addr);
            if !peer.start() {
                self.remove_peer(id);
            }
        } else {
            debug!(peer = %id, addr = %addr, "Connection attempt failed");
            self.addresses.mark_failed(&addr);
            self.remove_peer(id);
        }
    }

    /// Fill free outbound slots: pending anchors first, then the address source.
    pub fn attempt_outbound_connections(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        let mut started = 0;

        let anchors = std::mem::take(&mut *self.pending_anchors.lock());
        for addr in anchors {
            if !self.peers.needs_more_outbound() {
                break;
            }
            if self.connect_to(addr, ConnectionType::Outbound).is_ok() {
                started += 1;
            }
        }

        let mut attempts = 0;
        while self.peers.needs_more_outbound() && attempts < MAX_CONNECTION_ATTEMPTS_PER_CYCLE {
            attempts += 1;
            let Some(addr) = self.addresses.select() else {
                break;
            };
            match self.connect_to(addr, ConnectionType::Outbound) {
                Ok(_) => started += 1,
                Err(e) => trace!(addr = %addr, error = %e, "Skipping candidate"),
            }
        }
        if started > 0 {
            debug!(started, outbound = self.peers.outbound_count(), "Outbound connection attempts");
        }
        started
    }

    /// Probe one address from the "new" pool. One feeler at a time.
    pub fn attempt_feeler_connection(&self) -> bool {
        if !self.is_running() || !self.config.enable_feelers {
            return false;
        }
        if self.peers.counts().feeler > 0 {
            return false;
        }
        let Some(addr) = self.addresses.select_feeler_candidate() else {
            return false;
        };
        match self.connect_to(addr, ConnectionType::Feeler) {
            Ok(id) => {
                debug!(peer = %id, addr = %addr, "Feeler connection");
                true
            }
            Err(e) => {
                trace!(addr = %addr, error = %e, "Feeler skipped");
                false
            }
        }
    }

    /// Admit an accepted connection.
    pub fn handle_inbound_connection(&self, conn: ConnectionRef) {
        let addr = conn.remote_addr();
        if !self.is_running() {
            conn.close();
            return;
        }
        let id = self.peers.allocate_id();
        let peer = Peer::new(
            id,
            Arc::clone(&conn),
            ConnectionType::Inbound,
            Permissions::NONE,
            Arc::clone(&self.peer_config),
            self.chain.current_height(),
            self.peer_tx.clone(),
        );
        let manager: Weak<PeerManager> = Arc::downgrade(&self.peers);
        peer.set_self_connection_guard(Arc::new(move |nonce| {
            manager
                .upgrade()
                .map_or(false, |m| m.check_incoming_nonce(nonce))
        }));

        match self.peers.add_peer(Arc::clone(&peer)) {
            Ok(()) => {
                debug!(peer = %id, addr = %addr, "Accepted inbound connection");
                peer.start();
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "Rejected inbound connection");
                conn.close();
            }
        }
    }

    pub fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Message { peer, message } => self.route_message(peer, message),
            PeerEvent::Ready { peer } => self.on_peer_ready(peer),
            PeerEvent::TimeSample { addr, offset, .. } => {
                self.time_data.add_sample(addr.ip(), offset)
            }
            PeerEvent::Disconnected { peer } => self.remove_peer(peer),
        }
    }

    fn on_peer_ready(&self, id: PeerId) {
        let Some(peer) = self.peers.get_peer(id) else {
            return;
        };
        let addr = peer.addr();
        if !peer.is_inbound() {
            self.addresses.add(addr, unix_time() as u32);
            self.addresses.mark_good(&addr);
            self.discovery.request_addresses(id);
        }
        self.relay.announce_tip_to_one(id);
        info!(
            peer = %id,
            addr = %addr,
            kind = %peer.connection_type(),
            agent = %peer.user_agent(),
            height = peer.start_height(),
            "Peer ready"
        );
        self.notifications.notify(NetworkNotification::PeerConnected {
            peer: id,
            addr,
            connection_type: peer.connection_type(),
        });
        self.check_initial_sync();
    }

    /// During initial download, pick an outbound sync peer if none is set.
    fn check_initial_sync(&self) {
        let Some(sync) = self.header_sync() else {
            return;
        };
        if sync.has_sync_peer() || !self.chain.is_initial_block_download() {
            return;
        }
        let candidate = self
            .peers
            .ready_peers()
            .into_iter()
            .find(|p| !p.is_inbound() && !p.is_feeler());
        if let Some(peer) = candidate {
            info!(peer = %peer.id(), "Selected sync peer");
            sync.set_sync_peer(peer.id());
            sync.request_headers(peer.id());
        }
    }

    fn route_message(&self, id: PeerId, message: Message) {
        let Some(peer) = self.peers.get_peer(id) else {
            return;
        };
        if !peer.is_ready() {
            debug!(peer = %id, command = message.command(), "Ignoring message before verack");
            return;
        }
        match message {
            Message::Inv(items) => {
                if let Some(sync) = self.header_sync() {
                    self.relay.handle_inventory(id, &items, sync.as_ref());
                }
            }
            Message::Headers(payload) => {
                if let Some(sync) = self.header_sync() {
                    sync.handle_headers(id, payload);
                }
            }
            Message::GetHeaders(request) => {
                if let Some(sync) = self.header_sync() {
                    sync.handle_getheaders(id, request);
                }
            }
            Message::Addr(addrs) => {
                self.discovery.handle_addr(id, addrs);
            }
            Message::GetAddr => {
                self.discovery.handle_getaddr(id);
            }
            Message::Unknown { command, payload } => {
                match self.registry.dispatch(id, &command, &payload) {
                    DispatchOutcome::Handled => {}
                    DispatchOutcome::Unhandled => {
                        trace!(peer = %id, command = %command, "No handler for command")
                    }
                    DispatchOutcome::Rejected => {
                        debug!(peer = %id, command = %command, "Handler rejected message");
                        self.remove_peer(id);
                    }
                }
            }
            other => trace!(peer = %id, command = other.command(), "Ignoring message"),
        }
    }

    /// Remove `id` and purge its state from relay and sync.
    pub fn remove_peer(&self, id: PeerId) {
        if let Some(removed) = self.peers.remove_peer(id) {
            if removed.mark_good {
                self.addresses.mark_good(&removed.peer.addr());
            }
        }
        self.relay.on_peer_disconnected(id);
        if let Some(sync) = self.header_sync() {
            sync.on_peer_disconnected(id);
        }
    }

    /// Periodic housekeeping.
    pub fn run_maintenance(&self) {
        for id in self.peers.collect_for_removal() {
            self.remove_peer(id);
        }
        self.peers.bans().sweep();
        self.relay.prune_inflight();
        self.relay.announce_tip_to_all();
        self.check_initial_sync();
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            counts: self.peers.counts(),
            peers: self.peers.peer_infos(),
            known_addresses: self.addresses.size(),
            time_offset: self.time_data.offset(),
        }
    }
}

/// Exponentially distributed delay with the given mean.
fn next_feeler_delay(mean: Duration) -> Duration {
    let u: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
    mean.mul_f64(-u.ln())
}
