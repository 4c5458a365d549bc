//! Test harness for integration tests.
//!
//! Runs complete network services over a shared [`MemoryNetwork`], plus a
//! hand-driven raw peer for feeding a node exactly the bytes a test wants.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use unicity_network::codec;
use unicity_network::protocol::unix_time;
use unicity_network::{
    AddressBook, BanList, BlockHash, ChainState, Connection, ConnectionRef, GetHeadersMessage,
    HeaderSync, MemoryConnection, MemoryNetwork, MemoryTransport, Message, NetworkAddress,
    NetworkConfig, NetworkResult, NetworkService, NetworkType, PeerId, Transport, VersionMessage,
    PROTOCOL_VERSION,
};

/// How long scenario assertions wait before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `future`, failing the test if it takes longer than [`WAIT_TIMEOUT`].
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(WAIT_TIMEOUT, future).await {
        Ok(value) => value,
        Err(_) => panic!("timed out after {:?}", WAIT_TIMEOUT),
    }
}

/// Address `10.0.0.<host>` on the regtest port.
pub fn test_addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, host], NetworkType::Regtest.default_port()))
}

/// Mutable in-memory chain.
pub struct TestChain {
    tip: RwLock<(i32, BlockHash)>,
    known: RwLock<HashSet<BlockHash>>,
    ibd: RwLock<bool>,
}

impl TestChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tip: RwLock::new((0, BlockHash::ZERO)),
            known: RwLock::new(HashSet::from([BlockHash::ZERO])),
            ibd: RwLock::new(false),
        })
    }

    /// Move the tip and remember the hash as known.
    pub fn set_tip(&self, height: i32, hash: BlockHash) {
        *self.tip.write() = (height, hash);
        self.known.write().insert(hash);
    }

    pub fn set_initial_block_download(&self, ibd: bool) {
        *self.ibd.write() = ibd;
    }
}

impl ChainState for TestChain {
    fn current_height(&self) -> i32 {
        self.tip.read().0
    }

    fn tip_hash(&self) -> BlockHash {
        self.tip.read().1
    }

    fn has_block(&self, hash: &BlockHash) -> bool {
        self.known.read().contains(hash)
    }

    fn is_initial_block_download(&self) -> bool {
        *self.ibd.read()
    }
}

/// [`HeaderSync`] that only records what the engine asks of it.
#[derive(Default)]
pub struct RecordingSync {
    sync_peer: RwLock<Option<PeerId>>,
    requests: Mutex<Vec<PeerId>>,
    headers: Mutex<Vec<(PeerId, Bytes)>>,
    getheaders: Mutex<Vec<PeerId>>,
    disconnected: Mutex<Vec<PeerId>>,
}

impl RecordingSync {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<PeerId> {
        self.requests.lock().clone()
    }

    pub fn headers(&self) -> Vec<(PeerId, Bytes)> {
        self.headers.lock().clone()
    }

    pub fn getheaders(&self) -> Vec<PeerId> {
        self.getheaders.lock().clone()
    }

    pub fn disconnected(&self) -> Vec<PeerId> {
        self.disconnected.lock().clone()
    }
}

impl HeaderSync for RecordingSync {
    fn request_headers(&self, peer: PeerId) {
        self.requests.lock().push(peer);
    }

    fn has_sync_peer(&self) -> bool {
        self.sync_peer.read().is_some()
    }

    fn set_sync_peer(&self, peer: PeerId) {
        *self.sync_peer.write() = Some(peer);
    }

    fn sync_peer_id(&self) -> Option<PeerId> {
        *self.sync_peer.read()
    }

    fn handle_headers(&self, peer: PeerId, payload: Bytes) {
        self.headers.lock().push((peer, payload));
    }

    fn handle_getheaders(&self, peer: PeerId, _request: GetHeadersMessage) {
        self.getheaders.lock().push(peer);
    }

    fn on_peer_disconnected(&self, peer: PeerId) {
        let mut sync_peer = self.sync_peer.write();
        if *sync_peer == Some(peer) {
            *sync_peer = None;
        }
        self.disconnected.lock().push(peer);
    }
}

/// Regtest service configuration with fast timers.
pub fn fast_config(data_dir: Option<&Path>) -> NetworkConfig {
    NetworkConfig {
        data_dir: data_dir.map(Path::to_path_buf),
        enable_feelers: false,
        connect_interval: Duration::from_millis(50),
        flush_interval: Duration::from_millis(20),
        ..NetworkConfig::for_network(NetworkType::Regtest)
    }
}

/// A network service running its event loop over a linked memory transport.
pub struct TestNode {
    pub addr: SocketAddr,
    pub service: Arc<NetworkService>,
    pub transport: Arc<MemoryTransport>,
    pub chain: Arc<TestChain>,
    pub sync: Arc<RecordingSync>,
    pub addresses: Arc<AddressBook>,
    pub bans: Arc<BanList>,
    task: Option<JoinHandle<NetworkResult<()>>>,
}

impl TestNode {
    /// Start a node listening at `addr`.
    pub async fn start(network: &Arc<MemoryNetwork>, addr: SocketAddr) -> Self {
        Self::start_with_config(network, addr, fast_config(None)).await
    }

    pub async fn start_with_config(
        network: &Arc<MemoryNetwork>,
        addr: SocketAddr,
        config: NetworkConfig,
    ) -> Self {
        let transport = network.transport(addr);
        let chain = TestChain::new();
        let sync = RecordingSync::new();
        let addresses = Arc::new(AddressBook::new());
        let bans = Arc::new(BanList::new());
        let service = NetworkService::new(
            config,
            transport.clone(),
            addresses.clone(),
            bans.clone(),
            chain.clone(),
        );
        service.set_header_sync(sync.clone());
        service.start().await.expect("service starts");
        let task = tokio::spawn(Arc::clone(&service).run());
        Self {
            addr,
            service,
            transport,
            chain,
            sync,
            addresses,
            bans,
            task: Some(task),
        }
    }

    /// Number of peers that completed the handshake.
    pub fn ready_count(&self) -> usize {
        self.service.peer_manager().ready_peers().len()
    }

    pub fn peer_count(&self) -> usize {
        self.service.peer_manager().peer_count()
    }

    /// Id of the peer connected from or to `addr`.
    pub fn peer_at(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.service.peer_manager().find_peer_by_address(addr)
    }

    /// Stop the service and wait for its loop to exit.
    pub async fn stop(mut self) {
        self.service.stop();
        if let Some(task) = self.task.take() {
            let _ = within(task).await;
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.service.stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A bare connection driven message by message from the test.
pub struct RawPeer {
    pub transport: Arc<MemoryTransport>,
    pub conn: ConnectionRef,
    magic: u32,
}

impl RawPeer {
    /// Connect from `local` to a node at `remote`.
    ///
    /// Returns `None` if the remote did not accept.
    pub async fn connect(
        network: &Arc<MemoryNetwork>,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Option<Self> {
        let transport = network.transport(local);
        let (tx, rx) = oneshot::channel();
        let conn = transport.connect(
            remote,
            Box::new(move |ok| {
                let _ = tx.send(ok);
            }),
        )?;
        if !within(rx).await.unwrap_or(false) {
            return None;
        }
        conn.start();
        Some(Self {
            transport,
            conn,
            magic: NetworkType::Regtest.magic(),
        })
    }

    pub fn send(&self, message: &Message) -> bool {
        match codec::encode_message(self.magic, message) {
            Ok(frame) => self.conn.send(frame),
            Err(_) => false,
        }
    }

    /// Send VERSION then VERACK, as an outbound peer would.
    pub fn handshake(&self) {
        let version = Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: 1,
            timestamp: unix_time(),
            addr_recv: NetworkAddress::unspecified(),
            addr_from: NetworkAddress::unspecified(),
            nonce: rand::random(),
            user_agent: "/raw-peer:0.1/".to_string(),
            start_height: 0,
        });
        self.send(&version);
        self.send(&Message::Verack);
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// What the node sent back, as seen from the node's side of the link.
    pub fn received(&self, node: &TestNode) -> Vec<Message> {
        node_side(node, self.transport.local_addr())
            .map(|c| c.sent_messages(self.magic))
            .unwrap_or_default()
    }
}

fn node_side(node: &TestNode, remote: SocketAddr) -> Option<Arc<MemoryConnection>> {
    node.transport.connection_to(&remote)
}
