//! Per-connection protocol state machine.
//!
//! A [`Peer`] owns one transport connection. It frames the inbound byte stream,
//! runs the version/verack handshake, keeps the link alive with pings, and
//! forwards everything else to the service loop as [`PeerEvent`]s.
//!
//! Lifecycle:
//!
//! ```text
//! Connecting -> Connected -> VersionSent -> Ready -> Disconnecting -> Disconnected
//! ```
//!
//! Inbound peers start at `Connected`. `Disconnected` is terminal and reachable
//! from every state.

use crate::codec::{self, MessageHeader};
use crate::message::{Message, VersionMessage};
use crate::protocol::{
    unix_time, NetworkAddress, DEFAULT_RECV_FLOOD_SIZE, INACTIVITY_CHECK_INTERVAL,
    INACTIVITY_TIMEOUT, MAX_PROTOCOL_MESSAGE_LENGTH, MESSAGE_HEADER_SIZE, MIN_PROTOCOL_VERSION,
    NODE_NETWORK, PING_INTERVAL, PING_TIMEOUT, PROTOCOL_VERSION, VERSION_HANDSHAKE_TIMEOUT,
};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::transport::ConnectionRef;

/// Peer identifier, unique for the lifetime of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the connection came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Inbound,
    Outbound,
    /// Operator-requested; exempt from the outbound target.
    Manual,
    /// Short-lived probe of an address; disconnects after the handshake.
    Feeler,
}

impl ConnectionType {
    pub fn is_inbound(&self) -> bool {
        matches!(self, ConnectionType::Inbound)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Inbound => "inbound",
            ConnectionType::Outbound => "outbound",
            ConnectionType::Manual => "manual",
            ConnectionType::Feeler => "feeler",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    /// Outbound transport connect in progress.
    Connecting,
    Connected,
    VersionSent,
    /// Handshake complete.
    Ready,
    Disconnecting,
}

/// Permission flags granted to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    /// Never discouraged, exempt from ban checks.
    pub const NO_BAN: Permissions = Permissions(1);
    /// Manually added connection.
    pub const MANUAL: Permissions = Permissions(1 << 1);

    pub fn contains(&self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn has_no_ban(&self) -> bool {
        self.contains(Permissions::NO_BAN)
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

/// Per-peer protocol settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub magic: u32,
    pub protocol_version: i32,
    pub min_protocol_version: i32,
    pub services: u64,
    pub user_agent: String,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub inactivity_check_interval: Duration,
    /// Receive buffer bound; exceeding it disconnects.
    pub recv_flood_size: usize,
    pub max_message_length: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            magic: crate::protocol::NetworkType::Mainnet.magic(),
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            services: NODE_NETWORK,
            user_agent: crate::protocol::user_agent(),
            handshake_timeout: VERSION_HANDSHAKE_TIMEOUT,
            ping_interval: PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            inactivity_timeout: INACTIVITY_TIMEOUT,
            inactivity_check_interval: INACTIVITY_CHECK_INTERVAL,
            recv_flood_size: DEFAULT_RECV_FLOOD_SIZE,
            max_message_length: MAX_PROTOCOL_MESSAGE_LENGTH,
        }
    }
}

/// Events a peer posts to the service loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// A message the peer does not handle itself.
    Message { peer: PeerId, message: Message },
    /// VERACK received; the peer is `Ready`.
    Ready { peer: PeerId },
    /// Clock offset reported by an outbound peer's VERSION.
    TimeSample {
        peer: PeerId,
        addr: SocketAddr,
        offset: i64,
    },
    /// The peer has fully disconnected.
    Disconnected { peer: PeerId },
}

/// Returns `true` if an incoming VERSION nonce belongs to one of our own
/// outbound connections.
pub type SelfConnectionGuard = Arc<dyn Fn(u64) -> bool + Send + Sync>;

/// Traffic counters. Relaxed atomics; readers tolerate slight staleness.
#[derive(Debug)]
pub struct PeerStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Milliseconds after creation of the last send / receive.
    last_send_ms: AtomicU64,
    last_recv_ms: AtomicU64,
    /// Round-trip of the last answered ping, `-1` if unknown.
    ping_time_ms: AtomicI64,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_send_ms: AtomicU64::new(0),
            last_recv_ms: AtomicU64::new(0),
            ping_time_ms: AtomicI64::new(-1),
        }
    }
}

/// What the remote told us in its VERSION.
#[derive(Debug, Clone, Default)]
struct RemoteVersion {
    version: i32,
    services: u64,
    user_agent: String,
    start_height: i32,
    nonce: u64,
}

/// Receive buffer with a read offset. The consumed prefix is dropped once it
/// exceeds half the buffer.
#[derive(Default)]
struct RecvBuffer {
    data: BytesMut,
    offset: usize,
}

impl RecvBuffer {
    fn unread(&self) -> usize {
        self.data.len() - self.offset
    }

    fn compact(&mut self) {
        if self.offset == self.data.len() {
            self.data.clear();
            self.offset = 0;
        } else if self.offset > self.data.len() / 2 {
            let _ = self.data.split_to(self.offset);
            self.offset = 0;
        }
    }
}

/// Result of trying to cut one frame out of the receive buffer.
enum Frame {
    Complete(MessageHeader, Bytes),
    Incomplete,
    Invalid(String),
}

struct PeerInner {
    state: PeerState,
    started: bool,
    version_received: bool,
    verack_received: bool,
    successfully_connected: bool,
    remote: Option<RemoteVersion>,
    ping_nonce: Option<u64>,
    ping_sent_at: Option<Instant>,
    getaddr_sent: bool,
    getaddr_answered: bool,
}

#[derive(Clone, Copy)]
enum TimerSlot {
    Handshake,
    Ping,
    Inactivity,
}

#[derive(Default)]
struct PeerTimers {
    closed: bool,
    handshake: Option<JoinHandle<()>>,
    ping: Option<JoinHandle<()>>,
    inactivity: Option<JoinHandle<()>>,
}

impl PeerTimers {
    fn slot(&mut self, slot: TimerSlot) -> &mut Option<JoinHandle<()>> {
        match slot {
            TimerSlot::Handshake => &mut self.handshake,
            TimerSlot::Ping => &mut self.ping,
            TimerSlot::Inactivity => &mut self.inactivity,
        }
    }

    fn abort_all(&mut self) {
        for handle in [
            self.handshake.take(),
            self.ping.take(),
            self.inactivity.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// Point-in-time view of a peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub connection_type: ConnectionType,
    pub state: PeerState,
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub ping_time_ms: Option<u64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connected_for: Duration,
}

/// A single protocol connection.
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    connection_type: ConnectionType,
    permissions: Permissions,
    local_nonce: u64,
    local_height: i32,
    config: Arc<PeerConfig>,
    connection: ConnectionRef,
    events: mpsc::UnboundedSender<PeerEvent>,
    created_at: Instant,
    stats: PeerStats,
    inner: Mutex<PeerInner>,
    recv: Mutex<RecvBuffer>,
    timers: Mutex<PeerTimers>,
    self_connection_guard: Mutex<Option<SelfConnectionGuard>>,
    weak_self: Weak<Peer>,
}

impl Peer {
    /// Create a peer bound to `connection`.
    ///
    /// Outbound peers start in `Connecting` until the transport reports success;
    /// inbound peers start in `Connected`.
    pub fn new(
        id: PeerId,
        connection: ConnectionRef,
        connection_type: ConnectionType,
        permissions: Permissions,
        config: Arc<PeerConfig>,
        local_height: i32,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Arc<Self> {
        let state = if connection_type.is_inbound() {
            PeerState::Connected
        } else {
            PeerState::Connecting
        };
        Arc::new_cyclic(|weak| Self {
            id,
            addr: connection.remote_addr(),
            connection_type,
            permissions,
            local_nonce: rand::random(),
            local_height,
            config,
            connection,
            events,
            created_at: Instant::now(),
            stats: PeerStats::default(),
            inner: Mutex::new(PeerInner {
                state,
                started: false,
                version_received: false,
                verack_received: false,
                successfully_connected: false,
                remote: None,
                ping_nonce: None,
                ping_sent_at: None,
                getaddr_sent: false,
                getaddr_answered: false,
            }),
            recv: Mutex::new(RecvBuffer::default()),
            timers: Mutex::new(PeerTimers::default()),
            self_connection_guard: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn is_inbound(&self) -> bool {
        self.connection_type.is_inbound()
    }

    pub fn is_feeler(&self) -> bool {
        self.connection_type == ConnectionType::Feeler
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Nonce we put in our own VERSION.
    pub fn local_nonce(&self) -> u64 {
        self.local_nonce
    }

    pub fn state(&self) -> PeerState {
        self.inner.lock().state
    }

    /// Neither disconnecting nor disconnected.
    pub fn is_connected(&self) -> bool {
        !matches!(
            self.state(),
            PeerState::Disconnecting | PeerState::Disconnected
        )
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PeerState::Ready
    }

    /// Whether the handshake ever completed on this connection.
    pub fn successfully_connected(&self) -> bool {
        self.inner.lock().successfully_connected
    }

    pub fn version(&self) -> i32 {
        self.inner.lock().remote.as_ref().map_or(0, |r| r.version)
    }

    pub fn services(&self) -> u64 {
        self.inner.lock().remote.as_ref().map_or(0, |r| r.services)
    }

    pub fn user_agent(&self) -> String {
        self.inner
            .lock()
            .remote
            .as_ref()
            .map(|r| r.user_agent.clone())
            .unwrap_or_default()
    }

    pub fn start_height(&self) -> i32 {
        self.inner.lock().remote.as_ref().map_or(0, |r| r.start_height)
    }

    pub fn remote_nonce(&self) -> Option<u64> {
        self.inner.lock().remote.as_ref().map(|r| r.nonce)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// Last measured round trip in milliseconds.
    pub fn ping_time_ms(&self) -> Option<u64> {
        let ms = self.stats.ping_time_ms.load(Ordering::Relaxed);
        (ms >= 0).then_some(ms as u64)
    }

    /// Returns `true` the first time it is called.
    pub fn mark_getaddr_sent(&self) -> bool {
        !std::mem::replace(&mut self.inner.lock().getaddr_sent, true)
    }

    /// Returns `true` the first time it is called.
    pub fn mark_getaddr_answered(&self) -> bool {
        !std::mem::replace(&mut self.inner.lock().getaddr_answered, true)
    }

    pub fn set_self_connection_guard(&self, guard: SelfConnectionGuard) {
        *self.self_connection_guard.lock() = Some(guard);
    }

    pub fn info(&self) -> PeerInfo {
        let inner = self.inner.lock();
        let remote = inner.remote.clone().unwrap_or_default();
        PeerInfo {
            id: self.id,
            addr: self.addr,
            connection_type: self.connection_type,
            state: inner.state,
            version: remote.version,
            services: remote.services,
            user_agent: remote.user_agent,
            start_height: remote.start_height,
            ping_time_ms: self.ping_time_ms(),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            connected_for: self.created_at.elapsed(),
        }
    }

    /// Begin protocol processing.
    ///
    /// Valid once, from `Connecting` or `Connected`. Outbound peers send VERSION
    /// immediately. Returns `false` if the peer was not startable.
    pub fn start(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.started {
                return false;
            }
            match inner.state {
                PeerState::Connecting => inner.state = PeerState::Connected,
                PeerState::Connected => {}
                _ => return false,
            }
            inner.started = true;
        }

        let weak = self.weak_self.clone();
        self.connection.set_receive_callback(Arc::new(move |data: Bytes| {
            if let Some(peer) = weak.upgrade() {
                peer.on_data(data);
            }
        }));
        let weak = self.weak_self.clone();
        self.connection.set_disconnect_callback(Arc::new(move || {
            if let Some(peer) = weak.upgrade() {
                peer.disconnect("connection closed by remote");
            }
        }));

        self.arm_handshake_timer();
        debug!(peer = %self.id, addr = %self.addr, kind = %self.connection_type, "Starting peer");

        self.connection.start();
        if !self.is_inbound() {
            self.send_version();
        }
        true
    }

    /// Tear the connection down. Idempotent.
    pub fn disconnect(&self, reason: &str) {
        {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                PeerState::Disconnecting | PeerState::Disconnected
            ) {
                return;
            }
            inner.state = PeerState::Disconnecting;
        }
        debug!(peer = %self.id, addr = %self.addr, reason, "Disconnecting peer");

        {
            let mut timers = self.timers.lock();
            timers.closed = true;
            timers.abort_all();
        }
        self.connection.clear_callbacks();
        self.connection.close();

        self.inner.lock().state = PeerState::Disconnected;
        let _ = self.events.send(PeerEvent::Disconnected { peer: self.id });
    }

    /// Frame, encode and send `message`. A transport failure disconnects.
    pub fn send_message(&self, message: &Message) -> bool {
        if !self.is_connected() {
            return false;
        }
        let frame = match codec::encode_message(self.config.magic, message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %self.id, command = message.command(), error = %e, "Failed to encode message");
                return false;
            }
        };
        let len = frame.len() as u64;
        if !self.connection.send(frame) {
            self.disconnect("send failed");
            return false;
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        self.stats
            .last_send_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);
        trace!(peer = %self.id, command = message.command(), bytes = len, "Sent message");
        true
    }

    fn elapsed_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    fn send_version(&self) {
        let version = VersionMessage {
            version: self.config.protocol_version,
            services: self.config.services,
            timestamp: unix_time(),
            addr_recv: NetworkAddress::from_socket_addr(self.addr, 0),
            addr_from: NetworkAddress::unspecified(),
            nonce: self.local_nonce,
            user_agent: self.config.user_agent.clone(),
            start_height: self.local_height,
        };
        {
            let mut inner = self.inner.lock();
            if inner.state == PeerState::Connected {
                inner.state = PeerState::VersionSent;
            }
        }
        self.send_message(&Message::Version(version));
    }

    /// Bytes arrived from the transport.
    pub(crate) fn on_data(&self, data: Bytes) {
        if !self.is_connected() {
            return;
        }
        {
            let mut recv = self.recv.lock();
            if recv.unread() + data.len() > self.config.recv_flood_size {
                drop(recv);
                warn!(
                    peer = %self.id,
                    incoming = data.len(),
                    limit = self.config.recv_flood_size,
                    "Receive buffer flood"
                );
                self.disconnect("receive flood");
                return;
            }
            recv.data.extend_from_slice(&data);
        }

        loop {
            if !self.is_connected() {
                return;
            }
            let frame = self.next_frame();
            match frame {
                Frame::Incomplete => return,
                Frame::Invalid(reason) => {
                    warn!(peer = %self.id, reason = %reason, "Invalid frame");
                    self.disconnect(&reason);
                    return;
                }
                Frame::Complete(header, payload) => self.process_frame(header, payload),
            }
        }
    }

    fn next_frame(&self) -> Frame {
        let mut recv = self.recv.lock();
        if recv.unread() < MESSAGE_HEADER_SIZE {
            recv.compact();
            return Frame::Incomplete;
        }
        let start = recv.offset;
        let header = match codec::decode_header(&recv.data[start..]) {
            Ok(h) => h,
            Err(e) => return Frame::Invalid(e.to_string()),
        };
        if header.magic != self.config.magic {
            return Frame::Invalid(format!("bad magic {:#010x}", header.magic));
        }
        let length = header.length as usize;
        if length > self.config.max_message_length {
            return Frame::Invalid(format!("oversized message: {} bytes", length));
        }
        if recv.unread() < MESSAGE_HEADER_SIZE + length {
            return Frame::Incomplete;
        }
        let body_start = start + MESSAGE_HEADER_SIZE;
        let payload = Bytes::copy_from_slice(&recv.data[body_start..body_start + length]);
        if !codec::verify_checksum(&payload, &header.checksum) {
            return Frame::Invalid("checksum mismatch".to_string());
        }
        recv.offset = body_start + length;
        recv.compact();
        Frame::Complete(header, payload)
    }

    fn process_frame(&self, header: MessageHeader, payload: Bytes) {
        let command = header.command();
        if payload.is_empty()
            && Message::is_known_command(&command)
            && !Message::allows_empty_payload(&command)
        {
            self.disconnect(&format!("empty {} payload", command));
            return;
        }

        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(
            (MESSAGE_HEADER_SIZE + payload.len()) as u64,
            Ordering::Relaxed,
        );
        self.stats
            .last_recv_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);

        let message = match Message::decode(&command, payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %self.id, command = %command, error = %e, "Malformed message");
                self.disconnect("malformed message");
                return;
            }
        };
        trace!(peer = %self.id, command = %command, "Received message");
        self.handle_message(message);
    }

    fn handle_message(&self, message: Message) {
        if let Message::Version(version) = message {
            self.handle_version(version);
            return;
        }
        if !self.inner.lock().version_received {
            warn!(peer = %self.id, command = message.command(), "Message before version");
            self.disconnect("message before version");
            return;
        }
        match message {
            Message::Verack => self.handle_verack(),
            Message::Ping(nonce) => {
                self.send_message(&Message::Pong(nonce));
            }
            Message::Pong(nonce) => self.handle_pong(nonce),
            other => {
                if let Message::Unknown { command, .. } = &other {
                    debug!(peer = %self.id, command = %command, "Unknown command");
                }
                let _ = self.events.send(PeerEvent::Message {
                    peer: self.id,
                    message: other,
                });
            }
        }
    }

    fn handle_version(&self, version: VersionMessage) {
        {
            let mut inner = self.inner.lock();
            if inner.version_received {
                debug!(peer = %self.id, "Duplicate version ignored");
                return;
            }
            inner.version_received = true;
        }

        if version.version < self.config.min_protocol_version {
            info!(
                peer = %self.id,
                version = version.version,
                min = self.config.min_protocol_version,
                "Peer version too old"
            );
            self.disconnect("obsolete version");
            return;
        }

        if self.is_inbound() {
            if version.nonce == self.local_nonce {
                info!(peer = %self.id, addr = %self.addr, "Connected to self");
                self.disconnect("self connection");
                return;
            }
            let guard = self.self_connection_guard.lock().clone();
            if guard.map_or(false, |g| g(version.nonce)) {
                info!(peer = %self.id, addr = %self.addr, "Connected to self via outbound nonce");
                self.disconnect("self connection");
                return;
            }
        }

        let send_ours = {
            let mut inner = self.inner.lock();
            inner.remote = Some(RemoteVersion {
                version: version.version,
                services: version.services,
                user_agent: version.user_agent.clone(),
                start_height: version.start_height,
                nonce: version.nonce,
            });
            self.is_inbound() && inner.state == PeerState::Connected
        };
        debug!(
            peer = %self.id,
            version = version.version,
            user_agent = %version.user_agent,
            height = version.start_height,
            "Received version"
        );

        if !self.is_inbound() {
            let _ = self.events.send(PeerEvent::TimeSample {
                peer: self.id,
                addr: self.addr,
                offset: version.timestamp - unix_time(),
            });
        }

        if send_ours {
            self.send_version();
        }
        self.send_message(&Message::Verack);
    }

    fn handle_verack(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.verack_received || inner.state == PeerState::Ready {
                return;
            }
            inner.verack_received = true;
        }

        if self.is_feeler() {
            debug!(peer = %self.id, addr = %self.addr, "Feeler handshake complete");
            self.disconnect("feeler done");
            return;
        }

        {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, PeerState::Connected | PeerState::VersionSent) {
                return;
            }
            inner.state = PeerState::Ready;
            inner.successfully_connected = true;
        }
        {
            let mut timers = self.timers.lock();
            if let Some(handle) = timers.handshake.take() {
                handle.abort();
            }
        }
        self.arm_ping_timer();
        self.arm_inactivity_timer();

        info!(
            peer = %self.id,
            addr = %self.addr,
            kind = %self.connection_type,
            user_agent = %self.user_agent(),
            "Peer handshake complete"
        );
        let _ = self.events.send(PeerEvent::Ready { peer: self.id });
    }

    fn handle_pong(&self, nonce: u64) {
        let mut inner = self.inner.lock();
        if inner.ping_nonce != Some(nonce) {
            trace!(peer = %self.id, nonce, "Unsolicited pong");
            return;
        }
        if let Some(sent) = inner.ping_sent_at.take() {
            let rtt = sent.elapsed().as_millis() as i64;
            self.stats.ping_time_ms.store(rtt, Ordering::Relaxed);
        }
        inner.ping_nonce = None;
    }

    /// One keepalive tick. Returns `false` once the peer is gone.
    fn on_ping_tick(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let nonce = {
            let mut inner = self.inner.lock();
            match inner.ping_sent_at {
                Some(sent) if sent.elapsed() > self.config.ping_timeout => None,
                Some(_) => return true,
                None => {
                    let nonce: u64 = rand::random();
                    inner.ping_nonce = Some(nonce);
                    inner.ping_sent_at = Some(Instant::now());
                    Some(nonce)
                }
            }
        };
        match nonce {
            Some(nonce) => self.send_message(&Message::Ping(nonce)),
            None => {
                warn!(peer = %self.id, "Ping timeout");
                self.disconnect("ping timeout");
                false
            }
        }
    }

    /// Returns `false` once the peer is gone.
    fn on_inactivity_tick(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let last = self
            .stats
            .last_send_ms
            .load(Ordering::Relaxed)
            .max(self.stats.last_recv_ms.load(Ordering::Relaxed));
        let idle = Duration::from_millis(self.elapsed_ms().saturating_sub(last));
        if idle > self.config.inactivity_timeout {
            info!(peer = %self.id, idle_secs = idle.as_secs(), "Inactivity timeout");
            self.disconnect("inactivity");
            return false;
        }
        true
    }

    fn arm_handshake_timer(&self) {
        let weak = self.weak_self.clone();
        let timeout = self.config.handshake_timeout;
        self.arm(
            TimerSlot::Handshake,
            async move {
                tokio::time::sleep(timeout).await;
                if let Some(peer) = weak.upgrade() {
                    if peer.state() != PeerState::Ready {
                        info!(peer = %peer.id, "Handshake timeout");
                        peer.disconnect("handshake timeout");
                    }
                }
            },
        );
    }

    fn arm_ping_timer(&self) {
        let weak = self.weak_self.clone();
        let period = self.config.ping_interval;
        self.arm(
            TimerSlot::Ping,
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let Some(peer) = weak.upgrade() else { return };
                    if !peer.on_ping_tick() {
                        return;
                    }
                }
            },
        );
    }

    fn arm_inactivity_timer(&self) {
        let weak = self.weak_self.clone();
        let period = self.config.inactivity_check_interval;
        self.arm(
            TimerSlot::Inactivity,
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let Some(peer) = weak.upgrade() else { return };
                    if !peer.on_inactivity_tick() {
                        return;
                    }
                }
            },
        );
    }

    fn arm<F>(&self, slot: TimerSlot, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(peer = %self.id, "No runtime for peer timers");
            return;
        };
        let mut timers = self.timers.lock();
        if timers.closed {
            return;
        }
        if let Some(old) = timers.slot(slot).replace(handle.spawn(task)) {
            old.abort();
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.timers.get_mut().abort_all();
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("type", &self.connection_type)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands;
    use crate::transport::{Connection, MemoryConnection};

    const MAGIC: u32 = 0x554E_4943;

    struct Harness {
        peer: Arc<Peer>,
        conn: Arc<MemoryConnection>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    impl Harness {
        fn new(kind: ConnectionType) -> Self {
            Self::with_config(kind, PeerConfig::default())
        }

        fn with_config(kind: ConnectionType, config: PeerConfig) -> Self {
            let conn = MemoryConnection::new(1, "10.0.0.2:9590".parse().unwrap(), kind.is_inbound());
            let (tx, rx) = mpsc::unbounded_channel();
            let peer = Peer::new(
                PeerId(1),
                conn.clone(),
                kind,
                Permissions::NONE,
                Arc::new(config),
                0,
                tx,
            );
            Self {
                peer,
                conn,
                events: rx,
            }
        }

        fn feed(&self, message: Message) {
            self.conn
                .deliver(codec::encode_message(MAGIC, &message).unwrap());
        }

        fn sent(&self) -> Vec<String> {
            self.conn.sent_commands(MAGIC)
        }

        fn drain(&mut self) -> Vec<PeerEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                out.push(e);
            }
            out
        }

        fn handshake(&self) {
            self.peer.start();
            self.feed(remote_version(PROTOCOL_VERSION, 7));
            self.feed(Message::Verack);
        }
    }

    fn remote_version(version: i32, nonce: u64) -> Message {
        Message::Version(VersionMessage {
            version,
            services: NODE_NETWORK,
            timestamp: unix_time(),
            addr_recv: NetworkAddress::unspecified(),
            addr_from: NetworkAddress::unspecified(),
            nonce,
            user_agent: "/test:1.0/".to_string(),
            start_height: 10,
        })
    }

    fn disconnected(events: &[PeerEvent]) -> bool {
        events
            .iter()
            .any(|e| matches!(e, PeerEvent::Disconnected { .. }))
    }

    #[tokio::test]
    async fn test_outbound_handshake() {
        let mut h = Harness::new(ConnectionType::Outbound);
        assert_eq!(h.peer.state(), PeerState::Connecting);
        assert!(h.peer.start());
        assert_eq!(h.peer.state(), PeerState::VersionSent);
        assert_eq!(h.sent(), vec![commands::VERSION]);

        h.feed(remote_version(PROTOCOL_VERSION, 7));
        assert_eq!(h.sent(), vec![commands::VERSION, commands::VERACK]);
        h.feed(Message::Verack);

        assert_eq!(h.peer.state(), PeerState::Ready);
        assert!(h.peer.successfully_connected());
        assert_eq!(h.peer.start_height(), 10);
        let events = h.drain();
        assert!(matches!(events[0], PeerEvent::TimeSample { .. }));
        assert!(matches!(events[1], PeerEvent::Ready { .. }));
    }

    #[tokio::test]
    async fn test_inbound_sends_version_before_verack() {
        let mut h = Harness::new(ConnectionType::Inbound);
        assert!(h.peer.start());
        assert!(h.sent().is_empty());

        h.feed(remote_version(PROTOCOL_VERSION, 7));
        assert_eq!(h.sent(), vec![commands::VERSION, commands::VERACK]);
        // Inbound peers never produce time samples.
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let h = Harness::new(ConnectionType::Outbound);
        assert!(h.peer.start());
        assert!(!h.peer.start());
        assert_eq!(h.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_version_ignored() {
        let h = Harness::new(ConnectionType::Inbound);
        h.peer.start();
        h.feed(remote_version(PROTOCOL_VERSION, 7));
        h.feed(remote_version(PROTOCOL_VERSION + 5, 8));
        assert_eq!(h.peer.version(), PROTOCOL_VERSION);
        assert_eq!(h.peer.remote_nonce(), Some(7));
        assert_eq!(h.sent().len(), 2);
        assert!(h.peer.is_connected());
    }

    #[tokio::test]
    async fn test_obsolete_version_disconnects_without_verack() {
        let config = PeerConfig {
            min_protocol_version: 209,
            ..Default::default()
        };
        let mut h = Harness::with_config(ConnectionType::Outbound, config);
        h.peer.start();
        h.feed(remote_version(1, 7));
        assert_eq!(h.peer.state(), PeerState::Disconnected);
        assert_eq!(h.sent(), vec![commands::VERSION]);
        assert!(disconnected(&h.drain()));
    }

    #[tokio::test]
    async fn test_message_before_version_disconnects() {
        let mut h = Harness::new(ConnectionType::Inbound);
        h.peer.start();
        h.feed(Message::Ping(1));
        assert_eq!(h.peer.state(), PeerState::Disconnected);
        assert!(h.sent().is_empty());
        assert!(disconnected(&h.drain()));
    }

    #[tokio::test]
    async fn test_inbound_self_connection() {
        let h = Harness::new(ConnectionType::Inbound);
        h.peer.start();
        h.feed(remote_version(PROTOCOL_VERSION, h.peer.local_nonce()));
        assert_eq!(h.peer.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_self_connection_guard() {
        let h = Harness::new(ConnectionType::Inbound);
        h.peer.set_self_connection_guard(Arc::new(|nonce| nonce == 99));
        h.peer.start();
        h.feed(remote_version(PROTOCOL_VERSION, 99));
        assert_eq!(h.peer.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_feeler_disconnects_after_verack() {
        let mut h = Harness::new(ConnectionType::Feeler);
        h.handshake();
        assert_eq!(h.peer.state(), PeerState::Disconnected);
        assert!(!h.peer.successfully_connected());
        let timers = h.peer.timers.lock();
        assert!(timers.ping.is_none());
        assert!(timers.inactivity.is_none());
        drop(timers);
        assert!(!h
            .drain()
            .iter()
            .any(|e| matches!(e, PeerEvent::Ready { .. })));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let h = Harness::new(ConnectionType::Outbound);
        h.handshake();
        h.conn.clear_sent();
        h.feed(Message::Ping(42));
        assert_eq!(h.conn.sent_messages(MAGIC), vec![Message::Pong(42)]);
    }

    #[tokio::test]
    async fn test_forwards_protocol_messages() {
        let mut h = Harness::new(ConnectionType::Outbound);
        h.handshake();
        h.drain();
        h.feed(Message::GetAddr);
        h.feed(Message::Unknown {
            command: "feefilter".to_string(),
            payload: Bytes::from_static(&[0u8; 8]),
        });
        let events = h.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            PeerEvent::Message { message: Message::GetAddr, .. }
        ));
        assert!(h.peer.is_ready());
    }

    #[tokio::test]
    async fn test_bad_magic_disconnects() {
        let h = Harness::new(ConnectionType::Inbound);
        h.peer.start();
        h.conn
            .deliver(codec::encode_message(0x0BAD_CAFE, &Message::Verack).unwrap());
        assert_eq!(h.peer.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_bad_checksum_disconnects() {
        let h = Harness::new(ConnectionType::Inbound);
        h.peer.start();
        let frame = codec::encode_message(MAGIC, &remote_version(PROTOCOL_VERSION, 7)).unwrap();
        let mut corrupted = BytesMut::from(&frame[..]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        h.conn.deliver(corrupted.freeze());
        assert_eq!(h.peer.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_oversized_length_disconnects() {
        let h = Harness::new(ConnectionType::Inbound);
        h.peer.start();
        let mut header = BytesMut::new();
        MessageHeader {
            magic: MAGIC,
            command: *b"headers\0\0\0\0\0",
            length: (MAX_PROTOCOL_MESSAGE_LENGTH + 1) as u32,
            checksum: [0; 4],
        }
        .encode(&mut header);
        h.conn.deliver(header.freeze());
        assert_eq!(h.peer.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_empty_payload_for_ping_disconnects() {
        let h = Harness::new(ConnectionType::Outbound);
        h.handshake();
        h.conn
            .deliver(codec::encode(MAGIC, commands::PING, &[]).unwrap());
        assert_eq!(h.peer.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_split_frame_reassembled() {
        let h = Harness::new(ConnectionType::Inbound);
        h.peer.start();
        let frame = codec::encode_message(MAGIC, &remote_version(PROTOCOL_VERSION, 7)).unwrap();
        h.conn.deliver(frame.slice(..10));
        assert!(h.sent().is_empty());
        h.conn.deliver(frame.slice(10..));
        assert_eq!(h.sent(), vec![commands::VERSION, commands::VERACK]);
    }

    #[tokio::test]
    async fn test_flood_over_two_deliveries() {
        let config = PeerConfig {
            recv_flood_size: 1000,
            ..Default::default()
        };
        let mut h = Harness::with_config(ConnectionType::Inbound, config);
        h.peer.start();
        let frame = codec::encode_message(MAGIC, &remote_version(PROTOCOL_VERSION, 7)).unwrap();
        // An incomplete header-only prefix claiming a large body sits in the buffer.
        let mut first = BytesMut::from(&frame[..MESSAGE_HEADER_SIZE]);
        first[16..20].copy_from_slice(&900u32.to_le_bytes());
        h.conn.deliver(first.freeze());
        assert!(h.peer.is_connected());
        h.conn.deliver(Bytes::from(vec![0u8; 1000]));
        assert_eq!(h.peer.state(), PeerState::Disconnected);
        assert!(h.sent().is_empty());
        assert!(disconnected(&h.drain()));
    }

    #[tokio::test]
    async fn test_send_failure_disconnects() {
        let h = Harness::new(ConnectionType::Outbound);
        h.conn.set_fail_sends(true);
        h.peer.start();
        assert_eq!(h.peer.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_detaches() {
        let mut h = Harness::new(ConnectionType::Outbound);
        h.handshake();
        h.drain();
        h.peer.disconnect("test");
        h.peer.disconnect("again");
        assert!(!h.conn.has_callbacks());
        assert!(!h.conn.is_open());
        let events = h.drain();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, PeerEvent::Disconnected { .. }))
                .count(),
            1
        );
        assert!(!h.peer.start());
    }

    #[tokio::test]
    async fn test_remote_close_disconnects() {
        let h = Harness::new(ConnectionType::Outbound);
        h.handshake();
        h.conn.remote_close();
        assert_eq!(h.peer.state(), PeerState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let h = Harness::new(ConnectionType::Outbound);
        h.peer.start();
        tokio::time::sleep(VERSION_HANDSHAKE_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(h.peer.state(), PeerState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_sent_and_latency_recorded() {
        let h = Harness::new(ConnectionType::Outbound);
        h.handshake();
        h.conn.clear_sent();
        tokio::time::sleep(PING_INTERVAL + Duration::from_secs(1)).await;

        let sent = h.conn.sent_messages(MAGIC);
        let nonce = match sent.as_slice() {
            [Message::Ping(n)] => *n,
            other => panic!("expected one ping, got {:?}", other),
        };
        tokio::time::advance(Duration::from_millis(250)).await;
        h.feed(Message::Pong(nonce));
        assert!(h.peer.ping_time_ms().unwrap() >= 250);

        // Handshake timer was cancelled on verack.
        assert!(h.peer.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout_disconnects() {
        let config = PeerConfig {
            inactivity_timeout: Duration::from_secs(24 * 3600),
            ..Default::default()
        };
        let h = Harness::with_config(ConnectionType::Outbound, config);
        h.handshake();
        tokio::time::sleep(PING_TIMEOUT + PING_INTERVAL * 3).await;
        assert_eq!(h.peer.state(), PeerState::Disconnected);
    }

    /// Timers that never fire on their own, so ticks are driven by hand.
    fn manual_timers() -> PeerConfig {
        PeerConfig {
            ping_interval: Duration::from_secs(365 * 24 * 3600),
            inactivity_check_interval: Duration::from_secs(365 * 24 * 3600),
            ..Default::default()
        }
    }

    fn pings(h: &Harness) -> Vec<u64> {
        h.conn
            .sent_messages(MAGIC)
            .into_iter()
            .filter_map(|m| match m {
                Message::Ping(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    fn pongs(h: &Harness) -> usize {
        h.conn
            .sent_messages(MAGIC)
            .iter()
            .filter(|m| matches!(m, Message::Pong(_)))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_tick_disconnects_idle_peer() {
        let mut h = Harness::with_config(ConnectionType::Outbound, manual_timers());
        h.handshake();
        tokio::time::advance(INACTIVITY_TIMEOUT - Duration::from_secs(1)).await;
        assert!(h.peer.on_inactivity_tick());
        assert!(h.peer.is_ready());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!h.peer.on_inactivity_tick());
        assert_eq!(h.peer.state(), PeerState::Disconnected);
        assert!(disconnected(&h.drain()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_tick_kept_alive_by_recent_receive() {
        let h = Harness::with_config(ConnectionType::Outbound, manual_timers());
        h.handshake();
        h.conn.clear_sent();
        tokio::time::advance(INACTIVITY_TIMEOUT + Duration::from_secs(1)).await;

        // An unsolicited pong is read but not answered.
        h.feed(Message::Pong(42));
        assert!(h.sent().is_empty());
        assert!(h.peer.on_inactivity_tick());
        assert!(h.peer.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_tick_kept_alive_by_recent_send() {
        let h = Harness::with_config(ConnectionType::Outbound, manual_timers());
        h.handshake();
        tokio::time::advance(INACTIVITY_TIMEOUT + Duration::from_secs(1)).await;

        assert!(h.peer.send_message(&Message::GetAddr));
        assert!(h.peer.on_inactivity_tick());
        assert!(h.peer.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outstanding_ping_not_replaced() {
        let h = Harness::with_config(ConnectionType::Outbound, manual_timers());
        h.handshake();
        h.conn.clear_sent();

        assert!(h.peer.on_ping_tick());
        let first = pings(&h);
        assert_eq!(first.len(), 1);

        tokio::time::advance(PING_INTERVAL).await;
        assert!(h.peer.on_ping_tick());
        assert_eq!(pings(&h), first);
        assert_eq!(h.peer.inner.lock().ping_nonce, Some(first[0]));

        h.feed(Message::Pong(first[0]));
        assert_eq!(h.peer.ping_time_ms(), Some(PING_INTERVAL.as_millis() as u64));
        assert!(h.peer.on_ping_tick());
        let all = pings(&h);
        assert_eq!(all.len(), 2);
        assert_ne!(h.peer.inner.lock().ping_nonce, Some(first[0]));
    }

    #[test]
    fn test_recv_buffer_compacts_past_half() {
        let mut buf = RecvBuffer::default();
        buf.data.extend_from_slice(&[7u8; 100]);

        buf.offset = 50;
        buf.compact();
        assert_eq!((buf.data.len(), buf.offset), (100, 50));

        buf.offset = 51;
        buf.compact();
        assert_eq!((buf.data.len(), buf.offset), (49, 0));
        assert!(buf.data.iter().all(|b| *b == 7));

        buf.offset = 49;
        buf.compact();
        assert_eq!((buf.data.len(), buf.offset), (0, 0));
    }

    #[tokio::test]
    async fn test_frames_decode_across_compaction() {
        let mut h = Harness::new(ConnectionType::Inbound);
        h.handshake();
        h.drain();
        h.conn.clear_sent();

        let ping = codec::encode_message(MAGIC, &Message::Ping(1)).unwrap();
        let headers =
            codec::encode_message(MAGIC, &Message::Headers(Bytes::from(vec![0u8; 200]))).unwrap();
        let join = |a: &[u8], b: &[u8]| {
            let mut out = BytesMut::from(a);
            out.extend_from_slice(b);
            out.freeze()
        };

        // Consumed prefix below half: kept in place.
        h.conn.deliver(join(&ping[..], &headers[..100]));
        {
            let recv = h.peer.recv.lock();
            assert_eq!(recv.offset, ping.len());
            assert_eq!(recv.data.len(), ping.len() + 100);
        }
        h.conn.deliver(headers.slice(100..));
        assert_eq!(h.peer.recv.lock().data.len(), 0);

        // Consumed prefix past half: the partial tail moves to the front.
        h.conn.deliver(join(&headers[..], &ping[..10]));
        {
            let recv = h.peer.recv.lock();
            assert_eq!(recv.offset, 0);
            assert_eq!(&recv.data[..], &ping[..10]);
        }
        h.conn.deliver(ping.slice(10..));

        assert!(h.peer.is_ready());
        assert_eq!(pongs(&h), 2);
        let forwarded = h
            .drain()
            .into_iter()
            .filter(|e| {
                matches!(e, PeerEvent::Message { message: Message::Headers(p), .. } if p.len() == 200)
            })
            .count();
        assert_eq!(forwarded, 2);
    }
}
