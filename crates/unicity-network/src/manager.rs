//! Registry of live peers.
//!
//! Admission policy lives here: ban and discouragement checks, the outbound
//! target, the inbound limit with eviction, and the per-IP inbound cap.

use crate::ban::BanStore;
use crate::message::Message;
use crate::misbehavior::{MisbehaviorTracker, Violation};
use crate::notifications::{NetworkNotification, NetworkNotifications};
use crate::peer::{ConnectionType, Peer, PeerId, PeerInfo, PeerState};
use crate::protocol::{DEFAULT_MAX_INBOUND_CONNECTIONS, DEFAULT_MAX_OUTBOUND_CONNECTIONS};
use crate::{NetworkError, NetworkResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Inbound connections accepted from one IP.
pub const MAX_INBOUND_PER_IP: usize = 2;

/// Inbound peers younger than this are never evicted.
pub const EVICTION_PROTECTION: Duration = Duration::from_secs(10);

/// Feelers are removed after this long regardless of handshake progress.
pub const FEELER_MAX_LIFETIME: Duration = Duration::from_secs(120);

/// Outbound peers still `Connecting` after this long are reaped.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    /// Full-relay outbound connections to maintain.
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub max_inbound_per_ip: usize,
    pub eviction_protection: Duration,
    pub feeler_max_lifetime: Duration,
    pub connect_timeout: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            max_outbound: DEFAULT_MAX_OUTBOUND_CONNECTIONS,
            max_inbound: DEFAULT_MAX_INBOUND_CONNECTIONS,
            max_inbound_per_ip: MAX_INBOUND_PER_IP,
            eviction_protection: EVICTION_PROTECTION,
            feeler_max_lifetime: FEELER_MAX_LIFETIME,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Outcome of removing a peer.
#[derive(Debug)]
pub struct RemovedPeer {
    pub peer: Arc<Peer>,
    /// The address earned a good mark: handshake completed, clean score,
    /// regular outbound.
    pub mark_good: bool,
    pub discouraged: bool,
}

/// Peer counts by connection type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounts {
    pub inbound: usize,
    pub outbound: usize,
    pub manual: usize,
    pub feeler: usize,
}

impl PeerCounts {
    pub fn total(&self) -> usize {
        self.inbound + self.outbound + self.manual + self.feeler
    }
}

/// Manages live peer connections.
pub struct PeerManager {
    config: PeerManagerConfig,
    peers: DashMap<PeerId, Arc<Peer>>,
    /// Held from the capacity checks through the insert.
    admission: Mutex<()>,
    next_id: AtomicU64,
    misbehavior: Arc<MisbehaviorTracker>,
    bans: Arc<dyn BanStore>,
    notifications: Arc<NetworkNotifications>,
}

impl PeerManager {
    pub fn new(
        config: PeerManagerConfig,
        bans: Arc<dyn BanStore>,
        notifications: Arc<NetworkNotifications>,
    ) -> Self {
        Self {
            config,
            peers: DashMap::new(),
            admission: Mutex::new(()),
            next_id: AtomicU64::new(1),
            misbehavior: Arc::new(MisbehaviorTracker::new(Arc::clone(&notifications))),
            bans,
            notifications,
        }
    }

    pub fn config(&self) -> &PeerManagerConfig {
        &self.config
    }

    pub fn misbehavior(&self) -> &Arc<MisbehaviorTracker> {
        &self.misbehavior
    }

    pub fn bans(&self) -> &Arc<dyn BanStore> {
        &self.bans
    }

    pub fn allocate_id(&self) -> PeerId {
        PeerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether `ip` is refused by the ban list.
    pub fn is_refused(&self, ip: &IpAddr) -> bool {
        self.bans.is_banned(ip) || self.bans.is_discouraged(ip)
    }

    /// Admit `peer` into the registry.
    ///
    /// Admissions are serialized, so concurrent callers cannot overshoot the
    /// connection limits.
    pub fn add_peer(&self, peer: Arc<Peer>) -> NetworkResult<()> {
        let _admission = self.admission.lock();
        let id = peer.id();
        let addr = peer.addr();
        let no_ban = peer.permissions().has_no_ban();

        if !no_ban && self.is_refused(&addr.ip()) {
            return Err(NetworkError::PeerBanned(addr.ip().to_string()));
        }

        match peer.connection_type() {
            ConnectionType::Outbound => {
                let count = self.count_of(ConnectionType::Outbound);
                if count >= self.config.max_outbound {
                    return Err(NetworkError::TooManyConnections {
                        count,
                        max: self.config.max_outbound,
                    });
                }
            }
            ConnectionType::Inbound => {
                let count = self.count_of(ConnectionType::Inbound);
                if count >= self.config.max_inbound && !self.evict_inbound_peer() {
                    return Err(NetworkError::TooManyConnections {
                        count,
                        max: self.config.max_inbound,
                    });
                }
                let from_ip = self.inbound_from(&addr.ip());
                if !no_ban && from_ip >= self.config.max_inbound_per_ip {
                    return Err(NetworkError::TooManyConnections {
                        count: from_ip,
                        max: self.config.max_inbound_per_ip,
                    });
                }
            }
            ConnectionType::Manual | ConnectionType::Feeler => {}
        }

        if self.peers.contains_key(&id) {
            return Err(NetworkError::AlreadyConnected(id.to_string()));
        }
        self.misbehavior.register(id, addr, peer.permissions());
        self.peers.insert(id, peer);
        debug!(peer = %id, addr = %addr, "Registered peer");
        Ok(())
    }

    /// Remove and disconnect `id`. Discourages the address if the peer was flagged.
    pub fn remove_peer(&self, id: PeerId) -> Option<RemovedPeer> {
        let (_, peer) = self.peers.remove(&id)?;
        let score = self.misbehavior.score(id);
        let flagged = self.misbehavior.unregister(id);

        let discouraged = flagged && !peer.permissions().has_no_ban();
        if discouraged {
            info!(peer = %id, addr = %peer.addr(), score, "Discouraging misbehaving peer");
            self.bans.discourage(peer.addr().ip());
        }

        let mark_good = peer.successfully_connected()
            && score == 0
            && !peer.is_inbound()
            && !peer.is_feeler();

        peer.disconnect("removed");
        self.notifications
            .notify(NetworkNotification::PeerDisconnected {
                peer: id,
                addr: peer.addr(),
                mark_good,
            });
        debug!(peer = %id, mark_good, "Removed peer");

        Some(RemovedPeer {
            peer,
            mark_good,
            discouraged,
        })
    }

    /// Report misbehavior; a peer pushed over the threshold is removed at once.
    pub fn report_misbehavior(&self, id: PeerId, violation: Violation) -> bool {
        let crossed = self.misbehavior.report(id, violation);
        if crossed {
            self.remove_peer(id);
        }
        crossed
    }

    pub fn get_peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.get(&id).map(|p| Arc::clone(p.value()))
    }

    pub fn find_peer_by_address(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|p| p.addr() == *addr && p.is_connected())
            .map(|p| *p.key())
    }

    /// Every registered peer, ordered by id.
    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        let mut out: Vec<_> = self.peers.iter().map(|p| Arc::clone(p.value())).collect();
        out.sort_by_key(|p| p.id());
        out
    }

    pub fn ready_peers(&self) -> Vec<Arc<Peer>> {
        self.all_peers()
            .into_iter()
            .filter(|p| p.is_ready())
            .collect()
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.all_peers().iter().map(|p| p.info()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn counts(&self) -> PeerCounts {
        let mut counts = PeerCounts::default();
        for peer in self.peers.iter() {
            match peer.connection_type() {
                ConnectionType::Inbound => counts.inbound += 1,
                ConnectionType::Outbound => counts.outbound += 1,
                ConnectionType::Manual => counts.manual += 1,
                ConnectionType::Feeler => counts.feeler += 1,
            }
        }
        counts
    }

    fn count_of(&self, kind: ConnectionType) -> usize {
        self.peers
            .iter()
            .filter(|p| p.connection_type() == kind)
            .count()
    }

    pub fn outbound_count(&self) -> usize {
        self.count_of(ConnectionType::Outbound)
    }

    pub fn inbound_count(&self) -> usize {
        self.count_of(ConnectionType::Inbound)
    }

    fn inbound_from(&self, ip: &IpAddr) -> usize {
        self.peers
            .iter()
            .filter(|p| p.is_inbound() && p.addr().ip() == *ip)
            .count()
    }

    pub fn needs_more_outbound(&self) -> bool {
        self.outbound_count() < self.config.max_outbound
    }

    /// Whether an inbound connection from `ip` could be admitted, possibly by
    /// evicting someone.
    pub fn can_accept_inbound_from(&self, ip: &IpAddr) -> bool {
        self.inbound_from(ip) < self.config.max_inbound_per_ip
    }

    /// Whether any regular or manual outbound peer has completed the handshake.
    pub fn has_ready_outbound(&self) -> bool {
        self.peers
            .iter()
            .any(|p| !p.is_inbound() && !p.is_feeler() && p.is_ready())
    }

    /// Evict the inbound peer with the worst ping to make room.
    ///
    /// Peers younger than the protection window and `NO_BAN` peers are exempt.
    /// Unknown ping counts as worst; ties go to the older peer, then lower id.
    pub fn evict_inbound_peer(&self) -> bool {
        let mut candidates: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .filter(|p| {
                p.is_inbound()
                    && !p.permissions().has_no_ban()
                    && p.created_at().elapsed() >= self.config.eviction_protection
            })
            .map(|p| Arc::clone(p.value()))
            .collect();
        candidates.sort_by(|a, b| {
            let pa = a.ping_time_ms().unwrap_or(u64::MAX);
            let pb = b.ping_time_ms().unwrap_or(u64::MAX);
            pb.cmp(&pa)
                .then_with(|| a.created_at().cmp(&b.created_at()))
                .then_with(|| a.id().cmp(&b.id()))
        });
        match candidates.first() {
            Some(victim) => {
                info!(peer = %victim.id(), addr = %victim.addr(), ping = ?victim.ping_time_ms(), "Evicting inbound peer");
                self.remove_peer(victim.id()).is_some()
            }
            None => false,
        }
    }

    /// Peers due for removal: disconnected, stalled while connecting, feelers
    /// past their lifetime, or flagged.
    pub fn collect_for_removal(&self) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| {
                let age = p.created_at().elapsed();
                !p.is_connected()
                    || (p.state() == PeerState::Connecting && age > self.config.connect_timeout)
                    || (p.is_feeler() && age > self.config.feeler_max_lifetime)
                    || self.misbehavior.should_disconnect(p.id())
            })
            .map(|p| *p.key())
            .collect();
        out.sort();
        out
    }

    /// Whether `nonce` matches one of our outbound peers still handshaking.
    pub fn check_incoming_nonce(&self, nonce: u64) -> bool {
        self.peers.iter().any(|p| {
            !p.is_inbound() && p.local_nonce() == nonce && p.is_connected() && !p.is_ready()
        })
    }

    pub fn send_to(&self, id: PeerId, message: &Message) -> bool {
        match self.get_peer(id) {
            Some(peer) => peer.send_message(message),
            None => false,
        }
    }

    pub fn disconnect_all(&self) {
        let ids: Vec<PeerId> = self.peers.iter().map(|p| *p.key()).collect();
        for id in ids {
            self.remove_peer(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban::BanList;
    use crate::peer::{PeerConfig, PeerEvent, Permissions};
    use crate::transport::MemoryConnection;
    use tokio::sync::mpsc;

    struct Fixture {
        manager: PeerManager,
        bans: Arc<BanList>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
        _events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn fixture(config: PeerManagerConfig) -> Fixture {
        let bans = Arc::new(BanList::new());
        let (tx, rx) = mpsc::unbounded_channel();
        Fixture {
            manager: PeerManager::new(config, bans.clone(), NetworkNotifications::new()),
            bans,
            events_tx: tx,
            _events_rx: rx,
        }
    }

    impl Fixture {
        fn peer(&self, addr: &str, kind: ConnectionType, perms: Permissions) -> Arc<Peer> {
            let id = self.manager.allocate_id();
            let conn = MemoryConnection::new(id.0, addr.parse().unwrap(), kind.is_inbound());
            Peer::new(
                id,
                conn,
                kind,
                perms,
                Arc::new(PeerConfig::default()),
                0,
                self.events_tx.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_outbound_limit_excludes_feelers_and_manual() {
        let f = fixture(PeerManagerConfig {
            max_outbound: 1,
            ..Default::default()
        });
        let a = f.peer("10.0.0.1:9590", ConnectionType::Outbound, Permissions::NONE);
        f.manager.add_peer(a).unwrap();
        assert!(!f.manager.needs_more_outbound());

        let b = f.peer("10.0.0.2:9590", ConnectionType::Outbound, Permissions::NONE);
        assert!(matches!(
            f.manager.add_peer(b),
            Err(NetworkError::TooManyConnections { .. })
        ));
        let feeler = f.peer("10.0.0.3:9590", ConnectionType::Feeler, Permissions::NONE);
        let manual = f.peer("10.0.0.4:9590", ConnectionType::Manual, Permissions::MANUAL);
        f.manager.add_peer(feeler).unwrap();
        f.manager.add_peer(manual).unwrap();
        assert_eq!(
            f.manager.counts(),
            PeerCounts {
                inbound: 0,
                outbound: 1,
                manual: 1,
                feeler: 1
            }
        );
    }

    #[tokio::test]
    async fn test_banned_and_discouraged_refused() {
        let f = fixture(PeerManagerConfig::default());
        f.bans
            .ban("10.0.0.1".parse().unwrap(), Duration::from_secs(60), "test");
        f.bans.discourage("10.0.0.2".parse().unwrap());

        let a = f.peer("10.0.0.1:9590", ConnectionType::Inbound, Permissions::NONE);
        let b = f.peer("10.0.0.2:9590", ConnectionType::Inbound, Permissions::NONE);
        assert!(matches!(f.manager.add_peer(a), Err(NetworkError::PeerBanned(_))));
        assert!(matches!(f.manager.add_peer(b), Err(NetworkError::PeerBanned(_))));

        let exempt = f.peer("10.0.0.2:9590", ConnectionType::Inbound, Permissions::NO_BAN);
        f.manager.add_peer(exempt).unwrap();
    }

    #[tokio::test]
    async fn test_per_ip_inbound_limit() {
        let f = fixture(PeerManagerConfig::default());
        for port in 1..=MAX_INBOUND_PER_IP as u16 {
            let p = f.peer(&format!("10.0.0.1:{}", port), ConnectionType::Inbound, Permissions::NONE);
            f.manager.add_peer(p).unwrap();
        }
        assert!(!f.manager.can_accept_inbound_from(&"10.0.0.1".parse().unwrap()));
        let extra = f.peer("10.0.0.1:99", ConnectionType::Inbound, Permissions::NONE);
        assert!(f.manager.add_peer(extra).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_prefers_unknown_ping_then_older() {
        let f = fixture(PeerManagerConfig {
            max_inbound: 2,
            ..Default::default()
        });
        let first = f.peer("10.0.0.1:1", ConnectionType::Inbound, Permissions::NONE);
        let first_id = first.id();
        f.manager.add_peer(first).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = f.peer("10.0.0.2:1", ConnectionType::Inbound, Permissions::NONE);
        f.manager.add_peer(second).unwrap();

        // Both still protected.
        let third = f.peer("10.0.0.3:1", ConnectionType::Inbound, Permissions::NONE);
        assert!(f.manager.add_peer(third).is_err());

        tokio::time::advance(EVICTION_PROTECTION).await;
        let fourth = f.peer("10.0.0.4:1", ConnectionType::Inbound, Permissions::NONE);
        f.manager.add_peer(fourth).unwrap();
        assert!(f.manager.get_peer(first_id).is_none());
        assert_eq!(f.manager.inbound_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_discourages_flagged_peer() {
        let f = fixture(PeerManagerConfig::default());
        let p = f.peer("10.0.0.7:9590", ConnectionType::Outbound, Permissions::NONE);
        let id = p.id();
        f.manager.add_peer(p).unwrap();

        assert!(f.manager.report_misbehavior(id, Violation::InvalidPow));
        assert!(f.manager.get_peer(id).is_none());
        assert!(f.bans.is_discouraged(&"10.0.0.7".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_remove_without_handshake_not_good() {
        let f = fixture(PeerManagerConfig::default());
        let p = f.peer("10.0.0.8:9590", ConnectionType::Outbound, Permissions::NONE);
        let id = p.id();
        f.manager.add_peer(p).unwrap();
        let removed = f.manager.remove_peer(id).unwrap();
        assert!(!removed.mark_good);
        assert!(!removed.discouraged);
        assert!(f.manager.remove_peer(id).is_none());
    }

    #[tokio::test]
    async fn test_collect_for_removal() {
        let f = fixture(PeerManagerConfig {
            feeler_max_lifetime: Duration::ZERO,
            ..Default::default()
        });
        let feeler = f.peer("10.0.0.1:9590", ConnectionType::Feeler, Permissions::NONE);
        let fid = feeler.id();
        let gone = f.peer("10.0.0.2:9590", ConnectionType::Outbound, Permissions::NONE);
        let gid = gone.id();
        let fine = f.peer("10.0.0.3:9590", ConnectionType::Outbound, Permissions::NONE);
        f.manager.add_peer(feeler).unwrap();
        f.manager.add_peer(gone.clone()).unwrap();
        f.manager.add_peer(fine).unwrap();
        gone.disconnect("test");
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(f.manager.collect_for_removal(), vec![fid, gid]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connect_reaped() {
        let f = fixture(PeerManagerConfig::default());
        let stuck = f.peer("10.0.0.1:9590", ConnectionType::Outbound, Permissions::NONE);
        let sid = stuck.id();
        let inbound = f.peer("10.0.0.2:9590", ConnectionType::Inbound, Permissions::NONE);
        f.manager.add_peer(stuck).unwrap();
        f.manager.add_peer(inbound).unwrap();

        tokio::time::advance(CONNECT_TIMEOUT).await;
        assert!(f.manager.collect_for_removal().is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(f.manager.collect_for_removal(), vec![sid]);
    }

    #[test]
    fn test_concurrent_admission_respects_limit() {
        let f = Arc::new(fixture(PeerManagerConfig {
            max_outbound: 4,
            ..Default::default()
        }));
        let handles: Vec<_> = (0..16u8)
            .map(|i| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || {
                    let p = f.peer(
                        &format!("10.0.1.{}:9590", i),
                        ConnectionType::Outbound,
                        Permissions::NONE,
                    );
                    f.manager.add_peer(p).is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 4);
        assert_eq!(f.manager.outbound_count(), 4);
    }

    #[tokio::test]
    async fn test_incoming_nonce_matches_handshaking_outbound() {
        let f = fixture(PeerManagerConfig::default());
        let p = f.peer("10.0.0.1:9590", ConnectionType::Outbound, Permissions::NONE);
        let nonce = p.local_nonce();
        f.manager.add_peer(p).unwrap();
        assert!(f.manager.check_incoming_nonce(nonce));
        assert!(!f.manager.check_incoming_nonce(nonce.wrapping_add(1)));
    }

    #[tokio::test]
    async fn test_find_by_address() {
        let f = fixture(PeerManagerConfig::default());
        let p = f.peer("10.0.0.1:9590", ConnectionType::Outbound, Permissions::NONE);
        let id = p.id();
        f.manager.add_peer(p).unwrap();
        assert_eq!(
            f.manager.find_peer_by_address(&"10.0.0.1:9590".parse().unwrap()),
            Some(id)
        );
        assert_eq!(
            f.manager.find_peer_by_address(&"10.0.0.1:9591".parse().unwrap()),
            None
        );
    }
}
