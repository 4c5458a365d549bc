//! Misbehavior scoring.
//!
//! Protocol violations map to fixed penalties. Once a peer's score crosses
//! [`DISCOURAGEMENT_THRESHOLD`] it is flagged for disconnection and its address
//! for discouragement. The flag is sticky; scores never decrease while the
//! peer is registered. Peers holding `NO_BAN` accumulate score but are never
//! flagged.

use crate::notifications::{NetworkNotification, NetworkNotifications};
use crate::peer::{PeerId, Permissions};
use crate::protocol::BlockHash;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Penalty amounts per violation.
pub struct Penalties;

impl Penalties {
    /// Header with insufficient proof of work.
    pub const INVALID_POW: i32 = 100;

    /// Message or list above protocol limits.
    pub const OVERSIZED_MESSAGE: i32 = 20;

    /// Headers batch that does not chain.
    pub const NON_CONTINUOUS_HEADERS: i32 = 20;

    /// Headers chain with too little work to be useful.
    pub const LOW_WORK_HEADERS: i32 = 10;

    /// Header rejected by validation.
    pub const INVALID_HEADER: i32 = 100;

    /// Too many headers messages that do not connect to our chain.
    pub const TOO_MANY_UNCONNECTING: i32 = 20;

    /// Too many orphan headers.
    pub const TOO_MANY_ORPHANS: i32 = 50;
}

/// Score at which a peer is flagged.
pub const DISCOURAGEMENT_THRESHOLD: i32 = 100;

/// Unconnecting headers messages tolerated before the penalty applies.
pub const MAX_UNCONNECTING_HEADERS: u32 = 10;

/// A reportable protocol violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    InvalidPow,
    OversizedMessage,
    NonContinuousHeaders,
    LowWorkHeaders,
    InvalidHeader(String),
    TooManyUnconnecting,
    TooManyOrphans,
}

impl Violation {
    pub fn penalty(&self) -> i32 {
        match self {
            Self::InvalidPow => Penalties::INVALID_POW,
            Self::OversizedMessage => Penalties::OVERSIZED_MESSAGE,
            Self::NonContinuousHeaders => Penalties::NON_CONTINUOUS_HEADERS,
            Self::LowWorkHeaders => Penalties::LOW_WORK_HEADERS,
            Self::InvalidHeader(_) => Penalties::INVALID_HEADER,
            Self::TooManyUnconnecting => Penalties::TOO_MANY_UNCONNECTING,
            Self::TooManyOrphans => Penalties::TOO_MANY_ORPHANS,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPow => write!(f, "invalid proof of work"),
            Self::OversizedMessage => write!(f, "oversized message"),
            Self::NonContinuousHeaders => write!(f, "non-continuous headers"),
            Self::LowWorkHeaders => write!(f, "low-work headers"),
            Self::InvalidHeader(reason) => write!(f, "invalid header: {}", reason),
            Self::TooManyUnconnecting => write!(f, "too many unconnecting headers"),
            Self::TooManyOrphans => write!(f, "too many orphan headers"),
        }
    }
}

#[derive(Debug)]
struct MisbehaviorRecord {
    addr: SocketAddr,
    permissions: Permissions,
    score: i32,
    should_discourage: bool,
    invalid_header_hashes: HashSet<BlockHash>,
    unconnecting_headers: u32,
    unconnecting_penalized: bool,
}

/// Per-peer misbehavior table.
pub struct MisbehaviorTracker {
    peers: Mutex<HashMap<PeerId, MisbehaviorRecord>>,
    notifications: Arc<NetworkNotifications>,
}

impl MisbehaviorTracker {
    pub fn new(notifications: Arc<NetworkNotifications>) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            notifications,
        }
    }

    pub fn register(&self, peer: PeerId, addr: SocketAddr, permissions: Permissions) {
        self.peers.lock().insert(
            peer,
            MisbehaviorRecord {
                addr,
                permissions,
                score: 0,
                should_discourage: false,
                invalid_header_hashes: HashSet::new(),
                unconnecting_headers: 0,
                unconnecting_penalized: false,
            },
        );
    }

    /// Drop the record. Returns whether the peer was flagged.
    pub fn unregister(&self, peer: PeerId) -> bool {
        self.peers
            .lock()
            .remove(&peer)
            .map_or(false, |r| r.should_discourage)
    }

    pub fn is_registered(&self, peer: PeerId) -> bool {
        self.peers.lock().contains_key(&peer)
    }

    /// Apply the penalty for `violation`.
    ///
    /// Returns `true` if this report pushed the peer across the threshold.
    pub fn report(&self, peer: PeerId, violation: Violation) -> bool {
        let penalty = violation.penalty();
        let (score, crossed, addr) = {
            let mut peers = self.peers.lock();
            let Some(record) = peers.get_mut(&peer) else {
                debug!(peer = %peer, violation = %violation, "Misbehavior for unknown peer");
                return false;
            };
            if violation == Violation::TooManyUnconnecting {
                if record.unconnecting_penalized {
                    return false;
                }
                record.unconnecting_penalized = true;
            }
            let old = record.score;
            record.score = old.saturating_add(penalty);
            let crossed = record.score >= DISCOURAGEMENT_THRESHOLD
                && old < DISCOURAGEMENT_THRESHOLD
                && !record.permissions.has_no_ban();
            if crossed {
                record.should_discourage = true;
            }
            (record.score, crossed, record.addr)
        };

        if crossed {
            warn!(peer = %peer, addr = %addr, violation = %violation, score, "Peer crossed misbehavior threshold");
        } else {
            debug!(peer = %peer, violation = %violation, penalty, score, "Peer misbehaved");
        }
        self.notifications.notify(NetworkNotification::Misbehavior {
            peer,
            reason: violation.to_string(),
            score,
        });
        crossed
    }

    /// Penalize an invalid header at most once per hash and peer.
    ///
    /// Returns `false` if this hash was already penalized for `peer`.
    pub fn note_invalid_header(&self, peer: PeerId, hash: BlockHash, reason: &str) -> bool {
        {
            let mut peers = self.peers.lock();
            let Some(record) = peers.get_mut(&peer) else {
                return false;
            };
            if !record.invalid_header_hashes.insert(hash) {
                return false;
            }
        }
        self.notifications.notify(NetworkNotification::InvalidHeader {
            peer,
            hash,
            reason: reason.to_string(),
        });
        self.report(peer, Violation::InvalidHeader(reason.to_string()));
        true
    }

    /// Count a headers message that does not connect.
    ///
    /// Once the count reaches [`MAX_UNCONNECTING_HEADERS`] the one-time penalty is
    /// applied. Returns `true` when the limit has been reached.
    pub fn increment_unconnecting(&self, peer: PeerId) -> bool {
        let reached = {
            let mut peers = self.peers.lock();
            let Some(record) = peers.get_mut(&peer) else {
                return false;
            };
            record.unconnecting_headers = record.unconnecting_headers.saturating_add(1);
            record.unconnecting_headers >= MAX_UNCONNECTING_HEADERS
        };
        if reached {
            self.report(peer, Violation::TooManyUnconnecting);
        }
        reached
    }

    pub fn reset_unconnecting(&self, peer: PeerId) {
        if let Some(record) = self.peers.lock().get_mut(&peer) {
            record.unconnecting_headers = 0;
        }
    }

    pub fn unconnecting_count(&self, peer: PeerId) -> u32 {
        self.peers
            .lock()
            .get(&peer)
            .map_or(0, |r| r.unconnecting_headers)
    }

    /// Current score; 0 for unknown peers.
    pub fn score(&self, peer: PeerId) -> i32 {
        self.peers.lock().get(&peer).map_or(0, |r| r.score)
    }

    /// Whether the peer is flagged; `false` for unknown peers.
    pub fn should_disconnect(&self, peer: PeerId) -> bool {
        self.peers
            .lock()
            .get(&peer)
            .map_or(false, |r| r.should_discourage)
    }

    pub fn permissions(&self, peer: PeerId) -> Permissions {
        self.peers
            .lock()
            .get(&peer)
            .map_or(Permissions::NONE, |r| r.permissions)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
