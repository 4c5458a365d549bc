//! Block announcement relay.
//!
//! Outgoing: each ready peer has a queue of block hashes waiting to be
//! announced. The tip is enqueued periodically, but not again within the TTL
//! of its last announcement to that peer. `flush` drains the queues into `inv`
//! messages.
//!
//! Incoming: `inv` announcements of unknown blocks turn into header requests,
//! restricted to the sync peer during initial block download and de-duplicated
//! while a request for the same hash is outstanding.

use crate::chain::{ChainState, HeaderSync};
use crate::manager::PeerManager;
use crate::message::Message;
use crate::peer::PeerId;
use crate::protocol::{BlockHash, InventoryItem, MAX_INV_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Suppression window for re-announcing the same hash to a peer.
pub const BLOCK_ANNOUNCE_TTL: Duration = Duration::from_secs(600);

/// A header request for a hash is considered lost after this long.
pub const BLOCK_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BlockRelayConfig {
    pub announce_ttl: Duration,
    pub request_timeout: Duration,
}

impl Default for BlockRelayConfig {
    fn default() -> Self {
        Self {
            announce_ttl: BLOCK_ANNOUNCE_TTL,
            request_timeout: BLOCK_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct AnnounceState {
    /// Pending hashes, insertion ordered, no duplicates.
    queue: Vec<BlockHash>,
    last_announced: Option<(BlockHash, Instant)>,
}

pub struct BlockRelay {
    config: BlockRelayConfig,
    peers: Arc<PeerManager>,
    chain: Arc<dyn ChainState>,
    announce: Mutex<HashMap<PeerId, AnnounceState>>,
    inflight: Mutex<HashMap<BlockHash, (PeerId, Instant)>>,
}

impl BlockRelay {
    pub fn new(config: BlockRelayConfig, peers: Arc<PeerManager>, chain: Arc<dyn ChainState>) -> Self {
        Self {
            config,
            peers,
            chain,
            announce: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue the current tip for every ready peer, honoring the TTL.
    ///
    /// Returns the number of peers the tip was enqueued for.
    pub fn announce_tip_to_all(&self) -> usize {
        if self.chain.current_height() <= 0 {
            return 0;
        }
        let tip = self.chain.tip_hash();
        let ready = self.peers.ready_peers();
        let now = Instant::now();

        let mut state = self.announce.lock();
        let mut enqueued = 0;
        for peer in ready {
            let entry = state.entry(peer.id()).or_default();
            if entry.queue.contains(&tip) {
                continue;
            }
            if let Some((hash, at)) = entry.last_announced {
                if hash == tip && now.duration_since(at) < self.config.announce_ttl {
                    continue;
                }
            }
            entry.queue.push(tip);
            entry.last_announced = Some((tip, now));
            enqueued += 1;
        }
        if enqueued > 0 {
            trace!(tip = %tip, peers = enqueued, "Queued tip announcement");
        }
        enqueued
    }

    /// Enqueue the current tip for one peer, ignoring the TTL.
    pub fn announce_tip_to_one(&self, peer: PeerId) -> bool {
        if self.chain.current_height() <= 0 {
            return false;
        }
        let tip = self.chain.tip_hash();
        let mut state = self.announce.lock();
        let entry = state.entry(peer).or_default();
        if entry.queue.contains(&tip) {
            return false;
        }
        entry.queue.push(tip);
        entry.last_announced = Some((tip, Instant::now()));
        true
    }

    /// Drain every ready peer's queue into `inv` messages.
    ///
    /// Returns the number of hashes sent.
    pub fn flush(&self) -> usize {
        let ready = self.peers.ready_peers();
        let batches: Vec<(PeerId, Vec<BlockHash>)> = {
            let mut state = self.announce.lock();
            ready
                .iter()
                .filter_map(|peer| {
                    let entry = state.get_mut(&peer.id())?;
                    if entry.queue.is_empty() {
                        return None;
                    }
                    Some((peer.id(), std::mem::take(&mut entry.queue)))
                })
                .collect()
        };

        let mut sent = 0;
        for (peer, hashes) in batches {
            for chunk in hashes.chunks(MAX_INV_SIZE) {
                let items = chunk.iter().copied().map(InventoryItem::block).collect();
                if self.peers.send_to(peer, &Message::Inv(items)) {
                    sent += chunk.len();
                }
            }
        }
        sent
    }

    /// Announce `hash` to every ready peer right away.
    pub fn relay_now(&self, hash: BlockHash) -> usize {
        let ready = self.peers.ready_peers();
        let now = Instant::now();
        {
            let mut state = self.announce.lock();
            for peer in &ready {
                let entry = state.entry(peer.id()).or_default();
                entry.queue.retain(|h| *h != hash);
                entry.last_announced = Some((hash, now));
            }
        }
        let inv = Message::Inv(vec![InventoryItem::block(hash)]);
        ready
            .iter()
            .filter(|peer| peer.send_message(&inv))
            .count()
    }

    /// React to an `inv` from `peer`. Returns `true` if headers were requested.
    pub fn handle_inventory(
        &self,
        peer: PeerId,
        items: &[InventoryItem],
        sync: &dyn HeaderSync,
    ) -> bool {
        let Some(from) = self.peers.get_peer(peer) else {
            return false;
        };
        let unknown: Vec<BlockHash> = items
            .iter()
            .filter(|i| i.is_block())
            .map(|i| i.hash)
            .filter(|h| !self.chain.has_block(h))
            .collect();
        if unknown.is_empty() {
            return false;
        }

        self.prune_inflight();
        let fresh: Vec<BlockHash> = {
            let inflight = self.inflight.lock();
            unknown
                .into_iter()
                .filter(|h| !inflight.contains_key(h))
                .collect()
        };
        if fresh.is_empty() {
            trace!(peer = %peer, "Announced blocks already requested");
            return false;
        }

        if self.chain.is_initial_block_download() {
            match sync.sync_peer_id() {
                Some(current) if current == peer => {}
                Some(_) => return false,
                None => {
                    // Inbound peers only get adopted when no outbound peer is usable.
                    if from.is_inbound() && self.peers.has_ready_outbound() {
                        return false;
                    }
                    debug!(peer = %peer, "Adopting announcing peer for sync");
                    sync.set_sync_peer(peer);
                }
            }
        }

        {
            let now = Instant::now();
            let mut inflight = self.inflight.lock();
            for hash in &fresh {
                inflight.insert(*hash, (peer, now));
            }
        }
        debug!(peer = %peer, count = fresh.len(), "Requesting headers for announced blocks");
        sync.request_headers(peer);
        true
    }

    /// Forget requests that were answered or timed out.
    pub fn prune_inflight(&self) {
        let timeout = self.config.request_timeout;
        let chain = &self.chain;
        self.inflight
            .lock()
            .retain(|hash, (_, at)| at.elapsed() < timeout && !chain.has_block(hash));
    }

    pub fn on_peer_disconnected(&self, peer: PeerId) {
        self.announce.lock().remove(&peer);
        self.inflight.lock().retain(|_, (p, _)| *p != peer);
    }

    /// Hashes waiting to be announced to `peer`.
    pub fn queued_for(&self, peer: PeerId) -> Vec<BlockHash> {
        self.announce
            .lock()
            .get(&peer)
            .map(|s| s.queue.clone())
            .unwrap_or_default()
    }

    pub fn last_announced(&self, peer: PeerId) -> Option<(BlockHash, Instant)> {
        self.announce.lock().get(&peer).and_then(|s| s.last_announced)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}
