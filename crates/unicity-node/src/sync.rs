//! Minimal header synchronization driver.
//!
//! Requests headers from the sync peer with a locator of our tip and answers
//! `getheaders` with what the local chain has, which is nothing past genesis.
//! Received batches are size-checked and counted.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use unicity_network::message::read_compact_size;
use unicity_network::protocol::MAX_HEADERS_SIZE;
use unicity_network::{
    BlockHash, ChainState, GetHeadersMessage, HeaderSync, Message, PeerId, PeerManager, Violation,
    PROTOCOL_VERSION,
};

pub struct HeaderSyncDriver {
    peers: Arc<PeerManager>,
    chain: Arc<dyn ChainState>,
    sync_peer: RwLock<Option<PeerId>>,
    headers_received: AtomicU64,
}

impl HeaderSyncDriver {
    pub fn new(peers: Arc<PeerManager>, chain: Arc<dyn ChainState>) -> Self {
        Self {
            peers,
            chain,
            sync_peer: RwLock::new(None),
            headers_received: AtomicU64::new(0),
        }
    }

    pub fn headers_received(&self) -> u64 {
        self.headers_received.load(Ordering::Relaxed)
    }
}

impl HeaderSync for HeaderSyncDriver {
    fn request_headers(&self, peer: PeerId) {
        let request = Message::GetHeaders(GetHeadersMessage {
            version: PROTOCOL_VERSION as u32,
            locator: vec![self.chain.tip_hash()],
            hash_stop: BlockHash::ZERO,
        });
        if self.peers.send_to(peer, &request) {
            debug!(peer = %peer, tip = %self.chain.tip_hash(), "Requested headers");
        }
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
        let mut src = payload;
        let count = match read_compact_size(&mut src) {
            Ok(count) => count,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Malformed headers message");
                return;
            }
        };
        if count > MAX_HEADERS_SIZE as u64 {
            warn!(peer = %peer, count, "Too many headers");
            self.peers
                .report_misbehavior(peer, Violation::OversizedMessage);
            return;
        }
        let total = self.headers_received.fetch_add(count, Ordering::Relaxed) + count;
        info!(peer = %peer, count, total, "Received headers");
    }

    fn handle_getheaders(&self, peer: PeerId, request: GetHeadersMessage) {
        debug!(peer = %peer, locator = request.locator.len(), "Peer requested headers");
        // Count prefix only: no headers past genesis.
        self.peers
            .send_to(peer, &Message::Headers(Bytes::from_static(&[0u8])));
    }

    fn on_peer_disconnected(&self, peer: PeerId) {
        let mut sync_peer = self.sync_peer.write();
        if *sync_peer == Some(peer) {
            info!(peer = %peer, "Sync peer disconnected");
            *sync_peer = None;
        }
    }
}
