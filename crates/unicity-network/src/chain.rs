//! Chain-side collaborators.
//!
//! The protocol engine carries block hashes but never interprets headers.
//! Everything chain-specific is reached through these two traits.

use crate::message::GetHeadersMessage;
use crate::peer::PeerId;
use crate::protocol::BlockHash;
use bytes::Bytes;

/// Read-only view of the local chain.
pub trait ChainState: Send + Sync {
    fn current_height(&self) -> i32;

    fn tip_hash(&self) -> BlockHash;

    /// Whether the header for `hash` is already known.
    fn has_block(&self, hash: &BlockHash) -> bool;

    fn is_initial_block_download(&self) -> bool;
}

/// Header synchronization driver.
pub trait HeaderSync: Send + Sync {
    /// Ask `peer` for headers past our tip.
    fn request_headers(&self, peer: PeerId);

    fn has_sync_peer(&self) -> bool;

    fn set_sync_peer(&self, peer: PeerId);

    fn sync_peer_id(&self) -> Option<PeerId>;

    /// Raw `headers` payload from `peer`.
    fn handle_headers(&self, peer: PeerId, payload: Bytes);

    fn handle_getheaders(&self, peer: PeerId, request: GetHeadersMessage);

    fn on_peer_disconnected(&self, peer: PeerId);
}
