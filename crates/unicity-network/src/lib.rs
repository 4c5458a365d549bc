//! # unicity-network
//!
//! P2P protocol engine for the Unicity headers-only node.
//!
//! This crate provides:
//! - Wire codec and typed protocol messages
//! - Per-connection peer state machine (handshake, keepalive, timeouts)
//! - Misbehavior scoring with discouragement
//! - Block announcement relay
//! - Connection orchestration: outbound slots, feelers, inbound admission,
//!   eviction and anchors
//!
//! Transport, address database, ban storage and chain state are reached
//! through traits; in-memory and TCP implementations are included.

pub mod addrman;
pub mod anchors;
pub mod ban;
pub mod chain;
pub mod codec;
pub mod discovery;
pub mod dispatch;
mod error;
pub mod manager;
pub mod message;
pub mod misbehavior;
pub mod notifications;
pub mod peer;
pub mod protocol;
pub mod relay;
mod service;
pub mod timedata;
pub mod transport;

pub use addrman::{AddressBook, AddressSource};
pub use ban::{BanList, BanStore};
pub use chain::{ChainState, HeaderSync};
pub use codec::{MessageCodec, MessageHeader};
pub use discovery::PeerDiscovery;
pub use dispatch::{DispatchOutcome, MessageHandlerRegistry};
pub use error::{NetworkError, NetworkResult};
pub use manager::{PeerCounts, PeerManager, PeerManagerConfig};
pub use message::{GetHeadersMessage, Message, VersionMessage};
pub use misbehavior::{MisbehaviorTracker, Penalties, Violation};
pub use notifications::{NetworkNotification, NetworkNotifications, Subscription};
pub use peer::{
    ConnectionType, Peer, PeerConfig, PeerEvent, PeerId, PeerInfo, PeerState, Permissions,
};
pub use protocol::{
    BlockHash, InventoryItem, NetworkAddress, NetworkType, TimestampedAddress, PROTOCOL_VERSION,
};
pub use relay::{BlockRelay, BlockRelayConfig};
pub use service::{
    NetworkCommand, NetworkConfig, NetworkService, NetworkStats, CONNECT_INTERVAL,
    FEELER_INTERVAL, FLUSH_INTERVAL, MAINTENANCE_INTERVAL, MAX_CONNECTION_ATTEMPTS_PER_CYCLE,
};
pub use timedata::TimeData;
pub use transport::{
    Connection, ConnectionRef, MemoryConnection, MemoryNetwork, MemoryTransport, TcpTransport,
    TcpTransportConfig, Transport,
};
