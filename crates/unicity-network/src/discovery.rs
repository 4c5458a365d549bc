//! Peer discovery.
//!
//! Bootstraps an empty address source from the network's fixed seeds and
//! handles address gossip (`addr` / `getaddr`).

use crate::addrman::AddressSource;
use crate::manager::PeerManager;
use crate::message::Message;
use crate::misbehavior::Violation;
use crate::peer::PeerId;
use crate::protocol::{parse_peer_address, NetworkType, TimestampedAddress, MAX_ADDR_SIZE};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Seed name resolution timeout.
pub const SEED_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PeerDiscovery {
    network: NetworkType,
    resolve_timeout: Duration,
    peers: Arc<PeerManager>,
    addresses: Arc<dyn AddressSource>,
}

impl PeerDiscovery {
    pub fn new(
        network: NetworkType,
        peers: Arc<PeerManager>,
        addresses: Arc<dyn AddressSource>,
    ) -> Self {
        Self {
            network,
            resolve_timeout: SEED_RESOLVE_TIMEOUT,
            peers,
            addresses,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn addresses(&self) -> &Arc<dyn AddressSource> {
        &self.addresses
    }

    /// Resolve the network's fixed seeds.
    pub async fn seed_addresses(&self) -> Vec<SocketAddr> {
        let port = self.network.default_port();
        let mut out = Vec::new();
        for seed in self.network.fixed_seeds() {
            if let Ok(addr) = parse_peer_address(seed, port) {
                out.push(addr);
                continue;
            }
            match self.resolve_seed(seed, port).await {
                Ok(addrs) => {
                    debug!(seed = %seed, count = addrs.len(), "Resolved seed");
                    out.extend(addrs);
                }
                Err(e) => warn!(seed = %seed, error = %e, "Failed to resolve seed"),
            }
        }
        out.sort();
        out.dedup();
        out
    }

    async fn resolve_seed(&self, seed: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        let host = if seed.contains(':') {
            seed.to_string()
        } else {
            format!("{}:{}", seed, port)
        };
        let lookup = tokio::task::spawn_blocking(move || {
            host.to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
        });
        match timeout(self.resolve_timeout, lookup).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("resolver task failed: {}", e),
            )),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "seed resolution timed out",
            )),
        }
    }

    /// Seed the address source if it is empty. Returns how many were added.
    pub async fn bootstrap(&self) -> usize {
        if self.addresses.size() > 0 {
            return 0;
        }
        let seeds = self.seed_addresses().await;
        let added = seeds
            .into_iter()
            .filter(|addr| self.addresses.add(*addr, 0))
            .count();
        info!(network = %self.network, added, "Bootstrapped address source from fixed seeds");
        added
    }

    /// Ask `peer` for addresses, once per connection.
    pub fn request_addresses(&self, peer: PeerId) -> bool {
        let Some(p) = self.peers.get_peer(peer) else {
            return false;
        };
        if !p.mark_getaddr_sent() {
            return false;
        }
        p.send_message(&Message::GetAddr)
    }

    /// Absorb an `addr` message. Returns how many addresses were new.
    pub fn handle_addr(&self, peer: PeerId, mut addrs: Vec<TimestampedAddress>) -> usize {
        let Some(p) = self.peers.get_peer(peer) else {
            return 0;
        };
        if !p.is_ready() {
            debug!(peer = %peer, "Ignoring addr before handshake completed");
            return 0;
        }
        if addrs.len() > MAX_ADDR_SIZE {
            warn!(peer = %peer, count = addrs.len(), "Oversized addr message");
            if self.peers.report_misbehavior(peer, Violation::OversizedMessage) {
                return 0;
            }
            addrs.truncate(MAX_ADDR_SIZE);
        }

        let added = addrs
            .iter()
            .filter(|a| !a.address.is_unspecified())
            .filter(|a| self.addresses.add(a.address.socket_addr(), a.timestamp))
            .count();
        debug!(peer = %peer, received = addrs.len(), added, "Processed addr");
        added
    }

    /// Answer a `getaddr`. Only inbound peers are served, once per connection.
    pub fn handle_getaddr(&self, peer: PeerId) -> bool {
        let Some(p) = self.peers.get_peer(peer) else {
            return false;
        };
        if !p.is_inbound() || !p.is_ready() {
            debug!(peer = %peer, "Ignoring getaddr");
            return false;
        }
        if !p.mark_getaddr_answered() {
            debug!(peer = %peer, "Ignoring repeated getaddr");
            return false;
        }
        let requester = p.addr();
        let addrs: Vec<TimestampedAddress> = self
            .addresses
            .get_addresses(MAX_ADDR_SIZE + 1)
            .into_iter()
            .filter(|a| a.address.socket_addr() != requester)
            .take(MAX_ADDR_SIZE)
            .collect();
        debug!(peer = %peer, count = addrs.len(), "Answering getaddr");
        p.send_message(&Message::Addr(addrs))
    }
}
