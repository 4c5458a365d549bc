//! Address source.
//!
//! [`AddressSource`] is the orchestrator's view of the address database.
//! [`AddressBook`] is a small in-memory implementation with two pools: "new"
//! (heard about, never connected) and "tried" (connected at least once).

use crate::protocol::{unix_time, NetworkAddress, TimestampedAddress, NODE_NETWORK};
use parking_lot::RwLock;
use rand::seq::{IteratorRandom, SliceRandom};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::debug;

/// Failed attempts after which a never-connected address is forgotten.
pub const MAX_FAILED_ATTEMPTS: u32 = 10;

/// Addresses not heard from for this long are dropped by cleanup.
pub const STALE_AFTER_SECS: i64 = 30 * 24 * 60 * 60;

/// Addresses whose timestamp is further in the future than this are clamped.
const MAX_FUTURE_DRIFT_SECS: i64 = 10 * 60;

pub trait AddressSource: Send + Sync {
    /// Candidate for a regular outbound connection.
    fn select(&self) -> Option<SocketAddr>;

    /// Candidate for a feeler, drawn from addresses never connected to.
    fn select_feeler_candidate(&self) -> Option<SocketAddr>;

    /// Learn an address. Returns `true` if it was new.
    fn add(&self, addr: SocketAddr, timestamp: u32) -> bool;

    fn mark_good(&self, addr: &SocketAddr);

    fn mark_attempt(&self, addr: &SocketAddr);

    fn mark_failed(&self, addr: &SocketAddr);

    /// Up to `max` known addresses in random order.
    fn get_addresses(&self, max: usize) -> Vec<TimestampedAddress>;

    fn size(&self) -> usize;
}

#[derive(Debug, Clone)]
struct AddressEntry {
    timestamp: u32,
    services: u64,
    tried: bool,
    attempts: u32,
}

/// In-memory [`AddressSource`].
#[derive(Default)]
pub struct AddressBook {
    entries: RwLock<HashMap<SocketAddr, AddressEntry>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tried_count(&self) -> usize {
        self.entries.read().values().filter(|e| e.tried).count()
    }

    pub fn new_count(&self) -> usize {
        self.entries.read().values().filter(|e| !e.tried).count()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.entries.read().contains_key(addr)
    }

    pub fn is_tried(&self, addr: &SocketAddr) -> bool {
        self.entries.read().get(addr).map_or(false, |e| e.tried)
    }

    /// Drop never-connected addresses that have gone stale. Returns how many.
    pub fn cleanup_stale(&self) -> usize {
        let cutoff = unix_time() - STALE_AFTER_SECS;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.tried || i64::from(e.timestamp) >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Removed stale addresses");
        }
        removed
    }
}

impl AddressSource for AddressBook {
    fn select(&self) -> Option<SocketAddr> {
        let entries = self.entries.read();
        let mut rng = rand::thread_rng();
        let tried = entries
            .iter()
            .filter(|(_, e)| e.tried)
            .map(|(a, _)| *a)
            .choose(&mut rng);
        // Tried addresses win half the time.
        if let Some(addr) = tried {
            if rand::random::<bool>() {
                return Some(addr);
            }
        }
        entries
            .keys()
            .copied()
            .choose(&mut rng)
            .or(tried)
    }

    fn select_feeler_candidate(&self) -> Option<SocketAddr> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(_, e)| !e.tried)
            .map(|(a, _)| *a)
            .choose(&mut rand::thread_rng())
    }

    fn add(&self, addr: SocketAddr, timestamp: u32) -> bool {
        if addr.port() == 0 || addr.ip().is_unspecified() {
            return false;
        }
        let now = unix_time();
        let timestamp = if i64::from(timestamp) > now + MAX_FUTURE_DRIFT_SECS || timestamp == 0 {
            now as u32
        } else {
            timestamp
        };
        let mut entries = self.entries.write();
        match entries.get_mut(&addr) {
            Some(entry) => {
                entry.timestamp = entry.timestamp.max(timestamp);
                false
            }
            None => {
                entries.insert(
                    addr,
                    AddressEntry {
                        timestamp,
                        services: NODE_NETWORK,
                        tried: false,
                        attempts: 0,
                    },
                );
                true
            }
        }
    }

    fn mark_good(&self, addr: &SocketAddr) {
        let now = unix_time();
        let mut entries = self.entries.write();
        let entry = entries.entry(*addr).or_insert_with(|| AddressEntry {
            timestamp: now as u32,
            services: NODE_NETWORK,
            tried: false,
            attempts: 0,
        });
        entry.tried = true;
        entry.attempts = 0;
        entry.timestamp = now as u32;
    }

    fn mark_attempt(&self, addr: &SocketAddr) {
        if let Some(entry) = self.entries.write().get_mut(addr) {
            entry.attempts = entry.attempts.saturating_add(1);
        }
    }

    fn mark_failed(&self, addr: &SocketAddr) {
        let mut entries = self.entries.write();
        let remove = match entries.get_mut(addr) {
            Some(entry) => {
                entry.attempts = entry.attempts.saturating_add(1);
                !entry.tried && entry.attempts >= MAX_FAILED_ATTEMPTS
            }
            None => false,
        };
        if remove {
            entries.remove(addr);
            debug!(%addr, "Forgetting unreachable address");
        }
    }

    fn get_addresses(&self, max: usize) -> Vec<TimestampedAddress> {
        let entries = self.entries.read();
        let mut out: Vec<TimestampedAddress> = entries
            .iter()
            .map(|(addr, e)| TimestampedAddress {
                timestamp: e.timestamp,
                address: NetworkAddress::from_socket_addr(*addr, e.services),
            })
            .collect();
        out.shuffle(&mut rand::thread_rng());
        out.truncate(max);
        out
    }

    fn size(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_and_dedup() {
        let book = AddressBook::new();
        assert!(book.add(addr("10.0.0.1:9590"), 0));
        assert!(!book.add(addr("10.0.0.1:9590"), 0));
        assert!(!book.add(addr("0.0.0.0:9590"), 0));
        assert!(!book.add(addr("10.0.0.2:0"), 0));
        assert_eq!(book.size(), 1);
    }

    #[test]
    fn test_mark_good_moves_to_tried() {
        let book = AddressBook::new();
        book.add(addr("10.0.0.1:9590"), 0);
        book.add(addr("10.0.0.2:9590"), 0);
        book.mark_good(&addr("10.0.0.1:9590"));
        assert!(book.is_tried(&addr("10.0.0.1:9590")));
        assert_eq!(book.tried_count(), 1);
        // Feeler candidates come only from the new pool.
        for _ in 0..20 {
            assert_eq!(book.select_feeler_candidate(), Some(addr("10.0.0.2:9590")));
        }
    }

    #[test]
    fn test_failed_new_address_forgotten() {
        let book = AddressBook::new();
        book.add(addr("10.0.0.1:9590"), 0);
        for _ in 0..MAX_FAILED_ATTEMPTS {
            book.mark_failed(&addr("10.0.0.1:9590"));
        }
        assert_eq!(book.size(), 0);
    }

    #[test]
    fn test_failed_tried_address_kept() {
        let book = AddressBook::new();
        book.mark_good(&addr("10.0.0.1:9590"));
        for _ in 0..MAX_FAILED_ATTEMPTS * 2 {
            book.mark_failed(&addr("10.0.0.1:9590"));
        }
        assert_eq!(book.size(), 1);
    }

    #[test]
    fn test_get_addresses_bounded() {
        let book = AddressBook::new();
        for i in 1..=20u8 {
            book.add(SocketAddr::from(([10, 0, 1, i], 9590)), 0);
        }
        assert_eq!(book.get_addresses(5).len(), 5);
        assert_eq!(book.get_addresses(100).len(), 20);
    }

    #[test]
    fn test_cleanup_stale() {
        let book = AddressBook::new();
        book.add(addr("10.0.0.1:9590"), 1);
        book.add(addr("10.0.0.2:9590"), 0);
        assert_eq!(book.cleanup_stale(), 1);
        assert!(book.contains(&addr("10.0.0.2:9590")));
    }

    #[test]
    fn test_select_empty() {
        let book = AddressBook::new();
        assert!(book.select().is_none());
        assert!(book.select_feeler_candidate().is_none());
    }
}
