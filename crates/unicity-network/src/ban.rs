//! Ban and discouragement tracking.
//!
//! Bans are explicit and carry an expiry. Discouragement is the soft form
//! applied automatically to misbehaving peers: discouraged addresses are
//! refused for a day but never persisted. Whitelisted addresses bypass both.

use dashmap::{DashMap, DashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long a discouraged address stays discouraged.
pub const DISCOURAGEMENT_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on discouraged entries kept in memory.
pub const MAX_DISCOURAGED: usize = 10_000;

/// Default explicit ban length.
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Ban state consulted by the orchestrator.
pub trait BanStore: Send + Sync {
    fn is_banned(&self, ip: &IpAddr) -> bool;

    fn is_discouraged(&self, ip: &IpAddr) -> bool;

    fn discourage(&self, ip: IpAddr);

    /// Drop expired entries.
    fn sweep(&self);
}

/// An explicit ban.
#[derive(Debug, Clone)]
pub struct BanEntry {
    pub ip: IpAddr,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub reason: String,
}

/// In-memory [`BanStore`].
pub struct BanList {
    bans: DashMap<IpAddr, BanEntry>,
    discouraged: DashMap<IpAddr, Instant>,
    whitelist: DashSet<IpAddr>,
    discourage_duration: Duration,
    max_discouraged: usize,
}

impl BanList {
    pub fn new() -> Self {
        Self::with_limits(DISCOURAGEMENT_DURATION, MAX_DISCOURAGED)
    }

    pub fn with_limits(discourage_duration: Duration, max_discouraged: usize) -> Self {
        Self {
            bans: DashMap::new(),
            discouraged: DashMap::new(),
            whitelist: DashSet::new(),
            discourage_duration,
            max_discouraged,
        }
    }

    pub fn ban(&self, ip: IpAddr, duration: Duration, reason: impl Into<String>) {
        let now = Instant::now();
        let reason = reason.into();
        info!(ip = %ip, secs = duration.as_secs(), reason = %reason, "Banning address");
        self.bans.insert(
            ip,
            BanEntry {
                ip,
                created_at: now,
                expires_at: now + duration,
                reason,
            },
        );
    }

    pub fn unban(&self, ip: &IpAddr) -> bool {
        self.bans.remove(ip).is_some()
    }

    pub fn list_bans(&self) -> Vec<BanEntry> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .bans
            .iter()
            .filter(|e| e.expires_at > now)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|e| e.created_at);
        out
    }

    pub fn clear_bans(&self) {
        self.bans.clear();
    }

    pub fn clear_discouraged(&self) {
        self.discouraged.clear();
    }

    pub fn add_to_whitelist(&self, ip: IpAddr) {
        self.whitelist.insert(ip);
    }

    pub fn remove_from_whitelist(&self, ip: &IpAddr) {
        self.whitelist.remove(ip);
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip)
    }

    pub fn discouraged_count(&self) -> usize {
        self.discouraged.len()
    }

    /// Make room for one more discouraged entry: expired ones first, then the
    /// entry closest to expiry.
    fn evict_discouraged(&self) {
        let now = Instant::now();
        self.discouraged.retain(|_, until| *until > now);
        if self.discouraged.len() < self.max_discouraged {
            return;
        }
        let oldest = self
            .discouraged
            .iter()
            .min_by_key(|e| *e.value())
            .map(|e| *e.key());
        if let Some(ip) = oldest {
            self.discouraged.remove(&ip);
        }
    }
}

impl Default for BanList {
    fn default() -> Self {
        Self::new()
    }
}

impl BanStore for BanList {
    fn is_banned(&self, ip: &IpAddr) -> bool {
        if self.is_whitelisted(ip) {
            return false;
        }
        match self.bans.get(ip) {
            Some(entry) => entry.expires_at > Instant::now(),
            None => false,
        }
    }

    fn is_discouraged(&self, ip: &IpAddr) -> bool {
        if self.is_whitelisted(ip) {
            return false;
        }
        match self.discouraged.get(ip) {
            Some(until) => *until > Instant::now(),
            None => false,
        }
    }

    fn discourage(&self, ip: IpAddr) {
        if self.is_whitelisted(&ip) {
            debug!(ip = %ip, "Not discouraging whitelisted address");
            return;
        }
        if !self.discouraged.contains_key(&ip) && self.discouraged.len() >= self.max_discouraged {
            self.evict_discouraged();
        }
        info!(ip = %ip, "Discouraging address");
        self.discouraged
            .insert(ip, Instant::now() + self.discourage_duration);
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.bans.retain(|_, e| e.expires_at > now);
        self.discouraged.retain(|_, until| *until > now);
    }
}
