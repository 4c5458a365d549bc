//! Protocol constants and the small value types shared by every message.

use crate::{NetworkError, NetworkResult};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Protocol version we speak.
pub const PROTOCOL_VERSION: i32 = 1;

/// Lowest protocol version we accept by default.
pub const MIN_PROTOCOL_VERSION: i32 = 1;

/// Wire header: magic (4) + command (12) + length (4) + checksum (4).
pub const MESSAGE_HEADER_SIZE: usize = 24;

/// Fixed width of the NUL-padded command field.
pub const COMMAND_SIZE: usize = 12;

/// Checksum width (prefix of double SHA-256).
pub const CHECKSUM_SIZE: usize = 4;

/// Largest payload a single message may declare.
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 4_000_000;

/// Hard cap on buffered, not yet parsed bytes per peer.
pub const DEFAULT_RECV_FLOOD_SIZE: usize = 5_000_000;

/// Largest value a CompactSize may encode.
pub const MAX_SIZE: u64 = 0x0200_0000;

/// Maximum inventory items per `inv` message.
pub const MAX_INV_SIZE: usize = 50_000;

/// Maximum locator hashes per `getheaders`.
pub const MAX_LOCATOR_SZ: usize = 101;

/// Maximum headers per `headers`.
pub const MAX_HEADERS_SIZE: usize = 2_000;

/// Maximum addresses per `addr`.
pub const MAX_ADDR_SIZE: usize = 1_000;

/// Maximum user agent length in `version`.
pub const MAX_SUBVERSION_LENGTH: usize = 256;

/// Service bit: full headers node.
pub const NODE_NETWORK: u64 = 1;

/// Handshake must complete within this window.
pub const VERSION_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Keepalive probe period.
pub const PING_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Outstanding ping older than this disconnects the peer.
pub const PING_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// No traffic in either direction for this long disconnects the peer.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// How often the inactivity check runs.
pub const INACTIVITY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of full outbound connections.
pub const DEFAULT_MAX_OUTBOUND_CONNECTIONS: usize = 8;

/// Default number of inbound connections.
pub const DEFAULT_MAX_INBOUND_CONNECTIONS: usize = 125;

/// Wire command names.
pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const INV: &str = "inv";
    pub const GETHEADERS: &str = "getheaders";
    pub const HEADERS: &str = "headers";
    pub const ADDR: &str = "addr";
    pub const GETADDR: &str = "getaddr";
    pub const SENDHEADERS: &str = "sendheaders";
}

/// User agent advertised in `version`.
pub fn user_agent() -> String {
    format!("/Unicity:{}/", env!("CARGO_PKG_VERSION"))
}

/// Network selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Regtest,
}

impl NetworkType {
    /// Magic value opening every message on this network.
    pub fn magic(&self) -> u32 {
        match self {
            NetworkType::Mainnet => 0x554E_4943,
            NetworkType::Testnet => 0xA3F8_D412,
            NetworkType::Regtest => 0x4B7C_2E91,
        }
    }

    /// Default P2P port.
    pub fn default_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => 9590,
            NetworkType::Testnet => 19590,
            NetworkType::Regtest => 29590,
        }
    }

    /// Hardcoded bootstrap peers.
    pub fn fixed_seeds(&self) -> &'static [&'static str] {
        match self {
            NetworkType::Mainnet => &["178.18.251.16:9590"],
            NetworkType::Testnet | NetworkType::Regtest => &[],
        }
    }

    /// Name used in config files and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Regtest => "regtest",
        }
    }
}

impl FromStr for NetworkType {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(NetworkType::Mainnet),
            "testnet" | "test" => Ok(NetworkType::Testnet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(NetworkError::Serialization(format!(
                "unknown network: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 32-byte block identifier, stored in wire (little-endian) order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    /// Parse from display hex (most significant byte first).
    pub fn from_hex(s: &str) -> NetworkResult<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = hex::decode(s)
            .map_err(|e| NetworkError::Serialization(format!("bad hash hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(NetworkError::Serialization(format!(
                "hash must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        bytes.reverse();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(BlockHash(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rev = self.0;
        rev.reverse();
        write!(f, "{}", hex::encode(rev))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self)
    }
}

/// Network address as carried on the wire (no timestamp).
///
/// The IP is always 16 bytes; IPv4 uses the `::ffff:a.b.c.d` mapping.
/// The port is the one big-endian field in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    /// Encoded size in bytes.
    pub const SIZE: usize = 26;

    pub fn new(ip: IpAddr, port: u16, services: u64) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self { services, ip, port }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: u64) -> Self {
        Self::new(addr.ip(), addr.port(), services)
    }

    /// All-zero address, used for `addr_from` in our own `version`.
    pub fn unspecified() -> Self {
        Self {
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    /// IP with IPv4-mapped addresses folded back to IPv4.
    pub fn ip_addr(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr(), self.port)
    }

    pub fn is_unspecified(&self) -> bool {
        self.ip == [0u8; 16] || self.ip_addr() == IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64_le(self.services);
        dst.put_slice(&self.ip);
        dst.put_u16(self.port);
    }

    pub fn decode(src: &mut impl Buf) -> NetworkResult<Self> {
        if src.remaining() < Self::SIZE {
            return Err(NetworkError::InvalidMessage(
                "network address truncated".to_string(),
            ));
        }
        let services = src.get_u64_le();
        let mut ip = [0u8; 16];
        src.copy_to_slice(&mut ip);
        let port = src.get_u16();
        Ok(Self { services, ip, port })
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Address with last-seen time, as carried in `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddress {
    pub timestamp: u32,
    pub address: NetworkAddress,
}

/// Inventory item type for blocks.
pub const MSG_BLOCK: u32 = 2;

/// Typed inventory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    pub kind: u32,
    pub hash: BlockHash,
}

impl InventoryItem {
    pub fn block(hash: BlockHash) -> Self {
        Self {
            kind: MSG_BLOCK,
            hash,
        }
    }

    pub fn is_block(&self) -> bool {
        self.kind == MSG_BLOCK
    }
}

/// Seconds since the Unix epoch.
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse `host:port` into a socket address, using `default_port` when absent.
pub fn parse_peer_address(s: &str, default_port: u16) -> NetworkResult<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    Err(NetworkError::Serialization(format!(
        "invalid peer address: {}",
        s
    )))
}
