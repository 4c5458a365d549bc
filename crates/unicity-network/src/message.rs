//! Typed protocol messages.
//!
//! Known commands decode into a closed [`Message`] enum. Anything else is kept
//! as [`Message::Unknown`] so the caller can route or drop it.

use crate::protocol::{
    commands, BlockHash, InventoryItem, NetworkAddress, TimestampedAddress, MAX_ADDR_SIZE,
    MAX_INV_SIZE, MAX_LOCATOR_SZ, MAX_SIZE, MAX_SUBVERSION_LENGTH,
};
use crate::{NetworkError, NetworkResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// `version` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
}

/// `getheaders` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locator: Vec<BlockHash>,
    pub hash_stop: BlockHash,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<InventoryItem>),
    GetHeaders(GetHeadersMessage),
    /// Raw `headers` payload, interpreted by header sync.
    Headers(Bytes),
    Addr(Vec<TimestampedAddress>),
    GetAddr,
    SendHeaders,
    /// Command not in the built-in set.
    Unknown { command: String, payload: Bytes },
}

impl Message {
    /// Wire command name.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => commands::VERSION,
            Message::Verack => commands::VERACK,
            Message::Ping(_) => commands::PING,
            Message::Pong(_) => commands::PONG,
            Message::Inv(_) => commands::INV,
            Message::GetHeaders(_) => commands::GETHEADERS,
            Message::Headers(_) => commands::HEADERS,
            Message::Addr(_) => commands::ADDR,
            Message::GetAddr => commands::GETADDR,
            Message::SendHeaders => commands::SENDHEADERS,
            Message::Unknown { command, .. } => command,
        }
    }

    /// Whether `command` is one of the built-in commands.
    pub fn is_known_command(command: &str) -> bool {
        matches!(
            command,
            commands::VERSION
                | commands::VERACK
                | commands::PING
                | commands::PONG
                | commands::INV
                | commands::GETHEADERS
                | commands::HEADERS
                | commands::ADDR
                | commands::GETADDR
                | commands::SENDHEADERS
        )
    }

    /// Commands that may legitimately carry an empty payload.
    pub fn allows_empty_payload(command: &str) -> bool {
        matches!(
            command,
            commands::VERACK | commands::GETADDR | commands::SENDHEADERS
        )
    }

    /// Serialize the payload (without the wire header).
    pub fn encode_payload(&self) -> NetworkResult<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Message::Version(v) => {
                if v.user_agent.len() > MAX_SUBVERSION_LENGTH {
                    return Err(NetworkError::InvalidMessage(format!(
                        "user agent too long: {}",
                        v.user_agent.len()
                    )));
                }
                buf.put_i32_le(v.version);
                buf.put_u64_le(v.services);
                buf.put_i64_le(v.timestamp);
                v.addr_recv.encode(&mut buf);
                v.addr_from.encode(&mut buf);
                buf.put_u64_le(v.nonce);
                write_var_string(&mut buf, &v.user_agent);
                buf.put_i32_le(v.start_height);
            }
            Message::Verack | Message::GetAddr | Message::SendHeaders => {}
            Message::Ping(nonce) | Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::Inv(items) => {
                if items.len() > MAX_INV_SIZE {
                    return Err(NetworkError::MessageTooLarge {
                        size: items.len(),
                        max: MAX_INV_SIZE,
                    });
                }
                write_compact_size(&mut buf, items.len() as u64);
                for item in items {
                    buf.put_u32_le(item.kind);
                    buf.put_slice(item.hash.as_bytes());
                }
            }
            Message::GetHeaders(m) => {
                if m.locator.len() > MAX_LOCATOR_SZ {
                    return Err(NetworkError::MessageTooLarge {
                        size: m.locator.len(),
                        max: MAX_LOCATOR_SZ,
                    });
                }
                buf.put_u32_le(m.version);
                write_compact_size(&mut buf, m.locator.len() as u64);
                for hash in &m.locator {
                    buf.put_slice(hash.as_bytes());
                }
                buf.put_slice(m.hash_stop.as_bytes());
            }
            Message::Headers(raw) => buf.put_slice(raw),
            Message::Addr(addrs) => {
                if addrs.len() > MAX_ADDR_SIZE {
                    return Err(NetworkError::MessageTooLarge {
                        size: addrs.len(),
                        max: MAX_ADDR_SIZE,
                    });
                }
                write_compact_size(&mut buf, addrs.len() as u64);
                for ta in addrs {
                    buf.put_u32_le(ta.timestamp);
                    ta.address.encode(&mut buf);
                }
            }
            Message::Unknown { payload, .. } => buf.put_slice(payload),
        }
        Ok(buf.freeze())
    }

    /// Decode a payload for `command`. Unrecognized commands yield `Unknown`.
    pub fn decode(command: &str, payload: Bytes) -> NetworkResult<Self> {
        let mut src = payload.clone();
        let msg = match command {
            commands::VERSION => {
                // Trailing fields from newer peers are tolerated.
                return decode_version(&mut src).map(Message::Version);
            }
            commands::VERACK => Message::Verack,
            commands::GETADDR => Message::GetAddr,
            commands::SENDHEADERS => Message::SendHeaders,
            commands::PING => Message::Ping(read_u64(&mut src)?),
            commands::PONG => Message::Pong(read_u64(&mut src)?),
            commands::INV => {
                let count = read_compact_size(&mut src)? as usize;
                if count > MAX_INV_SIZE {
                    return Err(NetworkError::MessageTooLarge {
                        size: count,
                        max: MAX_INV_SIZE,
                    });
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    ensure(&src, 36, "inv item")?;
                    let kind = src.get_u32_le();
                    let hash = read_hash(&mut src)?;
                    items.push(InventoryItem { kind, hash });
                }
                Message::Inv(items)
            }
            commands::GETHEADERS => {
                ensure(&src, 4, "getheaders version")?;
                let version = src.get_u32_le();
                let count = read_compact_size(&mut src)? as usize;
                if count > MAX_LOCATOR_SZ {
                    return Err(NetworkError::MessageTooLarge {
                        size: count,
                        max: MAX_LOCATOR_SZ,
                    });
                }
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    locator.push(read_hash(&mut src)?);
                }
                let hash_stop = read_hash(&mut src)?;
                Message::GetHeaders(GetHeadersMessage {
                    version,
                    locator,
                    hash_stop,
                })
            }
            commands::HEADERS => return Ok(Message::Headers(payload)),
            commands::ADDR => {
                let count = read_compact_size(&mut src)? as usize;
                // Oversized lists are a policy matter for the receiver, not a framing error.
                let mut addrs = Vec::with_capacity(count.min(MAX_ADDR_SIZE));
                for _ in 0..count {
                    ensure(&src, 4 + NetworkAddress::SIZE, "addr entry")?;
                    let timestamp = src.get_u32_le();
                    let address = NetworkAddress::decode(&mut src)?;
                    addrs.push(TimestampedAddress { timestamp, address });
                }
                Message::Addr(addrs)
            }
            other => {
                return Ok(Message::Unknown {
                    command: other.to_string(),
                    payload,
                })
            }
        };
        if src.has_remaining() {
            return Err(NetworkError::InvalidMessage(format!(
                "{} has {} trailing bytes",
                command,
                src.remaining()
            )));
        }
        Ok(msg)
    }
}

fn decode_version(src: &mut Bytes) -> NetworkResult<VersionMessage> {
    ensure(src, 20, "version header fields")?;
    let version = src.get_i32_le();
    let services = src.get_u64_le();
    let timestamp = src.get_i64_le();
    let addr_recv = NetworkAddress::decode(src)?;
    let addr_from = NetworkAddress::decode(src)?;
    let nonce = read_u64(src)?;
    let user_agent = read_var_string(src, MAX_SUBVERSION_LENGTH)?;
    ensure(src, 4, "start height")?;
    let start_height = src.get_i32_le();
    Ok(VersionMessage {
        version,
        services,
        timestamp,
        addr_recv,
        addr_from,
        nonce,
        user_agent,
        start_height,
    })
}

fn ensure(src: &impl Buf, n: usize, what: &str) -> NetworkResult<()> {
    if src.remaining() < n {
        return Err(NetworkError::InvalidMessage(format!("{} truncated", what)));
    }
    Ok(())
}

fn read_u64(src: &mut impl Buf) -> NetworkResult<u64> {
    ensure(src, 8, "u64")?;
    Ok(src.get_u64_le())
}

fn read_hash(src: &mut impl Buf) -> NetworkResult<BlockHash> {
    ensure(src, 32, "hash")?;
    let mut hash = [0u8; 32];
    src.copy_to_slice(&mut hash);
    Ok(BlockHash(hash))
}

/// Write a Bitcoin-style CompactSize integer.
pub fn write_compact_size(dst: &mut BytesMut, n: u64) {
    if n < 0xfd {
        dst.put_u8(n as u8);
    } else if n <= 0xffff {
        dst.put_u8(0xfd);
        dst.put_u16_le(n as u16);
    } else if n <= 0xffff_ffff {
        dst.put_u8(0xfe);
        dst.put_u32_le(n as u32);
    } else {
        dst.put_u8(0xff);
        dst.put_u64_le(n);
    }
}

/// Read a CompactSize, rejecting non-canonical encodings and values above `MAX_SIZE`.
pub fn read_compact_size(src: &mut impl Buf) -> NetworkResult<u64> {
    ensure(src, 1, "compact size")?;
    let prefix = src.get_u8();
    let (value, min) = match prefix {
        0xfd => {
            ensure(src, 2, "compact size")?;
            (src.get_u16_le() as u64, 0xfd)
        }
        0xfe => {
            ensure(src, 4, "compact size")?;
            (src.get_u32_le() as u64, 0x1_0000)
        }
        0xff => {
            ensure(src, 8, "compact size")?;
            (src.get_u64_le(), 0x1_0000_0000)
        }
        n => (n as u64, 0),
    };
    if value < min {
        return Err(NetworkError::InvalidMessage(
            "non-canonical compact size".to_string(),
        ));
    }
    if value > MAX_SIZE {
        return Err(NetworkError::MessageTooLarge {
            size: value as usize,
            max: MAX_SIZE as usize,
        });
    }
    Ok(value)
}

fn write_var_string(dst: &mut BytesMut, s: &str) {
    write_compact_size(dst, s.len() as u64);
    dst.put_slice(s.as_bytes());
}

fn read_var_string(src: &mut impl Buf, max: usize) -> NetworkResult<String> {
    let len = read_compact_size(src)? as usize;
    if len > max {
        return Err(NetworkError::MessageTooLarge { size: len, max });
    }
    ensure(src, len, "string")?;
    let bytes = src.copy_to_bytes(len);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
