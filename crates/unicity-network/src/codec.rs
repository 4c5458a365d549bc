//! Wire framing for the Unicity P2P protocol.
//!
//! Every message is a fixed 24-byte header followed by the payload:
//!
//! ```text
//! +----------+--------------+----------+----------+
//! |  Magic   |   Command    |  Length  | Checksum |
//! | 4 bytes  |   12 bytes   | 4 bytes  | 4 bytes  |
//! +----------+--------------+----------+----------+
//! |                   Payload                     |
//! +-----------------------------------------------+
//! ```
//!
//! - Magic: network identifier, little-endian
//! - Command: ASCII, NUL-padded
//! - Length: payload length, little-endian
//! - Checksum: first 4 bytes of SHA-256(SHA-256(payload))

use crate::message::Message;
use crate::protocol::{CHECKSUM_SIZE, COMMAND_SIZE, MAX_PROTOCOL_MESSAGE_LENGTH, MESSAGE_HEADER_SIZE};
use crate::{NetworkError, NetworkResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

/// Parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub command: [u8; COMMAND_SIZE],
    pub length: u32,
    pub checksum: [u8; CHECKSUM_SIZE],
}

impl MessageHeader {
    /// Build a header for `payload`.
    pub fn new(magic: u32, command: &str, payload: &[u8]) -> NetworkResult<Self> {
        if command.is_empty() || command.len() > COMMAND_SIZE || !command.is_ascii() {
            return Err(NetworkError::InvalidHeader(format!(
                "bad command name {:?}",
                command
            )));
        }
        let mut cmd = [0u8; COMMAND_SIZE];
        cmd[..command.len()].copy_from_slice(command.as_bytes());
        Ok(Self {
            magic,
            command: cmd,
            length: payload.len() as u32,
            checksum: checksum(payload),
        })
    }

    /// Command name with the padding stripped.
    pub fn command(&self) -> String {
        let end = self
            .command
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(COMMAND_SIZE);
        String::from_utf8_lossy(&self.command[..end]).into_owned()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.magic);
        dst.put_slice(&self.command);
        dst.put_u32_le(self.length);
        dst.put_slice(&self.checksum);
    }
}

/// First four bytes of the double SHA-256 of `payload`.
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let hash = Sha256::digest(Sha256::digest(payload));
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&hash[..CHECKSUM_SIZE]);
    out
}

pub fn verify_checksum(payload: &[u8], expected: &[u8; CHECKSUM_SIZE]) -> bool {
    checksum(payload) == *expected
}

/// Parse a header from the first 24 bytes of `src`.
///
/// Only structure is checked here: the command field must be printable ASCII
/// followed solely by NUL padding. Magic and length policy belong to the caller.
pub fn decode_header(src: &[u8]) -> NetworkResult<MessageHeader> {
    if src.len() < MESSAGE_HEADER_SIZE {
        return Err(NetworkError::InvalidHeader(format!(
            "need {} bytes, have {}",
            MESSAGE_HEADER_SIZE,
            src.len()
        )));
    }
    let mut buf = &src[..MESSAGE_HEADER_SIZE];
    let magic = buf.get_u32_le();
    let mut command = [0u8; COMMAND_SIZE];
    buf.copy_to_slice(&mut command);
    let length = buf.get_u32_le();
    let mut checksum = [0u8; CHECKSUM_SIZE];
    buf.copy_to_slice(&mut checksum);

    let mut seen_nul = false;
    for b in command {
        if b == 0 {
            seen_nul = true;
        } else if seen_nul || !(0x20..0x7f).contains(&b) {
            return Err(NetworkError::InvalidHeader(
                "malformed command field".to_string(),
            ));
        }
    }
    if command[0] == 0 {
        return Err(NetworkError::InvalidHeader("empty command".to_string()));
    }

    Ok(MessageHeader {
        magic,
        command,
        length,
        checksum,
    })
}

/// Frame `payload` under `command`.
pub fn encode(magic: u32, command: &str, payload: &[u8]) -> NetworkResult<Bytes> {
    if payload.len() > MAX_PROTOCOL_MESSAGE_LENGTH {
        return Err(NetworkError::MessageTooLarge {
            size: payload.len(),
            max: MAX_PROTOCOL_MESSAGE_LENGTH,
        });
    }
    let header = MessageHeader::new(magic, command, payload)?;
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Frame a typed message.
pub fn encode_message(magic: u32, message: &Message) -> NetworkResult<Bytes> {
    let payload = message.encode_payload()?;
    encode(magic, message.command(), &payload)
}

/// Stream codec over complete frames.
///
/// The peer state machine does its own incremental parsing so it can apply
/// flood and handshake policy per frame; this codec serves tools and tests that
/// want a plain `Framed` stream.
pub struct MessageCodec {
    magic: u32,
    max_size: usize,
}

impl MessageCodec {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            max_size: MAX_PROTOCOL_MESSAGE_LENGTH,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MESSAGE_HEADER_SIZE {
            return Ok(None);
        }

        let header = decode_header(src)?;
        if header.magic != self.magic {
            return Err(NetworkError::MagicMismatch {
                expected: self.magic,
                got: header.magic,
            });
        }

        let length = header.length as usize;
        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total = MESSAGE_HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(MESSAGE_HEADER_SIZE);
        let payload = src.split_to(length).freeze();
        if !verify_checksum(&payload, &header.checksum) {
            return Err(NetworkError::ChecksumMismatch);
        }

        Message::decode(&header.command(), payload).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload()?;
        if payload.len() > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: payload.len(),
                max: self.max_size,
            });
        }
        let header = MessageHeader::new(self.magic, item.command(), &payload)?;
        dst.reserve(MESSAGE_HEADER_SIZE + payload.len());
        header.encode(dst);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NetworkType;

    const MAGIC: u32 = 0x554E_4943;

    #[test]
    fn test_header_layout() {
        let frame = encode(MAGIC, "verack", &[]).unwrap();
        assert_eq!(frame.len(), MESSAGE_HEADER_SIZE);
        assert_eq!(&frame[0..4], &MAGIC.to_le_bytes());
        assert_eq!(&frame[4..10], b"verack");
        assert!(frame[10..16].iter().all(|b| *b == 0));
        assert_eq!(&frame[16..20], &[0, 0, 0, 0]);
        // double sha256 of the empty string starts with 5df6e0e2
        assert_eq!(&frame[20..24], &[0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_decode_header() {
        let frame = encode(MAGIC, "ping", &[7u8; 8]).unwrap();
        let header = decode_header(&frame).unwrap();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.command(), "ping");
        assert_eq!(header.length, 8);
        assert!(verify_checksum(&frame[24..], &header.checksum));
    }

    #[test]
    fn test_decode_header_rejects_garbage_after_nul() {
        let mut frame = BytesMut::from(&encode(MAGIC, "ping", &[0u8; 8]).unwrap()[..]);
        frame[10] = b'x';
        assert!(matches!(
            decode_header(&frame),
            Err(NetworkError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_command_too_long() {
        assert!(encode(MAGIC, "thirteenchars", &[]).is_err());
    }

    #[test]
    fn test_codec_stream() {
        let mut codec = MessageCodec::new(NetworkType::Mainnet.magic());
        let mut buf = BytesMut::new();
        codec.encode(Message::Ping(99), &mut buf).unwrap();
        codec.encode(Message::Verack, &mut buf).unwrap();

        let mut partial = buf.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Message::Ping(99)));
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Message::Verack));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_codec_wrong_magic() {
        let frame = encode(0x1234_5678, "verack", &[]).unwrap();
        let mut codec = MessageCodec::new(MAGIC);
        let mut buf = BytesMut::from(&frame[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::MagicMismatch { .. })
        ));
    }

    #[test]
    fn test_codec_bad_checksum() {
        let mut frame = BytesMut::from(&encode(MAGIC, "ping", &[1u8; 8]).unwrap()[..]);
        frame[30] ^= 0xff;
        let mut codec = MessageCodec::new(MAGIC);
        assert!(matches!(
            codec.decode(&mut frame),
            Err(NetworkError::ChecksumMismatch)
        ));
    }
}
