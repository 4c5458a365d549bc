//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Message header could not be parsed.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Message payload could not be parsed.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Network magic mismatch.
    #[error("Network magic mismatch: expected {expected:#010x}, got {got:#010x}")]
    MagicMismatch { expected: u32, got: u32 },

    /// Payload checksum mismatch.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Address is banned or discouraged.
    #[error("Peer banned: {0}")]
    PeerBanned(String),

    /// Already connected to this address.
    #[error("Already connected: {0}")]
    AlreadyConnected(String),

    /// Too many connections.
    #[error("Too many connections: {count}, max {max}")]
    TooManyConnections { count: usize, max: usize },

    /// Service is not running.
    #[error("Network service not running")]
    NotRunning,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
