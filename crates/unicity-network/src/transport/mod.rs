//! Byte-stream transport abstraction.
//!
//! The protocol engine never touches sockets directly. A [`Transport`] opens and
//! accepts [`Connection`]s; a connection delivers raw bytes through callbacks and
//! accepts raw bytes for sending. Framing happens above this layer.

pub mod memory;
pub mod tcp;

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

pub use memory::{MemoryConnection, MemoryNetwork, MemoryTransport};
pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};

/// Invoked with each chunk of received bytes.
pub type ReceiveCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Invoked once when the remote side goes away.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Invoked once when an outbound connect attempt resolves.
pub type ConnectCallback = Box<dyn FnOnce(bool) + Send>;

/// Invoked for every accepted inbound connection.
pub type AcceptCallback = Arc<dyn Fn(ConnectionRef) + Send + Sync>;

/// Shared connection handle.
pub type ConnectionRef = Arc<dyn Connection>;

/// A single bidirectional byte stream.
pub trait Connection: Send + Sync {
    /// Transport-local identifier.
    fn id(&self) -> u64;

    fn remote_addr(&self) -> SocketAddr;

    fn is_inbound(&self) -> bool;

    /// Begin delivering received bytes to the receive callback.
    fn start(&self);

    /// Queue bytes for sending. Returns `false` if the connection cannot take them.
    fn send(&self, data: Bytes) -> bool;

    /// Close the stream. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;

    fn set_receive_callback(&self, callback: ReceiveCallback);

    fn set_disconnect_callback(&self, callback: DisconnectCallback);

    /// Drop both callbacks so nothing fires after teardown.
    fn clear_callbacks(&self);
}

/// Opens outbound and accepts inbound connections.
pub trait Transport: Send + Sync {
    /// Start connecting to `addr`.
    ///
    /// Returns the connection handle immediately; `on_complete` fires once the
    /// attempt resolves. `None` means the attempt could not even be started.
    fn connect(&self, addr: SocketAddr, on_complete: ConnectCallback) -> Option<ConnectionRef>;

    /// Listen on `port`, handing each accepted connection to `on_accept`.
    fn listen(&self, port: u16, on_accept: AcceptCallback) -> bool;

    /// Stop listening and close every connection this transport created.
    fn stop(&self);
}

/// Callback slots shared by the transport implementations.
#[derive(Default)]
pub(crate) struct CallbackSlots {
    pub receive: Option<ReceiveCallback>,
    pub disconnect: Option<DisconnectCallback>,
}

impl CallbackSlots {
    pub fn clear(&mut self) {
        self.receive = None;
        self.disconnect = None;
    }
}
