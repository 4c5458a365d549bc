//! In-process transport for tests and simulations.
//!
//! Two modes share one implementation:
//!
//! - **Scripted**: a lone [`MemoryTransport`] records connect attempts as pending
//!   and lets the caller resolve them; bytes are fed in with
//!   [`MemoryConnection::deliver`] and everything sent is kept for inspection.
//! - **Linked**: transports registered on a [`MemoryNetwork`] reach each other by
//!   address. Each direction of a linked pair is pumped by its own task, so
//!   delivery is ordered and never re-enters the sender.

use super::{
    AcceptCallback, CallbackSlots, ConnectCallback, Connection, ConnectionRef,
    DisconnectCallback, ReceiveCallback, Transport,
};
use crate::codec::MessageCodec;
use crate::message::Message;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

enum LinkEvent {
    Data(Bytes),
    Close,
}

/// One end of an in-memory byte stream.
pub struct MemoryConnection {
    id: u64,
    remote: SocketAddr,
    inbound: bool,
    open: AtomicBool,
    started: AtomicBool,
    fail_sends: AtomicBool,
    callbacks: Mutex<CallbackSlots>,
    inbox: Mutex<Vec<Bytes>>,
    sent: Mutex<Vec<Bytes>>,
    link: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
}

impl MemoryConnection {
    pub fn new(id: u64, remote: SocketAddr, inbound: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote,
            inbound,
            open: AtomicBool::new(true),
            started: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            callbacks: Mutex::new(CallbackSlots::default()),
            inbox: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            link: Mutex::new(None),
        })
    }

    /// Feed bytes as if they arrived from the remote side.
    ///
    /// Bytes delivered before `start()` are buffered.
    pub fn deliver(&self, data: Bytes) {
        if !self.open.load(Ordering::SeqCst) {
            return;
        }
        if !self.started.load(Ordering::SeqCst) {
            self.inbox.lock().push(data);
            return;
        }
        let callback = self.callbacks.lock().receive.clone();
        if let Some(callback) = callback {
            callback(data);
        }
    }

    /// Simulate the remote side hanging up.
    pub fn remote_close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.link.lock().take();
        let callback = self.callbacks.lock().disconnect.take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Make every subsequent `send` fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Raw buffers passed to `send`, in order.
    pub fn sent_bytes(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Decode everything sent so far as framed messages.
    pub fn sent_messages(&self, magic: u32) -> Vec<Message> {
        let mut buf = BytesMut::new();
        for chunk in self.sent.lock().iter() {
            buf.extend_from_slice(chunk);
        }
        let mut codec = MessageCodec::new(magic);
        let mut out = Vec::new();
        while let Ok(Some(msg)) = codec.decode(&mut buf) {
            out.push(msg);
        }
        out
    }

    /// Commands of everything sent so far.
    pub fn sent_commands(&self, magic: u32) -> Vec<String> {
        self.sent_messages(magic)
            .iter()
            .map(|m| m.command().to_string())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn has_callbacks(&self) -> bool {
        let slots = self.callbacks.lock();
        slots.receive.is_some() || slots.disconnect.is_some()
    }

    fn attach_link(&self, link: mpsc::UnboundedSender<LinkEvent>) {
        *self.link.lock() = Some(link);
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn is_inbound(&self) -> bool {
        self.inbound
    }

    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let buffered: Vec<Bytes> = self.inbox.lock().drain(..).collect();
        for data in buffered {
            self.deliver(data);
        }
    }

    fn send(&self, data: Bytes) -> bool {
        if !self.open.load(Ordering::SeqCst) || self.fail_sends.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().push(data.clone());
        if let Some(link) = self.link.lock().as_ref() {
            let _ = link.send(LinkEvent::Data(data));
        }
        true
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = self.link.lock().take() {
            let _ = link.send(LinkEvent::Close);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) {
        self.callbacks.lock().receive = Some(callback);
    }

    fn set_disconnect_callback(&self, callback: DisconnectCallback) {
        self.callbacks.lock().disconnect = Some(callback);
    }

    fn clear_callbacks(&self) {
        self.callbacks.lock().clear();
    }
}

/// Forward events from one end of a pair to the other.
fn spawn_pump(mut rx: mpsc::UnboundedReceiver<LinkEvent>, to: Weak<MemoryConnection>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(conn) = to.upgrade() else {
                return;
            };
            match event {
                LinkEvent::Data(data) => conn.deliver(data),
                LinkEvent::Close => {
                    conn.remote_close();
                    return;
                }
            }
        }
    });
}

/// Wire two connections together. Must run inside a tokio runtime.
fn link_pair(a: &Arc<MemoryConnection>, b: &Arc<MemoryConnection>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    a.attach_link(a_tx);
    b.attach_link(b_tx);
    spawn_pump(a_rx, Arc::downgrade(b));
    spawn_pump(b_rx, Arc::downgrade(a));
}

struct PendingConnect {
    connection: Arc<MemoryConnection>,
    on_complete: ConnectCallback,
}

/// Registry of linked transports, keyed by listen address.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: Mutex<HashMap<SocketAddr, Weak<MemoryTransport>>>,
    next_id: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport reachable at `local_addr`.
    pub fn transport(self: &Arc<Self>, local_addr: SocketAddr) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport::with_network(Arc::clone(self), local_addr));
        self.nodes
            .lock()
            .insert(local_addr, Arc::downgrade(&transport));
        transport
    }

    fn lookup(&self, addr: &SocketAddr) -> Option<Arc<MemoryTransport>> {
        self.nodes.lock().get(addr).and_then(Weak::upgrade)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-memory [`Transport`].
pub struct MemoryTransport {
    network: Option<Arc<MemoryNetwork>>,
    local_addr: SocketAddr,
    next_id: AtomicU64,
    stopped: AtomicBool,
    refuse_connects: AtomicBool,
    pending: Mutex<Vec<PendingConnect>>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    attempts: Mutex<Vec<SocketAddr>>,
    on_accept: Mutex<Option<AcceptCallback>>,
}

impl MemoryTransport {
    /// Scripted transport not attached to any network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None, SocketAddr::from(([127, 0, 0, 1], 0))))
    }

    fn with_network(network: Arc<MemoryNetwork>, local_addr: SocketAddr) -> Self {
        Self::build(Some(network), local_addr)
    }

    fn build(network: Option<Arc<MemoryNetwork>>, local_addr: SocketAddr) -> Self {
        Self {
            network,
            local_addr,
            next_id: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            refuse_connects: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            on_accept: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn allocate_id(&self) -> u64 {
        match &self.network {
            Some(network) => network.allocate_id(),
            None => self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    /// Make `connect` return `None` from now on.
    pub fn set_refuse_connects(&self, refuse: bool) {
        self.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// Addresses passed to `connect`, in order.
    pub fn connect_attempts(&self) -> Vec<SocketAddr> {
        self.attempts.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Resolve the oldest pending connect attempt.
    pub fn complete_next(&self, success: bool) -> Option<Arc<MemoryConnection>> {
        let pending = {
            let mut queue = self.pending.lock();
            if queue.is_empty() {
                return None;
            }
            queue.remove(0)
        };
        if !success {
            pending.connection.open.store(false, Ordering::SeqCst);
        }
        (pending.on_complete)(success);
        Some(pending.connection)
    }

    /// Resolve every pending connect attempt the same way.
    pub fn complete_all(&self, success: bool) -> Vec<Arc<MemoryConnection>> {
        let mut out = Vec::new();
        while let Some(conn) = self.complete_next(success) {
            out.push(conn);
        }
        out
    }

    /// Hand an inbound connection from `remote` to the accept callback.
    pub fn inject_inbound(&self, remote: SocketAddr) -> Option<Arc<MemoryConnection>> {
        let callback = self.on_accept.lock().clone()?;
        let conn = MemoryConnection::new(self.allocate_id(), remote, true);
        self.connections.lock().push(Arc::clone(&conn));
        callback(conn.clone());
        Some(conn)
    }

    /// Every connection this transport created, in creation order.
    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        self.connections.lock().clone()
    }

    pub fn connection_to(&self, addr: &SocketAddr) -> Option<Arc<MemoryConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.remote == *addr)
            .cloned()
    }

    fn accept_linked(&self, conn: Arc<MemoryConnection>) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let Some(callback) = self.on_accept.lock().clone() else {
            return false;
        };
        self.connections.lock().push(Arc::clone(&conn));
        callback(conn);
        true
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, addr: SocketAddr, on_complete: ConnectCallback) -> Option<ConnectionRef> {
        if self.stopped.load(Ordering::SeqCst) || self.refuse_connects.load(Ordering::SeqCst) {
            return None;
        }
        self.attempts.lock().push(addr);
        let conn = MemoryConnection::new(self.allocate_id(), addr, false);
        self.connections.lock().push(Arc::clone(&conn));

        match &self.network {
            None => {
                self.pending.lock().push(PendingConnect {
                    connection: Arc::clone(&conn),
                    on_complete,
                });
            }
            Some(network) => {
                let remote = network.lookup(&addr);
                let local_addr = self.local_addr;
                let outbound = Arc::clone(&conn);
                let accepted_id = network.allocate_id();
                tokio::spawn(async move {
                    let accepted = remote.and_then(|remote| {
                        let inbound = MemoryConnection::new(accepted_id, local_addr, true);
                        link_pair(&outbound, &inbound);
                        remote.accept_linked(inbound.clone()).then_some(inbound)
                    });
                    if accepted.is_none() {
                        outbound.open.store(false, Ordering::SeqCst);
                        outbound.link.lock().take();
                    }
                    on_complete(accepted.is_some());
                });
            }
        }
        Some(conn)
    }

    fn listen(&self, _port: u16, on_accept: AcceptCallback) -> bool {
        *self.on_accept.lock() = Some(on_accept);
        true
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.on_accept.lock().take();
        self.pending.lock().clear();
        for conn in self.connections.lock().iter() {
            conn.close();
        }
    }
}
