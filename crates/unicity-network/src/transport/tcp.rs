//! TCP transport on top of tokio.

use super::{
    AcceptCallback, CallbackSlots, ConnectCallback, Connection, ConnectionRef,
    DisconnectCallback, ReceiveCallback, Transport,
};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, info, instrument, warn};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Outbound connect timeout.
    pub connect_timeout: Duration,
    /// Maximum number of buffers queued for writing per connection.
    pub send_queue_limit: usize,
    /// Address to bind listeners on.
    pub bind_ip: std::net::IpAddr,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_queue_limit: 1024,
            bind_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// A TCP stream split into a reader task and a writer task.
pub struct TcpConnection {
    id: u64,
    remote: SocketAddr,
    inbound: bool,
    send_queue_limit: usize,
    weak_self: Weak<TcpConnection>,
    stream: Mutex<Option<TcpStream>>,
    outbox: Mutex<Option<mpsc::Sender<Bytes>>>,
    callbacks: Mutex<CallbackSlots>,
    reader: Mutex<Option<JoinHandle<()>>>,
    open: AtomicBool,
    started: AtomicBool,
}

impl TcpConnection {
    fn new(id: u64, remote: SocketAddr, inbound: bool, send_queue_limit: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            remote,
            inbound,
            send_queue_limit,
            weak_self: weak.clone(),
            stream: Mutex::new(None),
            outbox: Mutex::new(None),
            callbacks: Mutex::new(CallbackSlots::default()),
            reader: Mutex::new(None),
            open: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    fn attach(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        *self.stream.lock() = Some(stream);
        self.open.store(true, Ordering::SeqCst);
    }

    /// Remote end went away or an I/O error occurred.
    fn handle_remote_close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(conn = self.id, addr = %self.remote, "Connection closed by remote");
        self.outbox.lock().take();
        let callback = self.callbacks.lock().disconnect.take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Connection for TcpConnection {
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
        let Some(stream) = self.stream.lock().take() else {
            warn!(conn = self.id, "start() on a connection with no stream");
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            warn!(conn = self.id, "start() outside a tokio runtime");
            return;
        };

        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(self.send_queue_limit.max(1));
        *self.outbox.lock() = Some(tx);

        let writer_conn = self.weak_self.clone();
        handle.spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    debug!(error = %e, "Write failed");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
            if let Some(conn) = writer_conn.upgrade() {
                conn.handle_remote_close();
            }
        });

        let reader_conn = self.weak_self.clone();
        let reader = handle.spawn(async move {
            let mut framed = FramedRead::new(read_half, BytesCodec::new());
            while let Some(chunk) = framed.next().await {
                let Some(conn) = reader_conn.upgrade() else {
                    return;
                };
                match chunk {
                    Ok(data) => {
                        let callback = conn.callbacks.lock().receive.clone();
                        if let Some(callback) = callback {
                            callback(data.freeze());
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Read failed");
                        break;
                    }
                }
            }
            if let Some(conn) = reader_conn.upgrade() {
                conn.handle_remote_close();
            }
        });

        *self.reader.lock() = Some(reader);
    }

    fn send(&self, data: Bytes) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        let outbox = self.outbox.lock();
        match outbox.as_ref() {
            Some(tx) => match tx.try_send(data) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn = self.id, addr = %self.remote, "Send queue full");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender lets the writer flush what is queued, then shut down.
        self.outbox.lock().take();
        self.stream.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
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

/// Tokio-backed TCP transport.
pub struct TcpTransport {
    config: TcpTransportConfig,
    next_id: Arc<AtomicU64>,
    stopped: AtomicBool,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: Arc<ConnectionList>,
}

/// Every connection a transport created, outbound and accepted.
#[derive(Default)]
struct ConnectionList(Mutex<Vec<Weak<TcpConnection>>>);

impl ConnectionList {
    fn track(&self, conn: &Arc<TcpConnection>) {
        let mut connections = self.0.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.push(Arc::downgrade(conn));
    }

    fn close_all(&self) {
        let connections: Vec<_> = self.0.lock().drain(..).collect();
        for conn in connections.into_iter().filter_map(|c| c.upgrade()) {
            conn.close();
        }
    }
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            next_id: Arc::new(AtomicU64::new(1)),
            stopped: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
            connections: Arc::new(ConnectionList::default()),
        })
    }

    /// Address the listener is bound to, once `listen` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

impl Transport for TcpTransport {
    #[instrument(skip(self, on_complete))]
    fn connect(&self, addr: SocketAddr, on_complete: ConnectCallback) -> Option<ConnectionRef> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        let handle = Handle::try_current().ok()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = TcpConnection::new(id, addr, false, self.config.send_queue_limit);
        self.connections.track(&conn);

        let pending = Arc::clone(&conn);
        let timeout = self.config.connect_timeout;
        handle.spawn(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(%addr, "TCP connected");
                    pending.attach(stream);
                    on_complete(true);
                }
                Ok(Err(e)) => {
                    debug!(%addr, error = %e, "TCP connect failed");
                    on_complete(false);
                }
                Err(_) => {
                    debug!(%addr, "TCP connect timed out");
                    on_complete(false);
                }
            }
        });

        Some(conn)
    }

    fn listen(&self, port: u16, on_accept: AcceptCallback) -> bool {
        let Ok(handle) = Handle::try_current() else {
            return false;
        };
        let bind = SocketAddr::new(self.config.bind_ip, port);
        let std_listener = match std::net::TcpListener::bind(bind) {
            Ok(l) => l,
            Err(e) => {
                warn!(addr = %bind, error = %e, "Failed to bind listener");
                return false;
            }
        };
        if std_listener.set_nonblocking(true).is_err() {
            return false;
        }
        let listener = {
            let _guard = handle.enter();
            match TcpListener::from_std(std_listener) {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "Failed to register listener");
                    return false;
                }
            }
        };
        let local = listener.local_addr().ok();
        *self.local_addr.lock() = local;
        info!(addr = ?local, "Listening for inbound connections");

        let queue_limit = self.config.send_queue_limit;
        let next_id = Arc::clone(&self.next_id);
        let connections = Arc::clone(&self.connections);
        let task = handle.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        let conn = TcpConnection::new(id, remote, true, queue_limit);
                        conn.attach(stream);
                        connections.track(&conn);
                        on_accept(conn);
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        self.listeners.lock().push(task);
        true
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.listeners.lock().drain(..) {
            task.abort();
        }
        self.connections.close_all();
    }
}
