//! Endpoint — a set of sockets addressed by serial.
//!
//! One endpoint multiplexes a listening socket plus any number of data
//! sockets. Every socket gets a process-unique serial at accept or connect
//! time; the serial is the only addressing token callers ever see. Each data
//! socket owns a reader task feeding a per-socket queue, and the endpoint
//! keeps a fan-in signal so [`Endpoint::recv_any`] can sleep without polling.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::connection::{run_reader, Connection, ReadEnd};
use crate::frame::{FrameError, MAX_FRAME};

type SocketHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Serial-addressed socket set. Cheap to clone; clones share the sockets.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

struct Inner {
    /// Next serial to hand out. Serials are never reused in-process.
    next_serial: AtomicU64,
    /// Data sockets by serial.
    data: DashMap<u64, Arc<Connection>>,
    /// Listening sockets by serial.
    listeners: DashMap<u64, ListenerEntry>,
    /// Fan-in signal: pulsed whenever any data socket enqueues a frame.
    data_ready: Notify,
    /// Serial served most recently by recv_any, for round-robin fairness.
    last_served: AtomicU64,
    on_connect: std::sync::Mutex<Option<SocketHook>>,
    on_disconnect: std::sync::Mutex<Option<SocketHook>>,
}

struct ListenerEntry {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Drop for ListenerEntry {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_serial: AtomicU64::new(1),
                data: DashMap::new(),
                listeners: DashMap::new(),
                data_ready: Notify::new(),
                last_served: AtomicU64::new(0),
                on_connect: std::sync::Mutex::new(None),
                on_disconnect: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Install a hook invoked with the serial of every new data socket.
    pub fn on_connect(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.inner.on_connect.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Install a hook invoked with the serial of every closed data socket.
    pub fn on_disconnect(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.inner.on_disconnect.lock().unwrap() = Some(Arc::new(hook));
    }

    // ── Socket setup ─────────────────────────────────────────────────────────

    /// Bind a listening socket and start accepting. Returns the listener's
    /// serial.
    pub async fn bind(&self, addr: &str, port: u16) -> Result<u64, NetError> {
        let listener = TcpListener::bind((addr, port)).await?;
        let local_addr = listener.local_addr()?;
        let serial = self.inner.fresh_serial();

        let weak = Arc::downgrade(&self.inner);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let Some(inner) = weak.upgrade() else { return };
                        let serial = Inner::register_stream(&inner, stream, peer);
                        tracing::debug!(serial, %peer, "accepted connection");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        self.inner
            .listeners
            .insert(serial, ListenerEntry { local_addr, accept_task });
        tracing::debug!(serial, %local_addr, "listening");
        Ok(serial)
    }

    /// Local address of a listener created by [`Endpoint::bind`].
    pub fn listener_addr(&self, serial: u64) -> Result<SocketAddr, NetError> {
        self.inner
            .listeners
            .get(&serial)
            .map(|e| e.local_addr)
            .ok_or(NetError::UnknownSerial(serial))
    }

    /// Connect to a remote endpoint. Returns the data socket's serial.
    pub async fn connect(&self, addr: &str, port: u16) -> Result<u64, NetError> {
        let stream = TcpStream::connect((addr, port)).await?;
        let peer = stream.peer_addr()?;
        let serial = Inner::register_stream(&self.inner, stream, peer);
        tracing::debug!(serial, %peer, "connected");
        Ok(serial)
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    /// Send a payload on a data socket, chunking into frames as needed.
    pub async fn send(&self, payload: &[u8], serial: u64) -> Result<(), NetError> {
        let conn = self.inner.get_data(serial)?;
        conn.send(payload).await?;
        tracing::trace!(serial, bytes = payload.len(), "sent");
        Ok(())
    }

    /// Send a UTF-8 string as one payload.
    pub async fn send_str(&self, text: &str, serial: u64) -> Result<(), NetError> {
        self.send(text.as_bytes(), serial).await
    }

    /// Receive the next frame from a specific data socket.
    pub async fn recv(&self, serial: u64) -> Result<Bytes, NetError> {
        let conn = self.inner.get_data(serial)?;
        conn.recv().await.ok_or(NetError::Closed(serial))
    }

    /// Receive the next frame from any data socket.
    ///
    /// Ready sockets are served round-robin by serial so no single busy
    /// connection can starve the others. Sleeps on the fan-in signal when
    /// nothing is queued.
    pub async fn recv_any(&self) -> (u64, Bytes) {
        loop {
            let notified = self.inner.data_ready.notified();

            let mut serials: Vec<u64> = self.inner.data.iter().map(|e| *e.key()).collect();
            serials.sort_unstable();
            let last = self.inner.last_served.load(Ordering::Relaxed);
            let rotate = serials.iter().position(|&s| s > last).unwrap_or(0);
            serials.rotate_left(rotate);

            for serial in serials {
                if let Some(conn) = self.inner.data.get(&serial) {
                    if let Some(msg) = conn.try_recv() {
                        self.inner.last_served.store(serial, Ordering::Relaxed);
                        return (serial, msg);
                    }
                }
            }

            notified.await;
        }
    }

    // ── Files ────────────────────────────────────────────────────────────────

    /// Send a file: one frame carrying the decimal ASCII byte size, then
    /// content frames of at most [`MAX_FRAME`] bytes.
    pub async fn send_file(&self, path: &Path, serial: u64) -> Result<(), NetError> {
        let conn = self.inner.get_data(serial)?;
        let size = tokio::fs::metadata(path).await?.len();
        conn.send_frame(size.to_string().as_bytes()).await?;

        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; MAX_FRAME];
        let mut sent: u64 = 0;
        while sent < size {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Err(NetError::FileChanged {
                    path: path.display().to_string(),
                });
            }
            conn.send_frame(&buf[..n]).await?;
            sent += n as u64;
        }
        tracing::debug!(serial, path = %path.display(), bytes = size, "file sent");
        Ok(())
    }

    /// Receive a file into `path`, creating parent directories as needed.
    ///
    /// Reads the size frame, then content frames until their sizes sum to
    /// the declared size. Receiving more bytes than declared is a protocol
    /// fault.
    pub async fn recv_file(&self, path: &Path, serial: u64) -> Result<u64, NetError> {
        let conn = self.inner.get_data(serial)?;

        let size_frame = conn.recv().await.ok_or(NetError::Closed(serial))?;
        let declared: u64 = std::str::from_utf8(&size_frame)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(NetError::BadSizeHeader)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::File::create(path).await?;
        let mut received: u64 = 0;
        while received < declared {
            let chunk = conn.recv().await.ok_or(NetError::Closed(serial))?;
            received += chunk.len() as u64;
            if received > declared {
                return Err(NetError::FileOverrun {
                    declared,
                    received,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        tracing::debug!(serial, path = %path.display(), bytes = declared, "file received");
        Ok(declared)
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Close one socket (listener or data) by serial.
    pub async fn close_socket(&self, serial: u64) -> Result<(), NetError> {
        if let Some((_, entry)) = self.inner.listeners.remove(&serial) {
            entry.accept_task.abort();
            return Ok(());
        }
        if let Some((_, conn)) = self.inner.data.remove(&serial) {
            conn.close().await;
            return Ok(());
        }
        Err(NetError::UnknownSerial(serial))
    }

    /// Close every socket this endpoint owns.
    pub async fn close_all(&self) {
        let listener_serials: Vec<u64> = self.inner.listeners.iter().map(|e| *e.key()).collect();
        for serial in listener_serials {
            if let Some((_, entry)) = self.inner.listeners.remove(&serial) {
                entry.accept_task.abort();
            }
        }
        let data_serials: Vec<u64> = self.inner.data.iter().map(|e| *e.key()).collect();
        for serial in data_serials {
            if let Some((_, conn)) = self.inner.data.remove(&serial) {
                conn.close().await;
            }
        }
    }

    /// Serials of the currently open data sockets.
    pub fn data_serials(&self) -> Vec<u64> {
        let mut serials: Vec<u64> = self.inner.data.iter().map(|e| *e.key()).collect();
        serials.sort_unstable();
        serials
    }

    /// Remote address of a data socket.
    pub fn peer_addr(&self, serial: u64) -> Result<SocketAddr, NetError> {
        Ok(self.inner.get_data(serial)?.peer)
    }
}

impl Inner {
    fn fresh_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    fn get_data(&self, serial: u64) -> Result<Arc<Connection>, NetError> {
        self.data
            .get(&serial)
            .map(|e| e.value().clone())
            .ok_or(NetError::UnknownSerial(serial))
    }

    /// Wrap an established stream in a data socket and start its reader.
    /// The socket is registered before the reader runs, so the close path
    /// always finds it.
    fn register_stream(inner: &Arc<Inner>, stream: TcpStream, peer: SocketAddr) -> u64 {
        let serial = inner.fresh_serial();
        let (read_half, write_half) = stream.into_split();

        let (conn, tx) = Connection::new(peer, write_half);
        let conn = Arc::new(conn);
        inner.data.insert(serial, conn.clone());

        let on_frame = {
            let weak = Arc::downgrade(inner);
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.data_ready.notify_one();
                }
            }
        };
        let on_end = {
            let weak: Weak<Inner> = Arc::downgrade(inner);
            move |end: ReadEnd| {
                let Some(inner) = weak.upgrade() else { return };
                match end {
                    ReadEnd::Closed => tracing::info!(serial, "connection closed"),
                    ReadEnd::Failed(e) => {
                        tracing::warn!(serial, error = %e, "connection failed")
                    }
                }
                inner.data.remove(&serial);
                // wake recv_any so it re-scans without the dead socket
                inner.data_ready.notify_one();
                let hook = inner.on_disconnect.lock().unwrap().clone();
                if let Some(hook) = hook {
                    hook(serial);
                }
            }
        };
        conn.attach_reader(tokio::spawn(run_reader(read_half, tx, on_frame, on_end)));

        let hook = inner.on_connect.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(serial);
        }
        serial
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("no socket with serial {0}")]
    UnknownSerial(u64),
    #[error("connection {0} closed")]
    Closed(u64),
    #[error("file size frame is not a decimal byte count")]
    BadSizeHeader,
    #[error("file transfer overran declared size: declared {declared}, received {received}")]
    FileOverrun { declared: u64, received: u64 },
    #[error("file shrank while sending: {path}")]
    FileChanged { path: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (Endpoint, Endpoint, u64, u64) {
        // server endpoint with listener, client endpoint connected to it
        let server = Endpoint::new();
        let listener = server.bind("127.0.0.1", 0).await.unwrap();
        let port = server.listener_addr(listener).unwrap().port();

        let client = Endpoint::new();
        let client_serial = client.connect("127.0.0.1", port).await.unwrap();

        // wait for the server side to register the accepted socket
        let server_serial = loop {
            if let Some(&s) = server.data_serials().first() {
                break s;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        (server, client, server_serial, client_serial)
    }

    #[tokio::test]
    async fn send_recv_round_trip() {
        let (server, client, server_serial, client_serial) = pair().await;

        client.send(b"hello", client_serial).await.unwrap();
        let (serial, msg) = server.recv_any().await;
        assert_eq!(serial, server_serial);
        assert_eq!(&msg[..], b"hello");

        server.send(b"world", server_serial).await.unwrap();
        let msg = client.recv(client_serial).await.unwrap();
        assert_eq!(&msg[..], b"world");
    }

    #[tokio::test]
    async fn serials_are_unique_and_monotonic() {
        let server = Endpoint::new();
        let listener = server.bind("127.0.0.1", 0).await.unwrap();
        let port = server.listener_addr(listener).unwrap().port();

        let client = Endpoint::new();
        let a = client.connect("127.0.0.1", port).await.unwrap();
        let b = client.connect("127.0.0.1", port).await.unwrap();
        let c = client.connect("127.0.0.1", port).await.unwrap();
        assert!(a < b && b < c, "serials must increase: {a} {b} {c}");
    }

    #[tokio::test]
    async fn close_socket_removes_serial() {
        let (server, client, _server_serial, client_serial) = pair().await;

        client.close_socket(client_serial).await.unwrap();
        assert!(client.data_serials().is_empty());
        assert!(matches!(
            client.send(b"x", client_serial).await,
            Err(NetError::UnknownSerial(_))
        ));

        // server side notices the close and drops its socket too
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !server.data_serials().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "server kept dead socket");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn large_payload_survives_chunking() {
        let (server, client, _server_serial, client_serial) = pair().await;

        // larger than one frame: arrives as two independent messages
        let payload = vec![0x5A; MAX_FRAME + 100];
        client.send(&payload, client_serial).await.unwrap();

        let (_, first) = server.recv_any().await;
        let (_, second) = server.recv_any().await;
        assert_eq!(first.len(), MAX_FRAME);
        assert_eq!(second.len(), 100);
        let mut joined = first.to_vec();
        joined.extend_from_slice(&second);
        assert_eq!(joined, payload);
    }

    #[tokio::test]
    async fn file_transfer_round_trip() {
        let (server, client, server_serial, client_serial) = pair().await;

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("nested/dir/dst.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &content).unwrap();

        let sender = {
            let client = client.clone();
            let src = src.clone();
            tokio::spawn(async move { client.send_file(&src, client_serial).await })
        };
        let received = server.recv_file(&dst, server_serial).await.unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(received, content.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), content);
    }

    #[tokio::test]
    async fn recv_file_rejects_overrun() {
        let (server, client, server_serial, client_serial) = pair().await;

        let dir = tempfile::tempdir().unwrap();
        // declare 3 bytes but send 5
        client.send_str("3", client_serial).await.unwrap();
        client.send(b"12345", client_serial).await.unwrap();

        let result = server.recv_file(&dir.path().join("out"), server_serial).await;
        assert!(matches!(result, Err(NetError::FileOverrun { .. })));
    }

    #[tokio::test]
    async fn recv_file_rejects_garbage_size() {
        let (server, client, server_serial, client_serial) = pair().await;
        let dir = tempfile::tempdir().unwrap();

        client.send(b"not-a-number", client_serial).await.unwrap();
        let result = server.recv_file(&dir.path().join("out"), server_serial).await;
        assert!(matches!(result, Err(NetError::BadSizeHeader)));
    }

    #[tokio::test]
    async fn recv_any_does_not_starve_a_ready_socket() {
        let server = Endpoint::new();
        let listener = server.bind("127.0.0.1", 0).await.unwrap();
        let port = server.listener_addr(listener).unwrap().port();

        let client = Endpoint::new();
        let a = client.connect("127.0.0.1", port).await.unwrap();
        let b = client.connect("127.0.0.1", port).await.unwrap();

        for _ in 0..10 {
            client.send(b"from-a", a).await.unwrap();
            client.send(b"from-b", b).await.unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let (serial, _) = server.recv_any().await;
            seen.insert(serial);
        }
        assert_eq!(seen.len(), 2, "both sockets must be served");
    }
}
