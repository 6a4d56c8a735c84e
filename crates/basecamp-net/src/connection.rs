//! One established data socket: a strictly sequential writer plus a reader
//! task that enqueues whole frames into a per-connection queue.
//!
//! Construction is two-step — build the connection, register it, then
//! attach the reader — so the close path never observes a connection that
//! is not yet in its endpoint's registry.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::frame;

/// Why a connection's reader loop stopped.
#[derive(Debug)]
pub(crate) enum ReadEnd {
    /// Peer closed at a frame boundary.
    Closed,
    /// Framing fault or I/O error; the connection is poisoned.
    Failed(frame::FrameError),
}

pub(crate) struct Connection {
    pub(crate) peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    queue: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap an established stream. Returns the connection and the sender
    /// side of its frame queue, to be handed to [`run_reader`].
    pub(crate) fn new(
        peer: SocketAddr,
        write_half: OwnedWriteHalf,
    ) -> (Self, mpsc::UnboundedSender<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            peer,
            writer: Mutex::new(write_half),
            queue: Mutex::new(rx),
            reader: std::sync::Mutex::new(None),
        };
        (conn, tx)
    }

    /// Record the reader task so close/drop can stop it.
    pub(crate) fn attach_reader(&self, handle: JoinHandle<()>) {
        *self.reader.lock().unwrap() = Some(handle);
    }

    /// Send a payload, chunking into frames as needed. Writes on one
    /// connection are serialized by the writer lock, preserving order.
    pub(crate) async fn send(&self, payload: &[u8]) -> Result<(), frame::FrameError> {
        let mut writer = self.writer.lock().await;
        frame::write_payload(&mut *writer, payload).await
    }

    /// Send exactly one frame (used by the file sub-protocol).
    pub(crate) async fn send_frame(&self, payload: &[u8]) -> Result<(), frame::FrameError> {
        let mut writer = self.writer.lock().await;
        frame::write_frame(&mut *writer, payload).await
    }

    /// Pop the next received frame, waiting if none is queued.
    /// Returns `None` once the reader has exited and the queue drained.
    pub(crate) async fn recv(&self) -> Option<Bytes> {
        self.queue.lock().await.recv().await
    }

    /// Pop a received frame without waiting.
    pub(crate) fn try_recv(&self) -> Option<Bytes> {
        self.queue.try_lock().ok()?.try_recv().ok()
    }

    /// Stop the reader task and shut the writer down.
    pub(crate) async fn close(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        let mut writer = self.writer.lock().await;
        use tokio::io::AsyncWriteExt;
        let _ = writer.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // best-effort: stop the reader if close() was never awaited
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// The per-connection read loop: frames go into the queue, `on_frame`
/// pulses after each enqueue, and `on_end` fires exactly once on exit.
pub(crate) async fn run_reader(
    mut read_half: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Bytes>,
    on_frame: impl Fn() + Send + 'static,
    on_end: impl FnOnce(ReadEnd) + Send + 'static,
) {
    let end = loop {
        match frame::read_frame(&mut read_half).await {
            Ok(Some(payload)) => {
                if tx.send(Bytes::from(payload)).is_err() {
                    // receiver side dropped: connection is being closed
                    break ReadEnd::Closed;
                }
                on_frame();
            }
            Ok(None) => break ReadEnd::Closed,
            Err(e) => break ReadEnd::Failed(e),
        }
    };
    on_end(end);
}
