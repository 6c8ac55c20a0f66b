//! Connections and the per-connection read/dispatch loop.
//!
//! Every upgraded socket is split in two:
//!
//! - the **write side** lives in a [`Connection`], shared through an `Arc` so
//!   the application and [`ConnectionRegistry::broadcast`] can send frames;
//! - the **read side** is owned by a [`ConnectionWorker`], which decodes
//!   frames and hands them to the [`MessageHandler`].
//!
//! # Lifecycle
//!
//! The worker owns the [`ConnectionState`] and moves it through:
//!
//! ```text
//! Handshaking → Open → Reading ─┬─→ Dispatching → Reading …
//!                               └─→ Closing → Closed
//! ```
//!
//! A worker ends when the handler returns `false`, when the peer sends
//! anything but a text frame, when the peer disappears, on any I/O error, or
//! when the registry shuts down. On every path it unregisters the connection
//! and releases the socket. Errors never leave the worker.
//!
//! # Examples
//!
//! ```
//! use hixie_core::prelude::*;
//! use std::sync::Arc;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
//!
//! # async fn example() -> Result<()> {
//! let registry = Arc::new(ConnectionRegistry::new());
//! let echo = handler_fn(|conn: Arc<Connection>, text: String| async move {
//!     conn.write_message(&text).await.is_ok()
//! });
//!
//! let (mut client, server) = tokio::io::duplex(1024);
//! let (read_half, write_half) = tokio::io::split(server);
//!
//! let info = ConnectionInfo::new(next_connection_id(), "127.0.0.1:9000".parse().unwrap());
//! let conn = Arc::new(Connection::new(info, write_half, std::time::Duration::from_secs(1)));
//! registry.register(&conn).await?;
//!
//! let worker = ConnectionWorker::new(conn, BufReader::new(read_half), echo, registry.clone());
//! let task = tokio::spawn(worker.run());
//!
//! client.write_all(b"\x00hi\xff").await?;
//! let mut reply = [0u8; 4];
//! client.read_exact(&mut reply).await?;
//! assert_eq!(&reply, b"\x00hi\xff");
//!
//! drop(client);
//! assert_eq!(task.await.unwrap(), ConnectionState::Closed);
//! assert_eq!(registry.count().await, 0);
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::frame::{self, Frame};
use crate::handler::MessageHandler;
use crate::handshake::Handshake;
use crate::registry::ConnectionRegistry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// A unique identifier for a connection.
///
/// Identifiers are generated by [`next_connection_id`] and are unique for
/// the lifetime of the process.
pub type ConnectionId = String;

/// Default limit on an inbound text frame payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Returns a fresh identifier of the form `conn_<n>`.
pub fn next_connection_id() -> ConnectionId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("conn_{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// The upgrade handshake has not completed yet.
    Handshaking,
    /// Upgraded and registered, not currently reading.
    Open,
    /// Waiting for the next inbound frame.
    Reading,
    /// The message handler is running.
    Dispatching,
    /// A close byte or close sequence is being written.
    Closing,
    /// Finished. The socket has been released.
    Closed,
}

/// Metadata about a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Unique identifier for this connection
    pub id: ConnectionId,
    /// Socket address of the client
    pub addr: SocketAddr,
    /// Unix timestamp when the connection was upgraded
    pub connected_at: u64,
    /// Request target of the upgrade request
    pub path: Option<String>,
    /// `Origin` the client declared
    pub origin: Option<String>,
    /// Subprotocol the client requested
    pub protocol: Option<String>,
}

impl ConnectionInfo {
    /// Creates metadata stamped with the current time.
    pub fn new(id: ConnectionId, addr: SocketAddr) -> Self {
        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            id,
            addr,
            connected_at,
            path: None,
            origin: None,
            protocol: None,
        }
    }

    /// Copies the request details of a completed handshake.
    pub fn with_handshake(mut self, handshake: &Handshake) -> Self {
        self.path = Some(handshake.path.clone());
        self.origin = handshake.origin.clone();
        self.protocol = handshake.protocol.clone();
        self
    }
}

/// The sending half of an upgraded connection.
///
/// Writes are serialized by an internal lock, so frames from the handler and
/// from a concurrent broadcast never interleave. Every write is bounded by
/// the connection's write timeout.
pub struct Connection {
    info: ConnectionInfo,
    writer: Mutex<Option<BoxedWriter>>,
    write_timeout: Duration,
}

impl Connection {
    /// Wraps the write side of an upgraded stream.
    pub fn new<W>(info: ConnectionInfo, writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            info,
            writer: Mutex::new(Some(Box::new(writer))),
            write_timeout,
        }
    }

    /// Returns the unique identifier for this connection.
    pub fn id(&self) -> &ConnectionId {
        &self.info.id
    }

    /// Returns the connection metadata.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Sends one text frame.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] once the worker has released the socket
    /// - [`Error::WriteTimeout`] if the peer stops reading
    /// - [`Error::Io`] if the socket fails
    ///
    /// # Examples
    ///
    /// ```
    /// use hixie_core::prelude::*;
    /// use std::sync::Arc;
    ///
    /// # async fn example(conn: Arc<Connection>) -> Result<()> {
    /// conn.write_message("Welcome!").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn write_message(&self, text: &str) -> Result<()> {
        self.write_raw(&frame::encode(text)).await
    }

    /// Serializes `value` to JSON and sends it as one text frame.
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.write_message(&json).await
    }

    /// Returns `true` once the socket has been released.
    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }

    /// Writes `bytes` as one unit. A write that fails or times out may have
    /// left a partial frame on the wire, so the writer is dropped and every
    /// later write fails with [`Error::ConnectionClosed`].
    pub(crate) async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;

        let result = send(writer, bytes, self.write_timeout).await;
        if let Err(e) = &result {
            debug!("Write to {} failed, dropping writer: {}", self.info.id, e);
            if let Some(writer) = guard.take() {
                self.shutdown_writer(writer).await;
            }
        }
        result
    }

    /// Sends the final bytes of the connection and releases the writer under
    /// the same lock, so nothing can follow them on the wire.
    pub(crate) async fn close(&self, last: Frame) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let mut writer = guard.take().ok_or(Error::ConnectionClosed)?;

        let result = send(&mut writer, &last.encode(), self.write_timeout).await;
        self.shutdown_writer(writer).await;
        result
    }

    /// Shuts down and drops the write side. Later writes fail with
    /// [`Error::ConnectionClosed`].
    pub(crate) async fn release(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(writer) = writer {
            self.shutdown_writer(writer).await;
        }
    }

    async fn shutdown_writer(&self, mut writer: BoxedWriter) {
        match tokio::time::timeout(self.write_timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shutdown of {} failed: {}", self.info.id, e),
            Err(_) => debug!("Shutdown of {} timed out", self.info.id),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test<W>(id: &str, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        Self::new(
            ConnectionInfo::new(id.to_string(), addr),
            writer,
            Duration::from_secs(1),
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

async fn send(writer: &mut BoxedWriter, bytes: &[u8], limit: Duration) -> Result<()> {
    tokio::time::timeout(limit, async {
        writer.write_all(bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| Error::WriteTimeout)??;

    Ok(())
}

/// Drives one registered connection until it closes.
///
/// The caller registers the connection before calling [`run`](Self::run);
/// the worker unregisters it on exit.
pub struct ConnectionWorker<R> {
    conn: Arc<Connection>,
    reader: R,
    handler: Arc<dyn MessageHandler>,
    registry: Arc<ConnectionRegistry>,
    shutdown: watch::Receiver<bool>,
    state: ConnectionState,
    max_frame_len: usize,
}

impl<R> ConnectionWorker<R>
where
    R: AsyncBufRead + Send + Unpin,
{
    /// Creates a worker for an open connection.
    pub fn new(
        conn: Arc<Connection>,
        reader: R,
        handler: Arc<dyn MessageHandler>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        let shutdown = registry.subscribe_shutdown();
        Self {
            conn,
            reader,
            handler,
            registry,
            shutdown,
            state: ConnectionState::Open,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Sets the largest inbound payload accepted before the connection is
    /// closed.
    pub fn max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Runs the read/dispatch loop and cleans up. Always ends in
    /// [`ConnectionState::Closed`].
    pub async fn run(mut self) -> ConnectionState {
        let id = self.conn.id().clone();
        info!("Connection {} open from {}", id, self.conn.info().addr);

        self.handler.on_open(&self.conn).await;

        if let Err(e) = self.drive().await {
            if e.is_disconnect() {
                debug!("Connection {} dropped: {}", id, e);
            } else {
                warn!("Connection {} failed: {}", id, e);
            }
        }

        self.state = ConnectionState::Closed;
        self.registry.unregister(&id).await;
        self.conn.release().await;
        self.handler.on_close(&id).await;
        info!("Connection {} closed", id);

        self.state
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let shutting_down = *self.shutdown.borrow_and_update();
            if shutting_down {
                debug!("Connection {} closing for shutdown", self.conn.id());
                return self.close(Frame::Close).await;
            }

            self.state = ConnectionState::Reading;
            let next = tokio::select! {
                _ = self.shutdown.changed() => None,
                decoded = frame::decode_one(&mut self.reader, self.max_frame_len) => Some(decoded),
            };

            let frame = match next {
                // the flag only ever flips to true
                None => {
                    debug!("Connection {} interrupted by shutdown", self.conn.id());
                    return self.close(Frame::Close).await;
                }
                Some(Ok(frame)) => frame,
                Some(Err(e)) if e.is_disconnect() => return Err(e),
                Some(Err(e)) => {
                    // protocol violation: the peer is still there, tell it we are leaving
                    if let Err(close_err) = self.close(Frame::Close).await {
                        debug!(
                            "Could not send close to {}: {}",
                            self.conn.id(),
                            close_err
                        );
                    }
                    return Err(e);
                }
            };

            match frame {
                Frame::Text(text) => {
                    debug!("Frame from {} ({} bytes)", self.conn.id(), text.len());
                    self.state = ConnectionState::Dispatching;
                    if !self.handler.on_message(&self.conn, text).await {
                        debug!("Handler closed {}", self.conn.id());
                        return self.close(Frame::Close).await;
                    }
                    self.state = ConnectionState::Open;
                }
                Frame::UnsupportedLeadByte(byte) => {
                    debug!(
                        "Lead byte {:#04x} from {}, acknowledging and closing",
                        byte,
                        self.conn.id()
                    );
                    return self.close(Frame::UnsupportedLeadByte(byte)).await;
                }
                Frame::Close | Frame::Disconnected => {
                    debug!("Peer {} disconnected", self.conn.id());
                    self.state = ConnectionState::Closed;
                    return Ok(());
                }
            }
        }
    }

    /// Leaves the registry first so no broadcast can follow `last` onto the
    /// wire.
    async fn close(&mut self, last: Frame) -> Result<()> {
        self.state = ConnectionState::Closing;
        self.registry.unregister(self.conn.id()).await;
        self.conn.close(last).await
    }
}
