//! Accepting connections.
//!
//! [`Server`] owns the listening socket. Each accepted connection gets its
//! own task, which performs the handshake, registers the connection and runs
//! a [`ConnectionWorker`] until it closes. The accept loop stops as soon as
//! the registry shuts down.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  TCP Listener   │
//! └────────┬────────┘
//!          │ one task per socket
//!          ▼
//!   HandshakeNegotiator ──(error)──→ HTTP 400 / 405 / 501, close
//!          │
//!          ▼
//!   ConnectionRegistry::register
//!          │
//!          ▼
//!   ConnectionWorker ──→ MessageHandler::on_message
//!          │
//!          ▼
//!   ConnectionRegistry::unregister
//! ```
//!
//! # Examples
//!
//! ```no_run
//! use hixie_core::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let echo = handler_fn(|conn: Arc<Connection>, text: String| async move {
//!         conn.write_message(&text).await.is_ok()
//!     });
//!
//!     let server = Server::new(echo);
//!     let registry = server.registry();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         registry.shutdown().await;
//!     });
//!
//!     server.listen("127.0.0.1:8888").await
//! }
//! ```

use crate::connection::{
    Connection, ConnectionInfo, ConnectionWorker, DEFAULT_MAX_FRAME_LEN, next_connection_id,
};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::handler::MessageHandler;
use crate::handshake::HandshakeNegotiator;
use crate::registry::ConnectionRegistry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Default address, matching the classic draft-76 demo server.
pub const DEFAULT_ADDR: &str = "127.0.0.1:8888";

/// Server settings.
///
/// # Examples
///
/// ```
/// use hixie_core::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::default()
///     .with_addr("0.0.0.0:9000")
///     .with_write_timeout(Duration::from_secs(2));
///
/// assert_eq!(config.addr, "0.0.0.0:9000");
/// assert_eq!(config.handshake_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, e.g. `127.0.0.1:8888`
    pub addr: String,
    /// Limit on reading the upgrade request and writing the response
    pub handshake_timeout: Duration,
    /// Limit on each frame write, including every write of a broadcast
    pub write_timeout: Duration,
    /// Largest accepted inbound text payload, in bytes
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    /// Sets the bind address.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the per-write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the inbound payload limit.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

/// A draft-76 WebSocket server.
pub struct Server {
    handler: Arc<dyn MessageHandler>,
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
}

impl Server {
    /// Creates a server that dispatches every message to `handler`.
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handler,
            registry: Arc::new(ConnectionRegistry::new()),
            config: ServerConfig::default(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses an existing registry, e.g. one the handler already holds for
    /// broadcasting.
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// The registry shared by all connections of this server.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// The active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds `addr` and serves until shutdown.
    ///
    /// # Errors
    ///
    /// Fails if the address does not parse or cannot be bound.
    pub async fn listen(mut self, addr: impl AsRef<str>) -> Result<()> {
        let addr: SocketAddr = addr
            .as_ref()
            .parse()
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", addr.as_ref(), e)))?;
        self.config.addr = addr.to_string();

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.addr.clone();
        self.listen(addr).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            "WebSocket server listening on {}",
            listener.local_addr()?
        );

        let mut shutdown = self.registry.subscribe_shutdown();
        let server = Arc::new(self);

        loop {
            let shutting_down = *shutdown.borrow_and_update();
            if shutting_down {
                break;
            }

            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    debug!("Connection from {} ended early: {}", peer_addr, e);
                }
            });
        }

        info!("Stopped accepting connections");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        debug!("Accepted connection from {}", peer_addr);
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut negotiator = HandshakeNegotiator::new();
        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            negotiator.negotiate(&mut reader, &mut write_half),
        )
        .await
        .map_err(|_| Error::custom("Handshake timed out"))??;

        let info = ConnectionInfo::new(next_connection_id(), peer_addr).with_handshake(&handshake);
        let conn = Arc::new(Connection::new(info, write_half, self.config.write_timeout));

        if let Err(e) = self.registry.register(&conn).await {
            // upgraded but refused, most likely a race with shutdown
            if let Err(close_err) = conn.close(Frame::Close).await {
                debug!("Could not send close to {}: {}", conn.id(), close_err);
            }
            return Err(e);
        }

        let worker = ConnectionWorker::new(
            conn,
            reader,
            self.handler.clone(),
            self.registry.clone(),
        )
        .max_frame_len(self.config.max_frame_len);
        worker.run().await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn test_config_from_json_fills_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"addr":"0.0.0.0:1234","max_frame_len":64}"#).unwrap();
        assert_eq!(config.addr, "0.0.0.0:1234");
        assert_eq!(config.max_frame_len, 64);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_listen_rejects_bad_address() {
        let server = Server::new(handler_fn(|_c: Arc<Connection>, _t: String| async { true }));
        let err = server.listen("not an address").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = Server::new(handler_fn(|_c: Arc<Connection>, _t: String| async { true }));
        let registry = server.registry();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let task = tokio::spawn(server.serve(listener));
        registry.shutdown().await;

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("accept loop did not stop")
            .unwrap()
            .unwrap();
    }
}
