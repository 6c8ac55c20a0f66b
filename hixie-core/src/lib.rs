//! # Hixie Core - Draft-76 WebSocket Server
//!
//! `hixie-core` implements the legacy "draft-76" (hixie-76) WebSocket
//! protocol on top of tokio: the MD5 challenge/response handshake, the
//! `0x00 … 0xFF` text framing, a per-connection read/dispatch loop, and a
//! shared registry with broadcast and coordinated shutdown.
//!
//! Draft-76 predates RFC 6455. It has no binary frames, no masking and no
//! extensions, and clients that send `Upgrade: websocket` (lowercase, the
//! RFC 6455 form) are refused with `501 Not Implemented`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Application                          │
//! │              impl MessageHandler / handler_fn             │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Hixie Core                          │
//! │  ┌────────────┐  ┌─────────────────┐  ┌──────────────┐   │
//! │  │   Server   │→ │ HandshakeNego-  │→ │ Connection-  │   │
//! │  │ (accept)   │  │ tiator          │  │ Worker       │   │
//! │  └────────────┘  └─────────────────┘  └──────────────┘   │
//! │        │          challenge (MD5)        frame codec      │
//! │        └──────────→ ConnectionRegistry ←──────┘           │
//! │                    (broadcast, shutdown)                  │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!                        tokio TcpStream
//! ```
//!
//! ## Modules
//!
//! - [`challenge`]: the key-number extraction and MD5 response
//! - [`handshake`]: request parsing, validation and the `101` response
//! - [`frame`]: text frame encoding and decoding
//! - [`connection`]: connection handles and the read/dispatch worker
//! - [`registry`]: the set of open connections, broadcast and shutdown
//! - [`handler`]: the application callback trait
//! - [`server`]: the accept loop and [`ServerConfig`]
//! - [`error`]: error types
//!
//! ## Quick Start
//!
//! ```no_run
//! use hixie_core::prelude::*;
//! use std::sync::Arc;
//!
//! struct PingPong;
//!
//! #[async_trait]
//! impl MessageHandler for PingPong {
//!     async fn on_message(&self, conn: &Arc<Connection>, text: String) -> bool {
//!         if text == "CLOSEME" {
//!             return false;
//!         }
//!         conn.write_message("pong").await.is_ok()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     Server::new(Arc::new(PingPong))
//!         .listen("127.0.0.1:8888")
//!         .await
//! }
//! ```
//!
//! ## Broadcasting
//!
//! ```
//! use hixie_core::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ConnectionRegistry::new());
//!
//! let reg = registry.clone();
//! let chat = handler_fn(move |_conn: Arc<Connection>, text: String| {
//!     let reg = reg.clone();
//!     async move {
//!         reg.broadcast(&text).await;
//!         true
//!     }
//! });
//!
//! let server = Server::new(chat).with_registry(registry);
//! # let _ = server;
//! ```
//!
//! ## Limitations
//!
//! The framing has no escaping: a text payload can never contain `0xFF`.
//! Valid UTF-8 never does, so this only matters for peers that send invalid
//! text, which the worker rejects.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod challenge;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod registry;
pub mod server;

pub use connection::{Connection, ConnectionId, ConnectionInfo, ConnectionState, ConnectionWorker};
pub use error::{ChallengeError, Error, HandshakeError, Result};
pub use frame::Frame;
pub use handler::{FnHandler, MessageHandler, handler_fn};
pub use handshake::{Handshake, HandshakeNegotiator, HandshakeState};
pub use registry::{BroadcastReport, ConnectionRegistry};
pub use server::{Server, ServerConfig};

/// Commonly used types and traits for hixie applications.
///
/// ```
/// use hixie_core::prelude::*;
///
/// async fn greet(conn: &Connection) -> Result<()> {
///     conn.write_message("hello").await
/// }
/// ```
pub mod prelude {
    pub use crate::connection::{
        Connection, ConnectionId, ConnectionInfo, ConnectionState, ConnectionWorker,
        next_connection_id,
    };
    pub use crate::error::{Error, Result};
    pub use crate::handler::{MessageHandler, handler_fn};
    pub use crate::registry::{BroadcastReport, ConnectionRegistry};
    pub use crate::server::{Server, ServerConfig};
    pub use async_trait::async_trait;
}
