//! # Hixie - Draft-76 WebSocket Server for Rust
//!
//! Hixie serves clients that speak the legacy "draft-76" WebSocket protocol
//! (also known as hixie-76): the revision with the MD5 challenge/response
//! handshake and `0x00 … 0xFF` delimited text frames that shipped in early
//! browsers, embedded devices and a few long-lived tools.
//!
//! This crate re-exports [`hixie_core`]. Most applications only need the
//! prelude.
//!
//! ## Features
//!
//! - **Bit-exact handshake**: challenge keys, `Sec-WebSocket-Location`,
//!   origin and subprotocol echo
//! - **Simple handlers**: one async callback per text message; return
//!   `false` to close
//! - **Broadcasting**: fan out a message to every open connection; a dead
//!   client never blocks delivery to the others
//! - **Graceful shutdown**: one call closes every connection and stops the
//!   accept loop
//!
//! ## Quick Start
//!
//! ```no_run
//! use hixie::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let echo = handler_fn(|conn: Arc<Connection>, text: String| async move {
//!         conn.write_message(&text).await.is_ok()
//!     });
//!
//!     Server::new(echo).listen("127.0.0.1:8888").await
//! }
//! ```
//!
//! ## Broadcast Server
//!
//! ```no_run
//! use hixie::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = Arc::new(ConnectionRegistry::new());
//!     let reg = registry.clone();
//!
//!     let chat = handler_fn(move |conn: Arc<Connection>, text: String| {
//!         let reg = reg.clone();
//!         async move {
//!             reg.broadcast(&format!("{}: {}", conn.id(), text)).await;
//!             true
//!         }
//!     });
//!
//!     Server::new(chat)
//!         .with_registry(registry)
//!         .listen("127.0.0.1:8888")
//!         .await
//! }
//! ```
//!
//! ## Protocol Summary
//!
//! | Direction | Bytes |
//! |-----------|-------|
//! | text frame | `0x00`, UTF-8 payload, `0xFF` |
//! | server close | `0xFF 0x00` |
//! | client close | `0xFF …`, acknowledged by echoing `0xFF` |
//!
//! See [`hixie_core::handshake`] for the upgrade exchange.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use hixie_core::*;

/// Commonly used types and traits.
pub mod prelude {
    pub use hixie_core::prelude::*;
}
