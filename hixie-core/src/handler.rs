//! The application side of a connection.
//!
//! Applications plug into the server by implementing [`MessageHandler`]. The
//! worker calls [`on_message`](MessageHandler::on_message) once per inbound
//! text frame, in the order frames arrive, and closes the connection as soon
//! as it returns `false`. Replies go back through
//! [`Connection::write_message`]; messages for everyone go through
//! [`ConnectionRegistry::broadcast`](crate::ConnectionRegistry::broadcast).
//!
//! # Examples
//!
//! ## Implementing the trait
//!
//! ```
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
//! ```
//!
//! ## From a closure
//!
//! ```
//! use hixie_core::prelude::*;
//! use std::sync::Arc;
//!
//! let echo = handler_fn(|conn: Arc<Connection>, text: String| async move {
//!     conn.write_message(&text).await.is_ok()
//! });
//! # let _ = echo;
//! ```

use crate::connection::{Connection, ConnectionId};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Callbacks an application supplies to the server.
///
/// One handler value is shared by every connection, so implementations keep
/// per-connection data keyed by [`Connection::id`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Called once per decoded text frame.
    ///
    /// Return `true` to keep reading, `false` to have the server send the
    /// close sequence and end the connection.
    async fn on_message(&self, conn: &Arc<Connection>, text: String) -> bool;

    /// Called after the handshake, once the connection is registered and
    /// before its first frame is read.
    async fn on_open(&self, _conn: &Arc<Connection>) {}

    /// Called after the connection has left the registry.
    async fn on_close(&self, _id: &ConnectionId) {}
}

/// A [`MessageHandler`] built from an async closure.
///
/// Created by [`handler_fn`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure as a [`MessageHandler`] with no-op open and close
/// hooks.
pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F, Fut>>
where
    F: Fn(Arc<Connection>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Arc<Connection>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn on_message(&self, conn: &Arc<Connection>, text: String) -> bool {
        (self.f)(conn.clone(), text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_handler_fn_forwards_message() {
        let (client, mut server) = tokio::io::duplex(64);
        let conn = Arc::new(Connection::for_test("conn_t", client));

        let handler = handler_fn(|conn: Arc<Connection>, text: String| async move {
            conn.write_message(&text.to_uppercase()).await.is_ok()
        });

        assert!(handler.on_message(&conn, "hi".to_string()).await);

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &frame::encode("HI")[..]);
    }

    #[tokio::test]
    async fn test_handler_fn_can_request_close() {
        let (client, _server) = tokio::io::duplex(64);
        let conn = Arc::new(Connection::for_test("conn_t", client));

        let handler = handler_fn(|_conn: Arc<Connection>, text: String| async move {
            text != "bye"
        });

        assert!(handler.on_message(&conn, "stay".to_string()).await);
        assert!(!handler.on_message(&conn, "bye".to_string()).await);
    }
}
