//! The shared set of open connections.
//!
//! [`ConnectionRegistry`] tracks every connection that completed its
//! handshake and has not closed yet. It provides fan-out delivery through
//! [`broadcast`](ConnectionRegistry::broadcast) and coordinated shutdown
//! through [`shutdown`](ConnectionRegistry::shutdown).
//!
//! # Locking
//!
//! The set of connections and the shutdown flag sit behind one async mutex.
//! `broadcast` holds that lock for the whole fan-out, so registrations and
//! removals wait until every write has finished or hit its write timeout.
//! This keeps delivery simple and consistent at the small connection counts
//! the protocol sees in practice; a client that stops reading can delay a
//! broadcast by at most one write timeout.
//!
//! # Ownership
//!
//! The registry keeps [`Weak`] references. A connection's worker owns it;
//! dropping the worker's handle releases the socket even if the registry
//! still holds an entry.
//!
//! # Examples
//!
//! ```
//! use hixie_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<()> {
//! let registry = ConnectionRegistry::new();
//! let (_client, server) = tokio::io::duplex(64);
//! let info = ConnectionInfo::new(next_connection_id(), "127.0.0.1:9000".parse().unwrap());
//! let conn = Arc::new(Connection::new(info, server, std::time::Duration::from_secs(1)));
//!
//! registry.register(&conn).await?;
//! let report = registry.broadcast("Server maintenance in 5 minutes").await;
//! assert_eq!(report.delivered, 1);
//!
//! registry.unregister(conn.id()).await;
//! assert_eq!(registry.count().await, 0);
//! # Ok(())
//! # }
//! ```

use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, Result};
use crate::frame;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// State shared by every connection of one server.
#[derive(Debug, Default)]
pub struct ServerState {
    connections: HashMap<ConnectionId, Weak<Connection>>,
    shutdown: bool,
}

/// Outcome of a [`ConnectionRegistry::broadcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of connections the frame was written to
    pub delivered: usize,
    /// Connections whose write failed
    pub failed: Vec<ConnectionId>,
}

/// Tracks open connections; broadcasts to them and shuts them down.
pub struct ConnectionRegistry {
    state: Mutex<ServerState>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(ServerState::default()),
            shutdown_tx,
        }
    }

    /// Adds an open connection. Returns the number of connections afterwards.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`Error::AlreadyRegistered`] if the id is already present
    pub async fn register(&self, conn: &Arc<Connection>) -> Result<usize> {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return Err(Error::ShuttingDown);
        }

        match state.connections.entry(conn.id().clone()) {
            Entry::Occupied(entry) => return Err(Error::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(conn));
            }
        }

        let count = state.connections.len();
        info!("Added connection: {} (Total: {})", conn.id(), count);
        Ok(count)
    }

    /// Removes a connection. Returns `false` if it was not registered.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.connections.remove(id).is_some();
        if removed {
            info!(
                "Removed connection: {} (Total: {})",
                id,
                state.connections.len()
            );
        }
        removed
    }

    /// Sends one text frame to every registered connection.
    ///
    /// A failed write is logged and recorded in the report; it never stops
    /// delivery to the other connections.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        let frame = frame::encode(text);
        let state = self.state.lock().await;
        let total = state.connections.len();
        debug!("Broadcasting message to {} connections", total);

        let deliveries = state.connections.iter().map(|(id, conn)| {
            let frame = frame.clone();
            async move {
                let result = match conn.upgrade() {
                    Some(conn) => conn.write_raw(&frame).await,
                    None => Err(Error::ConnectionClosed),
                };
                (id, result)
            }
        });

        let mut report = BroadcastReport::default();
        for (id, result) in join_all(deliveries).await {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    debug!("Broadcast sent to {}", id);
                }
                Err(e) => {
                    warn!("Failed to broadcast to {}: {}", id, e);
                    report.failed.push(id.clone());
                }
            }
        }

        info!(
            "Broadcast complete: {} success, {} failed out of {} total",
            report.delivered,
            report.failed.len(),
            total
        );
        report
    }

    /// Stops the server: refuses new registrations, asks every worker to
    /// send the close sequence, and stops the accept loop.
    ///
    /// Workers remove themselves as they finish. Calling this twice is
    /// harmless.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        self.shutdown_tx.send_replace(true);
        info!(
            "Shutdown requested, closing {} connections",
            state.connections.len()
        );
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// A receiver that flips to `true` on shutdown.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Number of registered connections.
    pub async fn count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Ids of all registered connections, in no particular order.
    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.state.lock().await.connections.keys().cloned().collect()
    }

    /// Looks up a live connection.
    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.state
            .lock()
            .await
            .connections
            .get(id)
            .and_then(Weak::upgrade)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
