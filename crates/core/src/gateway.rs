//! Realtime Gateway: live push connections per session.
//!
//! Any number of connections may share a session (several tabs). Each one
//! has its own bounded outbox; a full or closed outbox drops only that
//! connection, so one slow socket never stalls the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use pocketping_protocol::ServerEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

const DEFAULT_OUTBOX: usize = 256;

struct Connection {
    id: u64,
    tx: mpsc::Sender<ServerEvent>,
}

pub struct Gateway {
    connections: DashMap<String, Vec<Connection>>,
    next_id: AtomicU64,
    outbox: usize,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    pub fn new() -> Self {
        Self::with_outbox(DEFAULT_OUTBOX)
    }

    pub fn with_outbox(outbox: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            outbox: outbox.max(1),
        }
    }

    /// Open a connection for `session_id`. The connection is removed when the
    /// returned [`Registration`] is dropped.
    pub fn register(self: &Arc<Self>, session_id: &str) -> (Registration, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.outbox);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .entry(session_id.to_string())
            .or_default()
            .push(Connection { id, tx });

        info!(
            component = "gateway",
            event = "gateway.connection.opened",
            session_id = %session_id,
            connection_id = id,
            "Realtime connection opened"
        );

        let registration = Registration {
            gateway: Arc::clone(self),
            session_id: session_id.to_string(),
            id,
        };
        (registration, rx)
    }

    fn unregister(&self, session_id: &str, id: u64) {
        let emptied = match self.connections.get_mut(session_id) {
            Some(mut conns) => {
                conns.retain(|c| c.id != id);
                conns.is_empty()
            }
            None => false,
        };
        if emptied {
            self.connections.remove_if(session_id, |_, conns| conns.is_empty());
        }
        info!(
            component = "gateway",
            event = "gateway.connection.closed",
            session_id = %session_id,
            connection_id = id,
            "Realtime connection closed"
        );
    }

    /// Push `event` to every connection of a session. Returns how many
    /// connections accepted it.
    pub fn broadcast(&self, session_id: &str, event: &ServerEvent) -> usize {
        let Some(mut conns) = self.connections.get_mut(session_id) else {
            return 0;
        };

        let mut delivered = 0;
        conns.retain(|conn| match conn.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    component = "gateway",
                    event = "gateway.connection.lagging",
                    session_id = %session_id,
                    connection_id = conn.id,
                    kind = event.kind(),
                    "Outbox full, dropping connection"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    component = "gateway",
                    event = "gateway.connection.gone",
                    session_id = %session_id,
                    connection_id = conn.id,
                    "Connection closed, removing"
                );
                false
            }
        });
        let emptied = conns.is_empty();
        drop(conns);
        if emptied {
            self.connections.remove_if(session_id, |_, conns| conns.is_empty());
        }
        delivered
    }

    /// Push `event` to every connected session.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        self.session_ids()
            .iter()
            .map(|session_id| self.broadcast(session_id, event))
            .sum()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn connection_count(&self, session_id: &str) -> usize {
        self.connections.get(session_id).map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.connection_count(session_id) > 0
    }

    /// Drop every connection of a session (session deleted).
    pub fn disconnect_session(&self, session_id: &str) {
        self.connections.remove(session_id);
    }
}

/// Keeps a gateway connection alive; dropping it unregisters the connection.
pub struct Registration {
    gateway: Arc<Gateway>,
    session_id: String,
    id: u64,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.gateway.unregister(&self.session_id, self.id);
    }
}
