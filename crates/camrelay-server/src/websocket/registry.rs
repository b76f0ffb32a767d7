//! Registry of open subscriber connections.
//!
//! One synchronous lock guards the map and no method awaits while holding
//! it, so every operation is bounded regardless of how slow any client is.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::connection::{ClientConnection, ConnectionId};
use crate::errors::RegistryError;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_EVICTIONS_TOTAL};

/// Why a connection was forcibly removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionReason {
    /// Enqueueing or writing a frame failed.
    SendFailed,
    /// Two heartbeat ticks passed without a Pong.
    Unresponsive,
    /// A single frame write exceeded the write timeout.
    WriteTimeout,
}

impl EvictionReason {
    /// Metric / log label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendFailed => "send_failed",
            Self::Unresponsive => "unresponsive",
            Self::WriteTimeout => "write_timeout",
        }
    }
}

#[derive(Default)]
struct Inner {
    connections: BTreeMap<ConnectionId, Arc<ClientConnection>>,
    closed: bool,
}

/// The set of currently open connections.
///
/// Members are kept in id order, which is registration order.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next connection id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register an `Open` connection.
    pub fn add(&self, connection: Arc<ClientConnection>) -> Result<(), RegistryError> {
        let id = connection.id;
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        if !connection.is_open() {
            return Err(RegistryError::NotOpen(id));
        }
        if inner.connections.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }
        let _ = inner.connections.insert(id, connection);
        record_active(inner.connections.len());
        Ok(())
    }

    /// Remove a connection. Removing a non-member is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        let mut inner = self.inner.write();
        let removed = inner.connections.remove(&id);
        if removed.is_some() {
            record_active(inner.connections.len());
        }
        removed
    }

    /// Remove a connection and force it to `Closed`.
    ///
    /// Returns `false` if `id` was not a member (already removed or evicted).
    pub fn evict(&self, id: ConnectionId, reason: EvictionReason) -> bool {
        let Some(connection) = self.remove(id) else {
            return false;
        };
        let _ = connection.terminate();
        warn!(
            conn_id = %id,
            remote = %connection.remote_addr,
            reason = reason.as_str(),
            "evicting connection"
        );
        counter!(WS_EVICTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        true
    }

    /// Point-in-time copy of the members, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.inner.read().connections.values().cloned().collect()
    }

    /// Look up a member.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        self.inner.read().connections.get(&id).cloned()
    }

    /// Whether `id` is a member.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().connections.contains_key(&id)
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drain every member, start its close handshake, and refuse further
    /// registrations.
    pub fn close_all(&self, code: u16, reason: &str) -> Vec<Arc<ClientConnection>> {
        let drained = {
            let mut inner = self.inner.write();
            inner.closed = true;
            let drained = std::mem::take(&mut inner.connections);
            record_active(0);
            drained
        };
        let connections: Vec<_> = drained.into_values().collect();
        for connection in &connections {
            if !connection.begin_close(code, reason) {
                debug!(conn_id = %connection.id, "connection already closing");
            }
        }
        connections
    }

    /// Whether [`close_all`](Self::close_all) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_active(count: usize) {
    gauge!(WS_CONNECTIONS_ACTIVE).set(count as f64);
}
