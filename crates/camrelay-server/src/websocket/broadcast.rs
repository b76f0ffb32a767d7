//! Fan-out of events to every open subscriber.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use super::connection::ConnectionId;
use super::protocol::{Event, ServerMessage};
use super::registry::{ConnectionRegistry, EvictionReason};
use crate::metrics::BROADCAST_DELIVERIES_TOTAL;

/// Delivers one message to every member of a registry snapshot.
///
/// Delivery is at-most-once and best-effort: a connection whose queue
/// rejects the message is evicted and the remaining connections still get
/// it. Nothing is retried or buffered for later subscribers.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Send a webhook event to all open connections.
    ///
    /// Returns how many connections accepted the message.
    pub fn broadcast(&self, event: &Event) -> usize {
        self.fan_out(&ServerMessage::event(event), None)
    }

    /// Send a message to all open connections except `exclude`.
    pub fn relay(&self, message: &ServerMessage, exclude: ConnectionId) -> usize {
        self.fan_out(message, Some(exclude))
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.registry.size()
    }

    fn fan_out(&self, message: &ServerMessage, exclude: Option<ConnectionId>) -> usize {
        let text = match message.to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to serialize broadcast message");
                return 0;
            }
        };

        let mut delivered = 0;
        for connection in self.registry.snapshot() {
            if Some(connection.id) == exclude {
                continue;
            }
            match connection.send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(conn_id = %connection.id, error = %err, "delivery failed");
                    let _ = self.registry.evict(connection.id, EvictionReason::SendFailed);
                }
            }
        }

        counter!(BROADCAST_DELIVERIES_TOTAL).increment(delivered as u64);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{ClientConnection, ConnectionState, Outbound};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<ConnectionRegistry>, Broadcaster) {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        (registry, broadcaster)
    }

    fn register(
        registry: &ConnectionRegistry,
        capacity: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(ClientConnection::new(registry.next_id(), "10.0.0.1:9", tx));
        registry.add(conn.clone()).unwrap();
        (conn, rx)
    }

    fn text(frame: Outbound) -> serde_json::Value {
        match frame {
            Outbound::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn broadcast_to_empty_registry() {
        let (_registry, broadcaster) = setup();
        let event = Event::new("cam", json!({"event": "motion"}));
        assert_eq!(broadcaster.broadcast(&event), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let (registry, broadcaster) = setup();
        let (_a, mut ra) = register(&registry, 4);
        let (_b, mut rb) = register(&registry, 4);

        let event = Event::new("cam", json!({"event": "motion"}));
        assert_eq!(broadcaster.broadcast(&event), 2);

        let va = text(ra.recv().await.unwrap());
        let vb = text(rb.recv().await.unwrap());
        assert_eq!(va, vb);
        assert_eq!(va["type"], "hikvision_event");
        assert_eq!(va["data"], json!({"event": "motion"}));
    }

    #[tokio::test]
    async fn failed_delivery_evicts_and_continues() {
        let (registry, broadcaster) = setup();
        let (a, mut ra) = register(&registry, 4);
        let (b, rb) = register(&registry, 4);
        let (c, mut rc) = register(&registry, 4);
        drop(rb);

        let event = Event::new("cam", json!({"n": 1}));
        assert_eq!(broadcaster.broadcast(&event), 2);

        assert!(!registry.contains(b.id));
        assert_eq!(b.state(), ConnectionState::Closed);
        assert!(registry.contains(a.id));
        assert!(registry.contains(c.id));
        assert!(ra.recv().await.is_some());
        assert!(rc.recv().await.is_some());
    }

    #[test]
    fn full_queue_evicts_slow_consumer() {
        let (registry, broadcaster) = setup();
        let (slow, _rx) = register(&registry, 1);
        let event = Event::new("cam", json!({}));
        assert_eq!(broadcaster.broadcast(&event), 1);
        assert_eq!(broadcaster.broadcast(&event), 0);
        assert!(!registry.contains(slow.id));
        assert_eq!(slow.drop_count(), 1);
    }

    #[test]
    fn connection_registered_later_misses_event() {
        let (registry, broadcaster) = setup();
        let event = Event::new("cam", json!({}));
        let _ = broadcaster.broadcast(&event);
        let (_late, mut rx) = register(&registry, 4);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn relay_skips_sender() {
        let (registry, broadcaster) = setup();
        let (sender, mut rs) = register(&registry, 4);
        let (_other, mut ro) = register(&registry, 4);

        let msg = ServerMessage::client_message("10.0.0.1", json!({"hello": true}));
        assert_eq!(broadcaster.relay(&msg, sender.id), 1);

        let v = text(ro.recv().await.unwrap());
        assert_eq!(v["type"], "client_message");
        assert!(rs.try_recv().is_err());
    }

    #[test]
    fn connection_count_tracks_registry() {
        let (registry, broadcaster) = setup();
        assert_eq!(broadcaster.connection_count(), 0);
        let (_a, _ra) = register(&registry, 1);
        assert_eq!(broadcaster.connection_count(), 1);
    }
}
