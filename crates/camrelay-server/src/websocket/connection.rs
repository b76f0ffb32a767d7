//! Subscriber connection state.
//!
//! A connection moves `Open -> Closing -> Closed` or straight from `Open` to
//! `Closed` on eviction. `Closed` is terminal. All outbound traffic goes
//! through a bounded queue drained by the session's writer task, so nothing
//! here ever awaits.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::SendError;

/// Process-unique connection id, rendered as `conn-<n>`.
///
/// Ids are handed out in increasing order, so comparing ids compares
/// registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered and accepting outbound frames.
    Open,
    /// A Close frame has been queued; waiting for the peer.
    Closing,
    /// Gone. Terminal.
    Closed,
}

/// A frame queued for the writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized JSON text message.
    Text(Utf8Bytes),
    /// WebSocket Ping control frame (liveness probe).
    Ping,
    /// WebSocket Close frame.
    Close {
        /// Close status code.
        code: u16,
        /// Human-readable reason.
        reason: Utf8Bytes,
    },
}

impl Outbound {
    /// Convert to a wire message.
    pub fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Ping => Message::Ping(Vec::new().into()),
            Self::Close { code, reason } => Message::Close(Some(CloseFrame { code, reason })),
        }
    }

    /// Whether this is the final frame the writer will send.
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close { .. })
    }
}

/// One connected subscriber.
pub struct ClientConnection {
    /// Unique connection id.
    pub id: ConnectionId,
    /// Peer address, informational only.
    pub remote_addr: String,
    /// When this connection was established.
    pub connected_at: Instant,
    tx: mpsc::Sender<Outbound>,
    state: Mutex<ConnectionState>,
    liveness_pending: AtomicBool,
    dropped_messages: AtomicU64,
    closed: CancellationToken,
}

impl ClientConnection {
    /// Create an `Open` connection feeding `tx`.
    pub fn new(id: ConnectionId, remote_addr: impl Into<String>, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            remote_addr: remote_addr.into(),
            connected_at: Instant::now(),
            tx,
            state: Mutex::new(ConnectionState::Open),
            liveness_pending: AtomicBool::new(false),
            dropped_messages: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether the connection is `Open`.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Enqueue a text message without waiting.
    pub fn send(&self, text: Utf8Bytes) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotOpen);
        }
        self.enqueue(Outbound::Text(text))
    }

    fn enqueue(&self, frame: Outbound) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                SendError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Mark a liveness probe outstanding and enqueue a Ping frame.
    pub fn send_liveness_probe(&self) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotOpen);
        }
        self.liveness_pending.store(true, Ordering::Release);
        self.enqueue(Outbound::Ping)
    }

    /// A Pong arrived: clear the outstanding probe.
    pub fn acknowledge_liveness(&self) {
        self.liveness_pending.store(false, Ordering::Release);
    }

    /// Whether a probe was sent and not yet answered.
    pub fn liveness_pending(&self) -> bool {
        self.liveness_pending.load(Ordering::Acquire)
    }

    /// Move `Open -> Closing` and queue a Close frame.
    ///
    /// Returns `false` if the connection was not `Open`. A Close frame that
    /// does not fit in the queue is dropped; the caller's grace period then
    /// ends in [`terminate`](Self::terminate).
    pub fn begin_close(&self, code: u16, reason: &str) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Open {
                return false;
            }
            *state = ConnectionState::Closing;
        }
        let _ = self.enqueue(Outbound::Close {
            code,
            reason: Utf8Bytes::from(reason.to_string()),
        });
        true
    }

    /// Force the connection to `Closed` and wake its session.
    ///
    /// Returns `true` only on the call that performed the transition.
    pub fn terminate(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
        }
        self.closed.cancel();
        true
    }

    /// Whether the connection reached `Closed`.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is `Closed`.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Messages dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("liveness_pending", &self.liveness_pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (ClientConnection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = ClientConnection::new(ConnectionId::new(1), "127.0.0.1:5000", tx);
        (conn, rx)
    }

    #[test]
    fn id_display() {
        assert_eq!(ConnectionId::new(42).to_string(), "conn-42");
        assert_eq!(ConnectionId::new(42).get(), 42);
    }

    #[test]
    fn id_orders_by_value() {
        assert!(ConnectionId::new(1) < ConnectionId::new(2));
    }

    #[test]
    fn id_serializes_as_string() {
        let json = serde_json::to_value(ConnectionId::new(3)).unwrap();
        assert_eq!(json, "conn-3");
    }

    #[test]
    fn create_connection() {
        let (conn, _rx) = make_connection(4);
        assert_eq!(conn.id, ConnectionId::new(1));
        assert_eq!(conn.remote_addr, "127.0.0.1:5000");
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(!conn.liveness_pending());
        assert!(!conn.is_closed());
        assert_eq!(conn.drop_count(), 0);
    }

    #[tokio::test]
    async fn send_enqueues_text() {
        let (conn, mut rx) = make_connection(4);
        conn.send(Utf8Bytes::from_static("hello")).unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Text(Utf8Bytes::from_static("hello"))));
    }

    #[test]
    fn send_full_queue_counts_drop() {
        let (conn, _rx) = make_connection(1);
        conn.send(Utf8Bytes::from_static("a")).unwrap();
        assert_eq!(conn.send(Utf8Bytes::from_static("b")), Err(SendError::QueueFull));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn send_after_receiver_dropped() {
        let (conn, rx) = make_connection(4);
        drop(rx);
        assert_eq!(conn.send(Utf8Bytes::from_static("a")), Err(SendError::ChannelClosed));
    }

    #[test]
    fn send_when_not_open() {
        let (conn, _rx) = make_connection(4);
        assert!(conn.terminate());
        assert_eq!(conn.send(Utf8Bytes::from_static("a")), Err(SendError::NotOpen));
    }

    #[tokio::test]
    async fn liveness_probe_sets_pending_and_queues_ping() {
        let (conn, mut rx) = make_connection(4);
        conn.send_liveness_probe().unwrap();
        assert!(conn.liveness_pending());
        assert_eq!(rx.recv().await, Some(Outbound::Ping));
    }

    #[test]
    fn acknowledge_clears_pending() {
        let (conn, _rx) = make_connection(4);
        conn.send_liveness_probe().unwrap();
        conn.acknowledge_liveness();
        assert!(!conn.liveness_pending());
    }

    #[tokio::test]
    async fn begin_close_queues_close_frame() {
        let (conn, mut rx) = make_connection(4);
        assert!(conn.begin_close(1000, "Server shutdown"));
        assert_eq!(conn.state(), ConnectionState::Closing);
        let frame = rx.recv().await.unwrap();
        assert!(frame.is_close());
        assert_eq!(
            frame,
            Outbound::Close {
                code: 1000,
                reason: Utf8Bytes::from_static("Server shutdown"),
            }
        );
    }

    #[test]
    fn begin_close_only_from_open() {
        let (conn, _rx) = make_connection(4);
        assert!(conn.begin_close(1000, "bye"));
        assert!(!conn.begin_close(1000, "bye"));
        assert_eq!(conn.send(Utf8Bytes::from_static("a")), Err(SendError::NotOpen));
    }

    #[test]
    fn terminate_is_idempotent() {
        let (conn, _rx) = make_connection(4);
        assert!(conn.terminate());
        assert!(!conn.terminate());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.is_closed());
    }

    #[test]
    fn closed_is_terminal() {
        let (conn, _rx) = make_connection(4);
        let _ = conn.terminate();
        assert!(!conn.begin_close(1000, "late"));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn closed_future_resolves_on_terminate() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = std::sync::Arc::new(ClientConnection::new(ConnectionId::new(9), "x", tx));
        let waiter = conn.clone();
        let handle = tokio::spawn(async move { waiter.closed().await });
        let _ = conn.terminate();
        handle.await.unwrap();
    }

    #[test]
    fn outbound_into_message() {
        assert!(matches!(
            Outbound::Text(Utf8Bytes::from_static("x")).into_message(),
            Message::Text(_)
        ));
        assert!(matches!(Outbound::Ping.into_message(), Message::Ping(_)));
        match (Outbound::Close {
            code: 1000,
            reason: Utf8Bytes::from_static("bye"),
        })
        .into_message()
        {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn age_is_monotonic() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.age() < Duration::from_secs(5));
    }
}
