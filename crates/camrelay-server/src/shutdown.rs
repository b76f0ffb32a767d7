//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::websocket::registry::ConnectionRegistry;

/// Default timeout for graceful shutdown before force-exiting.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket close code sent on shutdown (normal closure).
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close reason sent on shutdown.
pub const SHUTDOWN_REASON: &str = "Server shutdown";

/// What happened to the open connections during shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that were sent a Close frame.
    pub closing: usize,
    /// Connections force-terminated after the grace period.
    pub forced: usize,
}

/// Coordinates graceful shutdown across all server tasks.
///
/// Two tokens: `token` fires first and stops background work (heartbeat,
/// new sessions); `accept` fires after connections have been told to close
/// and releases the listener.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    accept: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            accept: CancellationToken::new(),
        }
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token cancelled when the listener should stop accepting.
    pub fn accept_token(&self) -> CancellationToken {
        self.accept.clone()
    }

    /// Signal shutdown without touching connections.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close every connection in `registry` and stop accepting.
    ///
    /// 1. Cancel the shutdown token (heartbeat stops, new sessions refused)
    /// 2. Queue a Close frame on every registered connection
    /// 3. Cancel the accept token
    /// 4. Wait up to `close_grace` for the handshakes, then terminate the rest
    pub async fn close_connections(
        &self,
        registry: &ConnectionRegistry,
        close_grace: Duration,
    ) -> ShutdownReport {
        self.shutdown();
        let closing = registry.close_all(CLOSE_NORMAL, SHUTDOWN_REASON);
        self.accept.cancel();

        info!(connections = closing.len(), "closing client connections");

        let all_closed = futures::future::join_all(closing.iter().map(|c| c.closed()));
        let mut forced = 0;
        if tokio::time::timeout(close_grace, all_closed).await.is_err() {
            for connection in &closing {
                if connection.terminate() {
                    forced += 1;
                }
            }
            warn!(forced, "connections did not finish closing in {close_grace:?}");
        }

        ShutdownReport {
            closing: closing.len(),
            forced,
        }
    }

    /// Wait up to `timeout` for tracked tasks to finish.
    ///
    /// Tasks still running afterwards are left to die with the runtime.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        self.accept.cancel();
        info!(
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );

        let drain = futures::future::join_all(handles);

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
