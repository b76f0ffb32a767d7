//! Two-strike liveness detection.
//!
//! Every tick, each open connection either gets a Ping (and is marked
//! pending) or, if the previous tick's Ping is still unanswered, is evicted.
//! A silent subscriber is therefore reclaimed between one and two intervals
//! after it stops answering.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::{ConnectionRegistry, EvictionReason};

/// Outcome of one heartbeat tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Connections that were sent a Ping.
    pub probed: usize,
    /// Connections evicted this tick.
    pub evicted: usize,
}

/// Periodic liveness sweep over a registry.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor ticking every `interval`.
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Tick period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one sweep.
    pub fn tick(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();

        for connection in self.registry.snapshot() {
            if connection.liveness_pending() {
                if self.registry.evict(connection.id, EvictionReason::Unresponsive) {
                    report.evicted += 1;
                }
                continue;
            }
            match connection.send_liveness_probe() {
                Ok(()) => report.probed += 1,
                Err(err) => {
                    debug!(conn_id = %connection.id, error = %err, "liveness probe not queued");
                    if self.registry.evict(connection.id, EvictionReason::SendFailed) {
                        report.evicted += 1;
                    }
                }
            }
        }

        if report.evicted > 0 {
            info!(
                probed = report.probed,
                evicted = report.evicted,
                "heartbeat evicted connections"
            );
        }
        report
    }

    /// Tick until `cancel` fires. The first sweep happens one full interval
    /// after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.tick();
                }
                () = cancel.cancelled() => {
                    debug!("heartbeat stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{ClientConnection, ConnectionState, Outbound};
    use tokio::sync::mpsc;

    fn register(
        registry: &ConnectionRegistry,
        capacity: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(ClientConnection::new(registry.next_id(), "peer", tx));
        registry.add(conn.clone()).unwrap();
        (conn, rx)
    }

    fn monitor(registry: &Arc<ConnectionRegistry>) -> HeartbeatMonitor {
        HeartbeatMonitor::new(registry.clone(), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn first_tick_probes() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = register(&registry, 4);

        let report = monitor(&registry).tick();
        assert_eq!(report, HeartbeatReport { probed: 1, evicted: 0 });
        assert!(conn.liveness_pending());
        assert_eq!(rx.recv().await, Some(Outbound::Ping));
    }

    #[test]
    fn unanswered_probe_evicts_on_second_tick() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = register(&registry, 4);
        let hb = monitor(&registry);

        let _ = hb.tick();
        let report = hb.tick();
        assert_eq!(report, HeartbeatReport { probed: 0, evicted: 1 });
        assert!(!registry.contains(conn.id));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn answered_probe_survives() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = register(&registry, 8);
        let hb = monitor(&registry);

        for _ in 0..5 {
            let report = hb.tick();
            assert_eq!(report.evicted, 0);
            conn.acknowledge_liveness();
        }
        assert!(registry.contains(conn.id));
    }

    #[test]
    fn silence_after_one_answer_evicts_on_next_miss_only() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = register(&registry, 8);
        let hb = monitor(&registry);

        assert_eq!(hb.tick(), HeartbeatReport { probed: 1, evicted: 0 });
        conn.acknowledge_liveness();

        // Goes quiet: the first unanswered sweep only probes again.
        assert_eq!(hb.tick(), HeartbeatReport { probed: 1, evicted: 0 });
        assert!(registry.contains(conn.id));
        assert!(conn.is_open());

        assert_eq!(hb.tick(), HeartbeatReport { probed: 0, evicted: 1 });
        assert!(!registry.contains(conn.id));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn connection_joining_between_ticks_gets_full_window() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hb = monitor(&registry);
        let _ = hb.tick();

        let (late, _rx) = register(&registry, 4);
        let report = hb.tick();
        assert_eq!(report.evicted, 0);
        assert!(late.liveness_pending());
        assert!(registry.contains(late.id));
    }

    #[test]
    fn full_queue_evicts_immediately() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = register(&registry, 1);
        conn.send(axum::extract::ws::Utf8Bytes::from_static("x")).unwrap();

        let report = monitor(&registry).tick();
        assert_eq!(report, HeartbeatReport { probed: 0, evicted: 1 });
        assert!(!registry.contains(conn.id));
    }

    #[test]
    fn empty_registry_tick() {
        let registry = Arc::new(ConnectionRegistry::new());
        assert_eq!(monitor(&registry).tick(), HeartbeatReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn run_evicts_silent_connection_within_two_intervals() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = register(&registry, 8);
        let cancel = CancellationToken::new();
        let hb = HeartbeatMonitor::new(registry.clone(), Duration::from_millis(100));
        let handle = tokio::spawn(hb.run(cancel.clone()));

        time::sleep(Duration::from_millis(150)).await;
        assert!(registry.contains(conn.id), "first tick only probes");
        assert!(conn.liveness_pending());

        time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.contains(conn.id));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_keeps_responsive_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = register(&registry, 64);
        let cancel = CancellationToken::new();
        let hb = HeartbeatMonitor::new(registry.clone(), Duration::from_millis(100));
        let handle = tokio::spawn(hb.run(cancel.clone()));

        for _ in 0..10 {
            time::sleep(Duration::from_millis(50)).await;
            conn.acknowledge_liveness();
        }
        assert!(registry.contains(conn.id));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let registry = Arc::new(ConnectionRegistry::new());
        let cancel = CancellationToken::new();
        let hb = HeartbeatMonitor::new(registry, Duration::from_secs(3600));
        let handle = tokio::spawn(hb.run(cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }
}
