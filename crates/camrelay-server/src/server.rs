//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use camrelay_probe::Pinger;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::routes::build_router;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::websocket::broadcast::Broadcaster;
use crate::websocket::heartbeat::HeartbeatMonitor;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::{SessionContext, SessionSettings};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Registered subscribers.
    pub registry: Arc<ConnectionRegistry>,
    /// Fan-out over the registry.
    pub broadcaster: Arc<Broadcaster>,
    /// Host probe backend.
    pub pinger: Arc<dyn Pinger>,
    /// Bounds concurrent host probes (one child process each).
    pub probe_permits: Arc<Semaphore>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle; `/metrics` is 404 without one.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Handles and tunables for one WebSocket session.
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: self.registry.clone(),
            broadcaster: self.broadcaster.clone(),
            shutdown: self.shutdown.clone(),
            settings: SessionSettings {
                queue_capacity: self.config.send_queue_capacity,
                write_timeout: self.config.write_timeout(),
                relay_client_messages: self.config.relay_client_messages,
            },
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    pinger: Arc<dyn Pinger>,
    probe_permits: Arc<Semaphore>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, pinger: Arc<dyn Pinger>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let probe_permits = Arc::new(Semaphore::new(config.max_concurrent_probes.max(1)));
        Self {
            config: Arc::new(config),
            broadcaster: Arc::new(Broadcaster::new(registry.clone())),
            registry,
            pinger,
            probe_permits,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    fn state(&self) -> AppState {
        AppState {
            registry: self.registry.clone(),
            broadcaster: self.broadcaster.clone(),
            pinger: self.pinger.clone(),
            probe_permits: self.probe_permits.clone(),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        build_router(self.state())
    }

    /// Bind the configured address and start serving.
    ///
    /// Returns the bound address and a handle that completes once the
    /// listener has stopped and the heartbeat task has exited.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let heartbeat = HeartbeatMonitor::new(self.registry.clone(), self.config.heartbeat_interval());
        let heartbeat = tokio::spawn(heartbeat.run(self.shutdown.token()));

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let accept = self.shutdown.accept_token();

        info!(addr = %local_addr, "relay server listening");

        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(accept.cancelled_owned())
                .await
            {
                error!(error = %err, "server error");
            }
            let _ = heartbeat.await;
            info!("relay server stopped");
        });

        Ok((local_addr, handle))
    }

    /// Stop the heartbeat, close every subscriber with 1000 and stop accepting.
    pub async fn shutdown_gracefully(&self) -> ShutdownReport {
        self.shutdown
            .close_connections(&self.registry, self.config.close_grace())
            .await
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the broadcaster.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
