//! # camrelay
//!
//! Relay server binary: loads configuration, initializes logging and
//! metrics, and serves until SIGINT or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use camrelay_logging::LogFormat;
use camrelay_probe::SystemPinger;
use camrelay_server::config::ServerConfig;
use camrelay_server::server::RelayServer;
use clap::Parser;

/// Camera webhook to WebSocket relay.
#[derive(Parser, Debug)]
#[command(name = "camrelay", about = "Relay camera webhook events to WebSocket subscribers")]
struct Cli {
    /// Host to bind (overrides config file and `HOST`).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config file and `PORT`).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level or `tracing` filter directive (`RUST_LOG` wins).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format: compact or json.
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Do not install the Prometheus recorder; `/metrics` returns 404.
    #[arg(long)]
    no_metrics: bool,
}

impl Cli {
    /// Layer CLI flags over the file and environment config.
    fn resolve_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::load(self.config.as_deref())
            .context("Failed to load configuration")?;
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        Ok(config)
    }
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    camrelay_logging::init_subscriber(&args.log_level, args.log_format);

    let config = args.resolve_config()?;
    let shutdown_timeout = config.shutdown_timeout();
    let pinger = Arc::new(SystemPinger::new(config.probe.clone()));

    let mut server = RelayServer::new(config, pinger);
    if !args.no_metrics {
        let handle = camrelay_server::metrics::install_recorder()
            .context("Failed to install metrics recorder")?;
        server = server.with_metrics(handle);
    }

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!(
        heartbeat_ms = server.config().heartbeat_interval_ms,
        "camrelay listening on http://{addr} (WebSocket ws://{addr}/)"
    );

    shutdown_signal().await?;

    tracing::info!("Shutting down...");
    let report = server.shutdown_gracefully().await;
    tracing::info!(closing = report.closing, forced = report.forced, "client connections closed");
    server
        .shutdown()
        .graceful_shutdown(vec![handle], Some(shutdown_timeout))
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}
