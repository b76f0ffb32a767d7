//! # camrelay-server
//!
//! Axum HTTP + `WebSocket` server that relays camera webhook events to
//! subscribers.
//!
//! - HTTP endpoints: webhook intake, health, liveness, host probe, metrics
//! - `WebSocket` gateway: connection registry, heartbeat, message dispatch
//! - Fan-out of each event to every open subscriber through bounded queues
//! - Graceful shutdown via `CancellationToken` with a close handshake grace

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{AppState, RelayServer};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
