//! `/health` and `/ping` response bodies.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::websocket::protocol::format_timestamp;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"OK"` when the server is running.
    pub status: &'static str,
    /// Registered WebSocket connections.
    pub clients: usize,
    /// Seconds since the server started.
    pub uptime: f64,
    /// Response time.
    pub timestamp: String,
}

/// Liveness response body for `/ping`.
#[derive(Debug, Clone, Serialize)]
pub struct PingResponse {
    /// Always `true`.
    pub pong: bool,
    /// Registered WebSocket connections.
    pub clients: usize,
    /// Seconds since the server started.
    pub uptime: f64,
    /// Response time.
    pub timestamp: String,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, clients: usize) -> HealthResponse {
    HealthResponse {
        status: "OK",
        clients,
        uptime: start_time.elapsed().as_secs_f64(),
        timestamp: format_timestamp(Utc::now()),
    }
}

/// Build a `/ping` response from live counters.
pub fn ping(start_time: Instant, clients: usize) -> PingResponse {
    PingResponse {
        pong: true,
        clients,
        uptime: start_time.elapsed().as_secs_f64(),
        timestamp: format_timestamp(Utc::now()),
    }
}
