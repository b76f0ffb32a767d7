//! Server configuration.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If a JSON file is given, read it over the defaults (missing keys keep
//!    their default values)
//! 3. Apply environment variable overrides
//!
//! Command-line flags are applied last by the binary.

use std::path::Path;
use std::time::Duration;

use camrelay_probe::ProbeConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ConfigError;

/// Configuration for the relay server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Outbound queue capacity per connection.
    pub send_queue_capacity: usize,
    /// Upper bound on writing one frame to a socket (ms).
    pub write_timeout_ms: u64,
    /// How long shutdown waits for close handshakes (ms).
    pub close_grace_ms: u64,
    /// How long the process waits for the server task on shutdown (ms).
    pub shutdown_timeout_ms: u64,
    /// Maximum webhook body size in bytes.
    pub max_body_bytes: usize,
    /// Relay non-ping client messages to the other subscribers.
    pub relay_client_messages: bool,
    /// Host probes allowed to run at once; further requests get 429.
    pub max_concurrent_probes: usize,
    /// Host probe settings.
    pub probe: ProbeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8062,
            heartbeat_interval_ms: 30_000,
            send_queue_capacity: 256,
            write_timeout_ms: 2_000,
            close_grace_ms: 2_000,
            shutdown_timeout_ms: 10_000,
            max_body_bytes: 10 * 1024 * 1024, // 10 MiB
            relay_client_messages: true,
            max_concurrent_probes: 4,
            probe: ProbeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read a JSON config file over the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(?path, "loading config file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`. Invalid values are logged and ignored.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `HOST` | `host` |
    /// | `PORT` | `port` |
    /// | `CAMRELAY_HEARTBEAT_INTERVAL_MS` | `heartbeat_interval_ms` (100-600000) |
    /// | `CAMRELAY_SEND_QUEUE` | `send_queue_capacity` (1-65536) |
    /// | `CAMRELAY_RELAY_CLIENT_MESSAGES` | `relay_client_messages` |
    /// | `CAMRELAY_MAX_CONCURRENT_PROBES` | `max_concurrent_probes` (1-256) |
    /// | `CAMRELAY_PING_PROGRAM` | `probe.program` |
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = read("HOST") {
            self.host = v;
        }
        if let Some(v) = read("PORT") {
            match parse_u16_range(&v, 0, u16::MAX) {
                Some(port) => self.port = port,
                None => warn!(key = "PORT", value = %v, "invalid port env var, ignoring"),
            }
        }
        if let Some(v) = read("CAMRELAY_HEARTBEAT_INTERVAL_MS") {
            match parse_u64_range(&v, 100, 600_000) {
                Some(ms) => self.heartbeat_interval_ms = ms,
                None => warn!(key = "CAMRELAY_HEARTBEAT_INTERVAL_MS", value = %v, "invalid u64 env var, ignoring"),
            }
        }
        if let Some(v) = read("CAMRELAY_SEND_QUEUE") {
            match parse_usize_range(&v, 1, 65_536) {
                Some(n) => self.send_queue_capacity = n,
                None => warn!(key = "CAMRELAY_SEND_QUEUE", value = %v, "invalid usize env var, ignoring"),
            }
        }
        if let Some(v) = read("CAMRELAY_RELAY_CLIENT_MESSAGES") {
            match parse_bool(&v) {
                Some(b) => self.relay_client_messages = b,
                None => warn!(key = "CAMRELAY_RELAY_CLIENT_MESSAGES", value = %v, "invalid boolean env var, ignoring"),
            }
        }
        if let Some(v) = read("CAMRELAY_MAX_CONCURRENT_PROBES") {
            match parse_usize_range(&v, 1, 256) {
                Some(n) => self.max_concurrent_probes = n,
                None => warn!(key = "CAMRELAY_MAX_CONCURRENT_PROBES", value = %v, "invalid usize env var, ignoring"),
            }
        }
        if let Some(v) = read("CAMRELAY_PING_PROGRAM") {
            self.probe.program = v;
        }
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Per-frame write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Close handshake grace period.
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Overall shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
