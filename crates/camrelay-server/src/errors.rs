//! Error types for the relay server.

use std::path::PathBuf;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::websocket::connection::ConnectionId;

/// Registry membership failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A connection with this id is already registered.
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    /// Only `Open` connections may be registered.
    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),
    /// The registry was drained for shutdown and accepts no new members.
    #[error("registry is closed")]
    Closed,
}

/// Failure to enqueue an outbound frame for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection has left the `Open` state.
    #[error("connection is not open")]
    NotOpen,
    /// The per-connection queue is at capacity (slow consumer).
    #[error("send queue is full")]
    QueueFull,
    /// The writer task is gone.
    #[error("send channel closed")]
    ChannelClosed,
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid JSON for [`ServerConfig`](crate::config::ServerConfig).
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File that was being parsed.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors returned from HTTP handlers.
///
/// Rendered as `{"success": false, "error": "..."}`. Internal details are
/// logged and replaced with a generic message.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Caller input was rejected (400).
    #[error("{0}")]
    BadRequest(String),
    /// Request refused with a specific status (413, 429, upgrade failures).
    #[error("{1}")]
    Rejected(StatusCode, String),
    /// Server-side failure (500).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Body used for every 500 response.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal Server Error";

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Rejected(status, _) => *status,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::BadRequest(message) | Self::Rejected(_, message) => message,
            Self::Internal(detail) => {
                error!(detail = %detail, "request failed");
                INTERNAL_ERROR_MESSAGE.to_string()
            }
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}
