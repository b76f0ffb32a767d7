//! HTTP handlers and router assembly.

use std::any::Any;
use std::net::SocketAddr;
use std::time::Instant;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::rejection::{BytesRejection, ExtensionRejection, QueryRejection};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use camrelay_probe::{ProbeResult, ValidatedTarget};
use chrono::Utc;
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::errors::{ApiError, INTERNAL_ERROR_MESSAGE};
use crate::health::{self, HealthResponse, PingResponse};
use crate::metrics::{PROBE_DURATION_SECONDS, PROBE_REQUESTS_TOTAL, WEBHOOK_EVENTS_TOTAL};
use crate::server::AppState;
use crate::websocket::protocol::{Event, format_timestamp};
use crate::websocket::session::run_ws_session;

/// Example shown when `target` is missing.
const TARGET_REQUIRED: &str = "target is required, e.g. /ping/host?target=192.168.1.64";
const TARGET_INVALID: &str = "target has an invalid format";
const PROBES_BUSY: &str = "too many host probes in progress, retry shortly";

/// Peer address when the server runs without connect info (router tests).
const UNKNOWN_PEER: &str = "unknown";

type Peer = Result<ConnectInfo<SocketAddr>, ExtensionRejection>;

fn peer_ip(peer: &Peer) -> String {
    match peer {
        Ok(ConnectInfo(addr)) => addr.ip().to_string(),
        Err(_) => UNKNOWN_PEER.to_string(),
    }
}

/// Build the full router with middleware.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;

    Router::new()
        .route("/", get(root_handler))
        .route("/ws", get(ws_handler))
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health_handler))
        .route("/ping", get(ping_handler))
        .route("/ping/host", get(ping_host_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .with_state(state)
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail, "handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": INTERNAL_ERROR_MESSAGE })),
    )
        .into_response()
}

fn upgrade(ws: WebSocketUpgrade, peer: &Peer, state: &AppState) -> Response {
    let remote = peer_ip(peer);
    let ctx = state.session_context();
    ws.on_upgrade(move |socket| run_ws_session(socket, remote, ctx))
}

/// GET /: WebSocket upgrade, or the endpoint listing for plain requests.
async fn root_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    peer: Peer,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if let Ok(ws) = ws {
        return upgrade(ws, &peer, &state);
    }

    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map_or_else(|| state.config.bind_addr(), str::to_string);

    Json(json!({
        "message": "camrelay WebSocket relay",
        "endpoints": {
            "webhook": "POST /webhook",
            "health": "GET /health",
            "ping": "GET /ping",
            "pingHost": "GET /ping/host?target=<host|ip>&timeoutMs=2000",
            "metrics": "GET /metrics",
        },
        "websocket": format!("ws://{host}/"),
    }))
    .into_response()
}

/// GET /ws: WebSocket upgrade.
async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    peer: Peer,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let ws = ws.map_err(|rejection| ApiError::Rejected(rejection.status(), rejection.body_text()))?;
    Ok(upgrade(ws, &peer, &state))
}

/// POST /webhook: fan the body out to every subscriber.
async fn webhook_handler(
    peer: Peer,
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Value>, ApiError> {
    let body =
        body.map_err(|rejection| ApiError::Rejected(rejection.status(), rejection.body_text()))?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("request body is required".into()));
    }
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("request body is not valid JSON: {err}")))?;
    if payload.is_null() {
        return Err(ApiError::BadRequest("request body is required".into()));
    }

    let event = Event::new(peer_ip(&peer), payload);
    counter!(WEBHOOK_EVENTS_TOTAL).increment(1);
    debug!(source = %event.source_address, payload = %event.payload, "webhook event received");

    let delivered = state.broadcaster.broadcast(&event);
    info!(source = %event.source_address, delivered, "webhook event relayed");

    Ok(Json(json!({
        "success": true,
        "clientCount": delivered,
        "timestamp": format_timestamp(Utc::now()),
    })))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.registry.size()))
}

/// GET /ping
async fn ping_handler(State(state): State<AppState>) -> Json<PingResponse> {
    Json(health::ping(state.start_time, state.registry.size()))
}

/// Query string for `/ping/host`.
///
/// `timeoutMs` is taken as text so a non-numeric value falls back to the
/// default instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct HostProbeQuery {
    /// Host name or IP literal.
    pub target: Option<String>,
    /// Requested timeout in milliseconds.
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: Option<String>,
}

/// GET /ping/host: reachability probe of one target.
async fn ping_host_handler(
    query: Result<Query<HostProbeQuery>, QueryRejection>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query.map_err(|err| ApiError::BadRequest(err.body_text()))?;

    let raw = query.target.unwrap_or_default();
    if raw.trim().is_empty() {
        return Err(ApiError::BadRequest(TARGET_REQUIRED.into()));
    }
    let target =
        ValidatedTarget::parse(&raw).map_err(|_| ApiError::BadRequest(TARGET_INVALID.into()))?;

    let requested = query
        .timeout_ms
        .as_deref()
        .and_then(|v| v.trim().parse::<f64>().ok());
    let timeout_ms = state.config.probe.resolve_timeout(requested);

    // Each probe is a child process; refuse rather than queue past the bound.
    let Ok(_permit) = state.probe_permits.try_acquire() else {
        counter!(PROBE_REQUESTS_TOTAL, "outcome" => "busy").increment(1);
        debug!(probe_target = %target, "host probe refused, all permits in use");
        return Err(ApiError::Rejected(StatusCode::TOO_MANY_REQUESTS, PROBES_BUSY.into()));
    };

    let started = Instant::now();
    let result = state.pinger.probe(&target, timeout_ms).await;
    histogram!(PROBE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    let result = result.map_err(|err| {
        counter!(PROBE_REQUESTS_TOTAL, "outcome" => "error").increment(1);
        if err.is_client_error() {
            ApiError::BadRequest(TARGET_INVALID.into())
        } else {
            ApiError::Internal(err.to_string())
        }
    })?;
    counter!(PROBE_REQUESTS_TOTAL, "outcome" => probe_outcome(&result)).increment(1);
    info!(
        probe_target = %target,
        timeout_ms,
        succeeded = result.succeeded,
        exit_code = result.exit_code,
        rtt_ms = result.round_trip_ms,
        "host probe finished"
    );

    Ok(Json(json!({
        "success": result.succeeded,
        "target": target.as_str(),
        "rtt_ms": result.round_trip_ms,
        "exitCode": result.exit_code,
        "stdout": result.stdout,
        "stderr": result.stderr,
        "timestamp": format_timestamp(Utc::now()),
    })))
}

fn probe_outcome(result: &ProbeResult) -> &'static str {
    if result.timed_out {
        "timeout"
    } else if result.succeeded {
        "success"
    } else {
        "failure"
    }
}

/// GET /metrics: Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
