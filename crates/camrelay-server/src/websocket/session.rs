//! WebSocket session lifecycle: one connected subscriber from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::broadcast::Broadcaster;
use super::connection::{ClientConnection, Outbound};
use super::handler::{Dispatch, dispatch_text};
use super::registry::{ConnectionRegistry, EvictionReason};
use crate::metrics::{WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::shutdown::{CLOSE_NORMAL, SHUTDOWN_REASON, ShutdownCoordinator};

/// Per-session tunables taken from the server config.
#[derive(Clone, Copy, Debug)]
pub struct SessionSettings {
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// Upper bound on writing one frame to the socket.
    pub write_timeout: Duration,
    /// Relay non-ping client messages to other subscribers.
    pub relay_client_messages: bool,
}

/// Shared handles a session needs.
#[derive(Clone)]
pub struct SessionContext {
    /// Connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Fan-out for relayed client messages.
    pub broadcaster: Arc<Broadcaster>,
    /// Shutdown state; sessions opened during shutdown close at once.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Tunables.
    pub settings: SessionSettings,
}

/// Run a WebSocket session for a connected subscriber.
///
/// 1. Registers an `Open` connection (or closes at once during shutdown)
/// 2. Spawns the writer task draining the outbound queue
/// 3. Dispatches inbound frames until the peer leaves or the connection is
///    evicted or terminated
/// 4. Deregisters and terminates the connection
#[instrument(skip_all, fields(remote = %remote_addr))]
pub async fn run_ws_session(socket: WebSocket, remote_addr: String, ctx: SessionContext) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let registry = ctx.registry.clone();

    let (send_tx, send_rx) = mpsc::channel::<Outbound>(ctx.settings.queue_capacity.max(1));
    let connection = Arc::new(ClientConnection::new(
        registry.next_id(),
        remote_addr,
        send_tx,
    ));
    let id = connection.id;

    let registered = if ctx.shutdown.is_shutting_down() {
        false
    } else {
        match registry.add(connection.clone()) {
            Ok(()) => true,
            Err(err) => {
                debug!(conn_id = %id, error = %err, "connection not registered");
                false
            }
        }
    };
    if !registered {
        let frame = CloseFrame {
            code: CLOSE_NORMAL,
            reason: Utf8Bytes::from_static(SHUTDOWN_REASON),
        };
        let _ = tokio::time::timeout(
            ctx.settings.write_timeout,
            ws_tx.send(Message::Close(Some(frame))),
        )
        .await;
        let _ = connection.terminate();
        return;
    }

    info!(conn_id = %id, clients = registry.size(), "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);

    let writer = tokio::spawn(write_loop(
        ws_tx,
        send_rx,
        connection.clone(),
        registry.clone(),
        ctx.settings.write_timeout,
    ));

    loop {
        let frame = tokio::select! {
            () = connection.closed() => break,
            frame = ws_rx.next() => frame,
        };
        match frame {
            Some(Ok(msg)) => handle_frame(msg, &connection, &ctx),
            Some(Err(err)) => {
                debug!(conn_id = %id, error = %err, "websocket read failed");
                break;
            }
            None => break,
        }
    }

    let _ = registry.remove(id);
    let _ = connection.terminate();
    writer.abort();

    info!(conn_id = %id, clients = registry.size(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
}

/// Handle one inbound frame.
///
/// A Close frame needs no action here: the close reply is flushed by the
/// next read, after which the stream ends.
fn handle_frame(msg: Message, connection: &Arc<ClientConnection>, ctx: &SessionContext) {
    match msg {
        Message::Text(text) => handle_text(text.as_str(), connection, ctx),
        Message::Binary(data) => {
            if let Ok(text) = std::str::from_utf8(&data) {
                handle_text(text, connection, ctx);
            } else {
                debug!(conn_id = %connection.id, len = data.len(), "ignoring non-UTF8 binary frame");
            }
        }
        Message::Pong(_) => connection.acknowledge_liveness(),
        // axum answers Ping frames itself
        Message::Ping(_) => {}
        Message::Close(frame) => {
            let (code, reason) = frame
                .map(|f| (f.code, f.reason.as_str().to_owned()))
                .unwrap_or_default();
            info!(conn_id = %connection.id, code, reason = %reason, "client sent close frame");
        }
    }
}

fn handle_text(text: &str, connection: &Arc<ClientConnection>, ctx: &SessionContext) {
    let dispatch = match dispatch_text(text, &connection.remote_addr, ctx.settings.relay_client_messages) {
        Ok(dispatch) => dispatch,
        Err(err) => {
            warn!(conn_id = %connection.id, error = %err, "discarding malformed client message");
            return;
        }
    };

    match dispatch {
        Dispatch::Reply(reply) => match reply.to_text() {
            Ok(text) => {
                if let Err(err) = connection.send(text) {
                    debug!(conn_id = %connection.id, error = %err, "reply not queued");
                    let _ = ctx.registry.evict(connection.id, EvictionReason::SendFailed);
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize reply"),
        },
        Dispatch::Relay(message) => {
            let delivered = ctx.broadcaster.relay(&message, connection.id);
            debug!(conn_id = %connection.id, delivered, "relayed client message");
        }
        Dispatch::Ignore => {}
    }
}

/// Drain the outbound queue into the socket.
///
/// A failed or timed-out write evicts the connection. A Close frame is the
/// last thing written.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Outbound>,
    connection: Arc<ClientConnection>,
    registry: Arc<ConnectionRegistry>,
    write_timeout: Duration,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            next = queue.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
            () = connection.closed() => break,
        };

        let is_close = outbound.is_close();
        match tokio::time::timeout(write_timeout, sink.send(outbound.into_message())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(conn_id = %connection.id, error = %err, "websocket write failed");
                let _ = registry.evict(connection.id, EvictionReason::SendFailed);
                let _ = connection.terminate();
                break;
            }
            Err(_) => {
                let _ = registry.evict(connection.id, EvictionReason::WriteTimeout);
                let _ = connection.terminate();
                break;
            }
        }

        if is_close {
            break;
        }
    }
}
