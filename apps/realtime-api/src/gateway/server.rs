//! WebSocket upgrade handler and per-connection event loop.

use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time;

use studyhall_common::protocol::close_code;

use crate::AppState;

use super::registry::Outbound;

/// Handshake metadata: the user identity is read once from the upgrade query
/// and is immutable for the connection's lifetime. Absent or empty means an
/// anonymous connection: served, but never registered.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    user_id: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, params.user_id, state))
}

async fn handle_connection(socket: WebSocket, user_id: Option<String>, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let user_id = user_id.filter(|u| !u.is_empty());

    // Registering broadcasts the updated online set and, when this user was
    // already connected elsewhere, queues a close on the old handle first.
    let registration = user_id.map(|uid| {
        let conn_id = state.registry.register(&uid, tx.clone());
        tracing::info!(user_id = %uid, conn_id, "gateway connection established");
        (uid, conn_id)
    });
    if registration.is_none() {
        tracing::debug!("anonymous gateway connection established");
    }

    // Server-driven keepalive: ping on the configured interval, close when no
    // Pong has arrived within the timeout.
    let heartbeat_timeout = state.config.heartbeat_timeout;
    let mut ping_timer = time::interval(state.config.heartbeat_interval);
    ping_timer.tick().await; // First tick fires immediately; skip it.
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            // Event queued by the registry (broadcast, targeted push, eviction).
            outbound = rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(json)) => {
                        if ws_tx.send(Message::Text(json.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = send_close(&mut ws_tx, code, reason).await;
                        break;
                    }
                    None => break,
                }
            }

            // Frame from the client.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    // Pings are answered by the transport layer.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Text(_))) => {
                        tracing::debug!("ignoring unexpected client text frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(?err, "ws read error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            // Heartbeat: detect clients that vanished without a clean close.
            _ = ping_timer.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    let _ = send_close(
                        &mut ws_tx,
                        close_code::HEARTBEAT_TIMEOUT,
                        "Heartbeat timeout",
                    )
                    .await;
                    break;
                }
                if ws_tx.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Runs exactly once per connection close, whatever the cause. A stale
    // conn_id (this handle was evicted) makes this a no-op inside the
    // registry, so the successor's entry is untouched.
    match registration {
        Some((uid, conn_id)) => {
            state.registry.unregister(&uid, conn_id);
            tracing::info!(user_id = %uid, conn_id, "gateway connection closed");
        }
        None => {
            tracing::debug!("anonymous gateway connection closed");
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
