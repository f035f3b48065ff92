//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time;

use crate::AppState;

use super::connection::GatewayConnection;
use super::events::{
    ClientMessage, GatewayMessage, HeartbeatPayload, IdentifyPayload, SubscriptionPayload,
    OP_HEARTBEAT, OP_IDENTIFY, OP_SUBSCRIBE, OP_UNSUBSCRIBE,
};
use super::fanout::BroadcastPayload;
use super::handler::{handle_identify, handle_subscribe, handle_unsubscribe, HEARTBEAT_INTERVAL_MS};
use super::presence::DirectReceiver;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_DECODE_ERROR: u16 = 4002;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: wait for IDENTIFY within the timeout.
    let identify = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let text = match msg {
                Ok(Message::Text(t)) => t,
                Ok(Message::Close(_)) => return Err("client closed"),
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err("read error");
                }
            };

            let client_msg: ClientMessage =
                serde_json::from_str(&text).map_err(|_| "Invalid JSON")?;
            if client_msg.op != OP_IDENTIFY {
                let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, "Expected IDENTIFY").await;
                return Err("expected identify");
            }
            return serde_json::from_value::<IdentifyPayload>(client_msg.d)
                .map_err(|_| "invalid identify payload");
        }
        Err("connection closed before identify")
    })
    .await;

    let payload = match identify {
        Ok(Ok(payload)) => payload,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "initial handshake failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    let (connection, ready_msg) = match handle_identify(&state, payload).await {
        Ok(result) => result,
        Err(reason) => {
            tracing::debug!(%reason, "identify handler failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
    };

    // Subscribe and register before READY so nothing committed after READY
    // is missed.
    let broadcast_rx = state.broadcast.subscribe();
    let (presence_id, direct_rx) = state.presence.register(&connection.user_id);

    tracing::info!(
        connection_id = %connection.connection_id,
        user_id = %connection.user_id,
        "gateway connection established"
    );

    let connection = Arc::new(connection);
    if send_message(&mut ws_tx, &ready_msg).await {
        run_connection(&state, connection.clone(), ws_tx, ws_rx, broadcast_rx, direct_rx).await;
    }

    state.presence.unregister(&connection.user_id, presence_id);
}

/// Main connection loop: read client messages, forward broadcasts and direct
/// messages, enforce heartbeat.
async fn run_connection(
    state: &AppState,
    connection: Arc<GatewayConnection>,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut broadcast_rx: broadcast::Receiver<Arc<BroadcastPayload>>,
    mut direct_rx: DirectReceiver,
) {
    // Heartbeat deadline: client must heartbeat within 1.5x the interval.
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %connection.connection_id, "ws read error");
                        break;
                    }
                };

                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(_) => {
                        let _ = send_close(&mut ws_tx, CLOSE_DECODE_ERROR, "Invalid JSON").await;
                        break;
                    }
                };

                match client_msg.op {
                    OP_HEARTBEAT => {
                        got_heartbeat = true;
                        let payload: HeartbeatPayload = serde_json::from_value(client_msg.d)
                            .unwrap_or(HeartbeatPayload { seq: 0 });
                        if !send_message(&mut ws_tx, &GatewayMessage::heartbeat_ack(payload.seq)).await {
                            break;
                        }
                    }
                    OP_SUBSCRIBE => {
                        let Ok(payload) = serde_json::from_value::<SubscriptionPayload>(client_msg.d) else {
                            let _ = send_close(&mut ws_tx, CLOSE_DECODE_ERROR, "Invalid subscribe payload").await;
                            break;
                        };
                        match handle_subscribe(state, &connection, payload).await {
                            Ok(ack) => {
                                if !send_message(&mut ws_tx, &ack).await {
                                    break;
                                }
                            }
                            Err(reason) => {
                                tracing::debug!(%reason, connection_id = %connection.connection_id, "subscribe refused");
                            }
                        }
                    }
                    OP_UNSUBSCRIBE => {
                        if let Ok(payload) = serde_json::from_value::<SubscriptionPayload>(client_msg.d) {
                            handle_unsubscribe(&connection, payload);
                        }
                    }
                    OP_IDENTIFY => {
                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                        break;
                    }
                    _ => {
                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                        break;
                    }
                }
            }

            // Session-wide event from the fanout hub.
            result = broadcast_rx.recv() => {
                match result {
                    Ok(payload) => {
                        if !connection.is_subscribed(&payload.session_id) {
                            continue;
                        }
                        let seq = connection.next_seq();
                        let msg = GatewayMessage::dispatch(&payload.event_name, seq, payload.data.clone());
                        if !send_message(&mut ws_tx, &msg).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            connection_id = %connection.connection_id,
                            skipped = n,
                            "gateway connection lagged behind broadcast"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // Event addressed to this user.
            Some(direct) = direct_rx.recv() => {
                let seq = connection.next_seq();
                let msg = GatewayMessage::dispatch(&direct.event_name, seq, direct.data.clone());
                if !send_message(&mut ws_tx, &msg).await {
                    break;
                }
            }

            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %connection.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }

    tracing::info!(
        connection_id = %connection.connection_id,
        user_id = %connection.user_id,
        "gateway connection ended"
    );
}

/// Serialize and send. Returns `false` once the socket is gone.
async fn send_message(ws_tx: &mut WsSink, msg: &GatewayMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize gateway message");
            return true;
        }
    };
    ws_tx.send(Message::Text(json.into())).await.is_ok()
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
