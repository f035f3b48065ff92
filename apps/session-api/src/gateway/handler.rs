//! Incoming opcode handling: IDENTIFY and SUBSCRIBE / UNSUBSCRIBE.

use jamroom_common::id::{prefix, prefixed_ulid};
use jamroom_common::PrefixedId;

use crate::auth::tokens;
use crate::models::session::Session;
use crate::models::user::UserResponse;
use crate::AppState;

use super::connection::GatewayConnection;
use super::events::{EventName, GatewayMessage, IdentifyPayload, SubscriptionPayload};

/// Heartbeat interval sent to clients in the READY payload (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 41250;

/// Process an IDENTIFY opcode. Returns the connection and its READY message.
///
/// A user inside a session is subscribed to it straight away.
pub async fn handle_identify(
    state: &AppState,
    payload: IdentifyPayload,
) -> Result<(GatewayConnection, GatewayMessage), &'static str> {
    // Consume the WS ticket (single-use).
    let ticket_data = tokens::consume_ws_ticket(state.kv.as_ref(), &payload.ticket)
        .await
        .map_err(|_| "Ticket lookup failed")?
        .ok_or("Invalid or expired ticket")?;

    let user = state
        .store
        .get_user(&ticket_data.user_id)
        .await
        .map_err(|_| "User lookup failed")?
        .ok_or("User not found")?;

    let connection = GatewayConnection::new(prefixed_ulid(prefix::GATEWAY), user.id.clone());
    if let Some(active) = &user.active_session {
        connection.subscribe(&active.session_id);
    }

    let ready_data = serde_json::json!({
        "connection_id": connection.connection_id,
        "user": UserResponse::from(&user),
        "active_session": user.active_session,
        "subscriptions": connection.subscriptions(),
        "heartbeat_interval": HEARTBEAT_INTERVAL_MS,
    });

    let seq = connection.next_seq();
    let ready_msg = GatewayMessage::dispatch(EventName::READY, seq, ready_data);

    Ok((connection, ready_msg))
}

/// Process a SUBSCRIBE opcode. Any existing session may be watched.
pub async fn handle_subscribe(
    state: &AppState,
    connection: &GatewayConnection,
    payload: SubscriptionPayload,
) -> Result<GatewayMessage, &'static str> {
    if !Session::is_valid_id(&payload.session_id) {
        return Err("Invalid session id");
    }
    state
        .store
        .get_session(&payload.session_id)
        .await
        .map_err(|_| "Session lookup failed")?
        .ok_or("Session not found")?;

    connection.subscribe(&payload.session_id);
    tracing::debug!(
        connection_id = %connection.connection_id,
        session_id = %payload.session_id,
        "gateway subscribed"
    );

    let seq = connection.next_seq();
    Ok(GatewayMessage::dispatch(
        EventName::SUBSCRIBED,
        seq,
        serde_json::json!({ "session_id": payload.session_id }),
    ))
}

pub fn handle_unsubscribe(connection: &GatewayConnection, payload: SubscriptionPayload) {
    connection.unsubscribe(&payload.session_id);
}
