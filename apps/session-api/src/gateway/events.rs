//! Gateway opcodes, event types, and wire-format messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::application::ApplicationStatus;
use crate::models::session::{SessionRole, SessionStatus};

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_SUBSCRIBE: u8 = 4;
pub const OP_UNSUBSCRIBE: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub ticket: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

/// SUBSCRIBE / UNSUBSCRIBE payload.
#[derive(Debug, Deserialize)]
pub struct SubscriptionPayload {
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Dispatch event types
// ---------------------------------------------------------------------------

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "READY";
    pub const SUBSCRIBED: &'static str = "SUBSCRIBED";
    pub const USER_JOINED_SESSION: &'static str = "user_joined_session";
    pub const USER_LEFT_SESSION: &'static str = "user_left_session";
    pub const SESSION_STATUS_UPDATED: &'static str = "session_status_updated";
    pub const SESSION_UPDATED: &'static str = "session_updated";
    pub const PERFORMER_APPLICATION_RECEIVED: &'static str = "performer_application_received";
    pub const PERFORMER_APPLICATION_CANCELED: &'static str = "performer_application_canceled";
    pub const APPLICATION_RESPONDED: &'static str = "application_responded";
    pub const SESSION_PARTICIPANT_APPROVED: &'static str = "session_participant_approved";
}

// ---------------------------------------------------------------------------
// Dispatch payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct UserJoinedSession {
    pub session_id: String,
    pub user_id: String,
    pub role: SessionRole,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserLeftSession {
    pub session_id: String,
    pub user_id: String,
    pub role: SessionRole,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatusUpdated {
    pub session_id: String,
    pub status: SessionStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdated {
    pub session_id: String,
    pub title: String,
    pub description: Option<String>,
    pub is_paid: bool,
    pub price: i64,
    pub max_participants: i32,
    pub is_archive_enabled: bool,
    pub scheduled_start_at: Option<DateTime<Utc>>,
}

/// Sent to the host when someone applies or withdraws.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationEvent {
    pub session_id: String,
    pub application_id: String,
    pub user_id: String,
    pub requested_at: DateTime<Utc>,
}

/// Sent to the applicant when the host (or an approval re-check) resolves
/// their application.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationResponded {
    pub session_id: String,
    pub application_id: String,
    pub status: ApplicationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantApproved {
    pub session_id: String,
    pub user_id: String,
    pub role: SessionRole,
}
