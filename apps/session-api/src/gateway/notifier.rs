//! The engine-facing side of the gateway.
//!
//! The membership engine only ever sees [`Notifier`]; the gateway decides
//! how a [`Notification`] reaches sockets. Delivery is best effort.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::fanout::{BroadcastPayload, GatewayBroadcast};
use super::presence::{DirectMessage, PresenceDirectory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every connection subscribed to the session.
    Session(String),
    /// Every connection of one user.
    User(String),
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub audience: Audience,
    pub event_name: &'static str,
    pub data: Value,
}

impl Notification {
    pub fn to_session(session_id: &str, event_name: &'static str, data: impl Serialize) -> Self {
        Self::new(Audience::Session(session_id.to_string()), event_name, data)
    }

    pub fn to_user(user_id: &str, event_name: &'static str, data: impl Serialize) -> Self {
        Self::new(Audience::User(user_id.to_string()), event_name, data)
    }

    fn new(audience: Audience, event_name: &'static str, data: impl Serialize) -> Self {
        let data = serde_json::to_value(data).unwrap_or_else(|e| {
            tracing::error!(event_name, error = %e, "failed to serialize notification");
            Value::Null
        });
        Self {
            audience,
            event_name,
            data,
        }
    }
}

pub trait Notifier: Send + Sync {
    /// Hand a notification to the transport. Must not block and must not
    /// fail the caller.
    fn notify(&self, notification: Notification);
}

/// Routes session-wide events through the broadcast hub and user-targeted
/// events through the presence directory.
pub struct GatewayNotifier {
    broadcast: GatewayBroadcast,
    presence: Arc<PresenceDirectory>,
}

impl GatewayNotifier {
    pub fn new(broadcast: GatewayBroadcast, presence: Arc<PresenceDirectory>) -> Self {
        Self {
            broadcast,
            presence,
        }
    }
}

impl Notifier for GatewayNotifier {
    fn notify(&self, notification: Notification) {
        let Notification {
            audience,
            event_name,
            data,
        } = notification;

        match audience {
            Audience::Session(session_id) => {
                let reached = self.broadcast.dispatch(BroadcastPayload {
                    session_id: session_id.clone(),
                    event_name: event_name.to_string(),
                    data,
                });
                tracing::debug!(%session_id, event_name, reached, "session event dispatched");
            }
            Audience::User(user_id) => {
                let delivered = self.presence.send_to_user(
                    &user_id,
                    DirectMessage {
                        event_name: event_name.to_string(),
                        data,
                    },
                );
                tracing::debug!(%user_id, event_name, delivered, "direct event dispatched");
            }
        }
    }
}
