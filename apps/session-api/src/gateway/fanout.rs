//! Broadcast hub for dispatching session events to connected clients.
//!
//! Uses a single `tokio::sync::broadcast` channel. Each connection
//! subscribes once and filters events locally by its subscribed sessions.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

/// A payload broadcast to all connected gateway connections.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    /// The session this event belongs to.
    pub session_id: String,
    pub event_name: String,
    pub data: Value,
}

/// The global broadcast hub. Cloneable; stored in AppState.
#[derive(Clone)]
pub struct GatewayBroadcast {
    sender: broadcast::Sender<Arc<BroadcastPayload>>,
}

impl Default for GatewayBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Each gateway connection calls this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.sender.subscribe()
    }

    /// Dispatch an event. Returns the number of receivers it reached.
    pub fn dispatch(&self, payload: BroadcastPayload) -> usize {
        // No receivers is not an error.
        self.sender.send(Arc::new(payload)).unwrap_or(0)
    }
}
