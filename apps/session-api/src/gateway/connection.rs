//! Per-connection gateway state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// State for a single WebSocket connection.
pub struct GatewayConnection {
    /// Connection identifier (`gw_` prefixed ULID), reported in READY.
    pub connection_id: String,
    pub user_id: String,
    /// Sessions whose broadcasts this connection receives.
    subscriptions: RwLock<HashSet<String>>,
    /// Monotonically increasing sequence number for dispatch events.
    seq: AtomicU64,
}

impl GatewayConnection {
    pub fn new(connection_id: String, user_id: String) -> Self {
        Self {
            connection_id,
            user_id,
            subscriptions: RwLock::new(HashSet::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Get the next sequence number for a dispatch event.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns `true` if the session was not already subscribed.
    pub fn subscribe(&self, session_id: &str) -> bool {
        self.subscriptions.write().insert(session_id.to_string())
    }

    pub fn unsubscribe(&self, session_id: &str) -> bool {
        self.subscriptions.write().remove(session_id)
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.subscriptions.read().contains(session_id)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut list: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        list.sort();
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_starts_at_one() {
        let conn = GatewayConnection::new("gw_1".to_string(), "usr_1".to_string());
        assert_eq!(conn.next_seq(), 1);
        assert_eq!(conn.next_seq(), 2);
    }

    #[test]
    fn subscriptions_toggle() {
        let conn = GatewayConnection::new("gw_1".to_string(), "usr_1".to_string());
        assert!(conn.subscribe("ses_1"));
        assert!(!conn.subscribe("ses_1"));
        assert!(conn.is_subscribed("ses_1"));
        assert!(conn.unsubscribe("ses_1"));
        assert!(!conn.is_subscribed("ses_1"));
        assert!(conn.subscriptions().is_empty());
    }
}
