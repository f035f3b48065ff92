//! Per-user directory of live gateway connections.
//!
//! Direct notifications (application events for a host or an applicant) are
//! routed by user id through this map instead of scanning every connection.
//! A user may hold several connections at once; each gets its own queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

/// Per-connection queue depth. A full queue drops the message.
pub const DIRECT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DirectMessage {
    pub event_name: String,
    pub data: Value,
}

pub type DirectSender = mpsc::Sender<Arc<DirectMessage>>;
pub type DirectReceiver = mpsc::Receiver<Arc<DirectMessage>>;

#[derive(Default)]
pub struct PresenceDirectory {
    connections: DashMap<String, HashMap<u64, DirectSender>>,
    next_id: AtomicU64,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id`. Returns the connection id and
    /// the receiving end of its queue.
    pub fn register(&self, user_id: &str) -> (u64, DirectReceiver) {
        let (tx, rx) = mpsc::channel(DIRECT_QUEUE_CAPACITY);
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id, tx);
        tracing::debug!(user_id, conn_id, "presence registered");
        (conn_id, rx)
    }

    pub fn unregister(&self, user_id: &str, conn_id: u64) {
        self.connections.remove_if_mut(user_id, |_, conns| {
            conns.remove(&conn_id);
            conns.is_empty()
        });
        tracing::debug!(user_id, conn_id, "presence unregistered");
    }

    /// Queue a message on every connection of `user_id`. Returns how many
    /// connections accepted it.
    pub fn send_to_user(&self, user_id: &str, message: DirectMessage) -> usize {
        let Some(conns) = self.connections.get(user_id) else {
            return 0;
        };
        let message = Arc::new(message);
        conns
            .iter()
            .filter(|(conn_id, tx)| match tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(user_id, conn_id = **conn_id, error = %e, "direct message dropped");
                    false
                }
            })
            .count()
    }
}
