use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-session async mutexes. Every membership mutation holds the lock for
/// its session for the whole operation.
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is not held across the await.
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on. Returns the number removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
