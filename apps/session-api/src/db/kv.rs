use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::ApiError;

/// Abstraction over a key-value store used for access tokens and WS tickets.
///
/// Backed by Redis in production and an in-memory map in tests.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ApiError>;
    async fn get(&self, key: &str) -> Result<Option<String>, ApiError>;
    /// Read and delete in one step.
    async fn take(&self, key: &str) -> Result<Option<String>, ApiError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (local development / tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryKv {
    data: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ApiError> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.data
            .lock()
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        let mut data = self.data.lock();
        match data.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                data.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>, ApiError> {
        match self.data.lock().remove(key) {
            Some((value, expires_at)) if expires_at > Instant::now() => Ok(Some(value)),
            _ => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("redis connection established");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisKv {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(|e| {
                tracing::error!(?e, "redis set failed");
                ApiError::internal("Failed to store token")
            })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| {
            tracing::error!(?e, "redis get failed");
            ApiError::internal("Token lookup failed")
        })
    }

    async fn take(&self, key: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn.clone();
        conn.get_del(key).await.map_err(|e| {
            tracing::error!(?e, "redis getdel failed");
            ApiError::internal("Token lookup failed")
        })
    }
}
