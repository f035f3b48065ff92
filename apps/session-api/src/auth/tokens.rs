//! Access token and WebSocket ticket management.
//!
//! Tokens are opaque random strings; the key-value store maps each one to
//! the user it was issued for.

use serde::{Deserialize, Serialize};

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;

// ---------------------------------------------------------------------------
// Opaque token generation
// ---------------------------------------------------------------------------

/// Generate an opaque random token with the given prefix.
pub fn generate_opaque_token(prefix: &str, bytes: usize) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(&mut buf[..]);
    format!("{}_{}", prefix, URL_SAFE_NO_PAD.encode(&buf))
}

/// Data stored alongside a token or ticket.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenData {
    pub user_id: String,
}

async fn store(
    kv: &dyn KeyValueStore,
    key: &str,
    data: &TokenData,
    ttl_secs: u64,
) -> Result<(), ApiError> {
    let value = serde_json::to_string(data).map_err(|_| ApiError::internal("serialization"))?;
    kv.set_ex(key, &value, ttl_secs).await
}

fn decode(value: Option<String>) -> Result<Option<TokenData>, ApiError> {
    value
        .map(|v| serde_json::from_str(&v).map_err(|_| ApiError::internal("corrupt token data")))
        .transpose()
}

// ---------------------------------------------------------------------------
// Access token (bearer), 1-hour TTL
// ---------------------------------------------------------------------------

/// Access token TTL in seconds (1 hour).
pub const PAT_TTL_SECS: u64 = 3600;

pub fn generate_pat() -> String {
    generate_opaque_token("pat", 32)
}

pub async fn store_pat(
    kv: &dyn KeyValueStore,
    token: &str,
    data: &TokenData,
) -> Result<(), ApiError> {
    store(kv, &format!("jam:pat:{token}"), data, PAT_TTL_SECS).await
}

pub async fn lookup_pat(kv: &dyn KeyValueStore, token: &str) -> Result<Option<TokenData>, ApiError> {
    decode(kv.get(&format!("jam:pat:{token}")).await?)
}

// ---------------------------------------------------------------------------
// WebSocket ticket, 30-second TTL, single-use
// ---------------------------------------------------------------------------

/// WS ticket TTL in seconds.
pub const WS_TICKET_TTL_SECS: u64 = 30;

pub fn generate_ws_ticket() -> String {
    generate_opaque_token("wst", 32)
}

pub async fn store_ws_ticket(
    kv: &dyn KeyValueStore,
    ticket: &str,
    data: &TokenData,
) -> Result<(), ApiError> {
    store(kv, &format!("jam:wst:{ticket}"), data, WS_TICKET_TTL_SECS).await
}

/// Look up and delete a WS ticket.
pub async fn consume_ws_ticket(
    kv: &dyn KeyValueStore,
    ticket: &str,
) -> Result<Option<TokenData>, ApiError> {
    decode(kv.take(&format!("jam:wst:{ticket}")).await?)
}

/// Issue a fresh ticket for `user_id`. Returns the ticket string.
pub async fn issue_ws_ticket(kv: &dyn KeyValueStore, user_id: &str) -> Result<String, ApiError> {
    let ticket = generate_ws_ticket();
    store_ws_ticket(
        kv,
        &ticket,
        &TokenData {
            user_id: user_id.to_string(),
        },
    )
    .await?;
    Ok(ticket)
}
