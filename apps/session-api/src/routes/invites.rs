//! Invite link resolution.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::error::{ApiError, ApiErrorBody};
use crate::models::session::SessionResponse;
use crate::AppState;

/// Join tokens are generated as `jt_` plus 22 URL-safe characters; anything
/// far outside that shape is not worth a lookup.
const JOIN_TOKEN_MAX_LEN: usize = 64;

pub fn router() -> Router<AppState> {
    Router::new().route("/invite/{join_token}", get(resolve_invite))
}

// ---------------------------------------------------------------------------
// GET /api/v1/invite/{join_token}
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/invite/{join_token}",
    tag = "Invites",
    params(("join_token" = String, Path, description = "Invite token")),
    responses(
        (status = 200, description = "Session the invite points at", body = SessionResponse),
        (status = 404, description = "Unknown invite", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "invites.resolve", skip_all)]
pub async fn resolve_invite(
    State(state): State<AppState>,
    Path(join_token): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let not_found = || ApiError::new(StatusCode::NOT_FOUND, "INVITE_NOT_FOUND", "Invite not found");
    if join_token.is_empty() || join_token.len() > JOIN_TOKEN_MAX_LEN {
        return Err(not_found());
    }

    let session = state
        .store
        .find_session_by_join_token(&join_token)
        .await?
        .ok_or_else(not_found)?;

    Ok(Json(SessionResponse::new(&session, None)))
}
