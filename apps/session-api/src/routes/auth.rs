//! Auth routes: gateway tickets and the development login.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use jamroom_common::PrefixedId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::auth::tokens;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::models::user::{User, UserResponse};
use crate::AppState;

const USERNAME_MAX_CHARS: usize = 32;
const DISPLAY_NAME_MAX_CHARS: usize = 64;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/ws-ticket", post(ws_ticket))
        .route("/auth/dev-login", post(dev_login))
}

// ---------------------------------------------------------------------------
// POST /api/v1/auth/ws-ticket
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct WsTicketResponse {
    pub ws_ticket: String,
    pub ws_url: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/ws-ticket",
    tag = "Auth",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Ticket issued", body = WsTicketResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "auth.ws_ticket", skip_all, fields(user_id = %user_id))]
pub async fn ws_ticket(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<WsTicketResponse>, ApiError> {
    let ws_ticket = tokens::issue_ws_ticket(state.kv.as_ref(), &user_id).await?;
    Ok(Json(WsTicketResponse {
        ws_ticket,
        ws_url: state.config.public_ws_url.clone(),
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/auth/dev-login
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct DevLoginRequest {
    /// Log in as an existing user. A new user is created when absent.
    pub user_id: Option<String>,
    pub username: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DevLoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub ws_ticket: String,
    pub ws_url: String,
    pub user: UserResponse,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/dev-login",
    tag = "Auth",
    request_body = DevLoginRequest,
    responses(
        (status = 200, description = "Logged in", body = DevLoginResponse),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 404, description = "Development login disabled", body = ApiErrorBody),
    ),
)]
pub async fn dev_login(
    State(state): State<AppState>,
    Json(body): Json<DevLoginRequest>,
) -> Result<Json<DevLoginResponse>, ApiError> {
    if !state.config.dev_login_enabled {
        return Err(ApiError::not_found("Not found"));
    }

    let username = body.username.trim();
    let display_name = body
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(username);

    let mut errors = Vec::new();
    if username.is_empty() || username.chars().count() > USERNAME_MAX_CHARS {
        errors.push(FieldError {
            field: "username".to_string(),
            message: format!("must be 1-{USERNAME_MAX_CHARS} characters"),
        });
    }
    if display_name.chars().count() > DISPLAY_NAME_MAX_CHARS {
        errors.push(FieldError {
            field: "display_name".to_string(),
            message: format!("must be at most {DISPLAY_NAME_MAX_CHARS} characters"),
        });
    }
    if let Some(id) = &body.user_id {
        if !User::is_valid_id(id) {
            errors.push(FieldError {
                field: "user_id".to_string(),
                message: "must be a user id".to_string(),
            });
        }
    }
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    let user_id = body.user_id.clone().unwrap_or_else(User::generate);
    let user = state
        .store
        .upsert_user(&user_id, username, display_name)
        .await?;

    let access_token = tokens::generate_pat();
    tokens::store_pat(
        state.kv.as_ref(),
        &access_token,
        &tokens::TokenData {
            user_id: user.id.clone(),
        },
    )
    .await?;
    let ws_ticket = tokens::issue_ws_ticket(state.kv.as_ref(), &user.id).await?;

    tracing::info!(user_id = %user.id, "development login");

    Ok(Json(DevLoginResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: tokens::PAT_TTL_SECS,
        ws_ticket,
        ws_url: state.config.public_ws_url.clone(),
        user: UserResponse::from(&user),
    }))
}
