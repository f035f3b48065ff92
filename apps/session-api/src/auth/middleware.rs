//! Bearer token extraction.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::tokens;
use crate::AppState;

/// Authenticated user extracted from the `Authorization: Bearer <pat>` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

/// Like [`AuthUser`] but for endpoints where auth is optional. A missing
/// header yields `None`; a present but invalid token is still rejected.
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<String>);

/// Rejection returned when the bearer token is missing or invalid.
pub struct AuthError {
    message: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": self.message
            }
        });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

async fn resolve(header: &str, state: &AppState) -> Result<AuthUser, AuthError> {
    let token = header.strip_prefix("Bearer ").ok_or(AuthError {
        message: "Invalid Authorization header format",
    })?;

    let data = tokens::lookup_pat(state.kv.as_ref(), token)
        .await
        .map_err(|_| AuthError {
            message: "Token lookup failed",
        })?
        .ok_or(AuthError {
            message: "Invalid or expired token",
        })?;

    Ok(AuthUser {
        user_id: data.user_id,
    })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError {
                message: "Missing Authorization header",
            })?;

        resolve(header, state).await
    }
}

impl FromRequestParts<AppState> for MaybeAuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(header) = parts.headers.get(AUTHORIZATION) else {
            return Ok(MaybeAuthUser(None));
        };
        let header = header.to_str().map_err(|_| AuthError {
            message: "Invalid Authorization header format",
        })?;

        let user = resolve(header, state).await?;
        Ok(MaybeAuthUser(Some(user.user_id)))
    }
}
