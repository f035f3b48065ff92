use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::membership::error::MembershipError;
use crate::store::StoreError;

/// Structured API error returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    /// Field errors for `VALIDATION_ERROR`, `{"auto_rejected": true}` for an
    /// approval that was rejected at commit time.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_ID", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn validation(details: Vec<FieldError>) -> Self {
        Self {
            details: serde_json::to_value(details).ok(),
            ..Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "Validation failed")
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<MembershipError> for ApiError {
    fn from(err: MembershipError) -> Self {
        let code = err.code();
        match err {
            MembershipError::Validation(fields) => Self::validation(fields),
            MembershipError::NotFound(reason) => {
                Self::new(StatusCode::NOT_FOUND, code, reason.message())
            }
            MembershipError::Forbidden(reason) => {
                Self::new(StatusCode::FORBIDDEN, code, reason.message())
            }
            MembershipError::InvalidState(reason) => {
                Self::new(StatusCode::BAD_REQUEST, code, reason.message())
            }
            MembershipError::Conflict {
                reason,
                auto_rejected,
            } => {
                if auto_rejected {
                    Self {
                        details: Some(serde_json::json!({ "auto_rejected": true })),
                        ..Self::new(
                            StatusCode::CONFLICT,
                            code,
                            format!("{}; the application was rejected", reason.message()),
                        )
                    }
                } else {
                    Self::new(StatusCode::CONFLICT, code, reason.message())
                }
            }
            MembershipError::ConcurrentModification => Self::new(
                StatusCode::CONFLICT,
                code,
                "The session changed while the request was in flight; retry",
            ),
            MembershipError::Store(err) => err.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!(?err, "store error");
        Self::internal("An internal error occurred")
    }
}
