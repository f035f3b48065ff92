//! Performer application endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody};
use crate::membership::ApplicationAction;
use crate::models::application::Application;
use crate::routes::{check_application_id, check_session_id, detached};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/sessions/{session_id}/applications",
            post(apply).get(list_applications),
        )
        .route("/sessions/{session_id}/applications/mine", delete(cancel))
        .route(
            "/sessions/{session_id}/applications/{application_id}",
            post(respond),
        )
}

// ---------------------------------------------------------------------------
// POST /api/v1/sessions/{session_id}/applications
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{session_id}/applications",
    tag = "Applications",
    security(("bearer" = [])),
    params(("session_id" = String, Path, description = "Session ID")),
    responses(
        (status = 201, description = "Application pending", body = Application),
        (status = 400, description = "Invalid id", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Session not found", body = ApiErrorBody),
        (status = 409, description = "Membership or capacity conflict", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "applications.apply", skip_all, fields(user_id = %user_id, session_id = %session_id))]
pub async fn apply(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<(StatusCode, Json<Application>), ApiError> {
    check_session_id(&session_id)?;

    let engine = state.engine.clone();
    let application =
        detached(async move { engine.apply_as_performer(&user_id, &session_id).await }).await?;

    Ok((StatusCode::CREATED, Json(application)))
}

// ---------------------------------------------------------------------------
// GET /api/v1/sessions/{session_id}/applications
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/sessions/{session_id}/applications",
    tag = "Applications",
    security(("bearer" = [])),
    params(("session_id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Pending applications, oldest first", body = Vec<Application>),
        (status = 403, description = "Not the host", body = ApiErrorBody),
        (status = 404, description = "Session not found", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "applications.list", skip_all, fields(user_id = %user_id, session_id = %session_id))]
pub async fn list_applications(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<Application>>, ApiError> {
    check_session_id(&session_id)?;

    let applications = state
        .engine
        .list_pending_applications(&user_id, &session_id)
        .await?;
    Ok(Json(applications))
}

// ---------------------------------------------------------------------------
// POST /api/v1/sessions/{session_id}/applications/{application_id}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct RespondRequest {
    pub action: ApplicationAction,
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{session_id}/applications/{application_id}",
    tag = "Applications",
    security(("bearer" = [])),
    params(
        ("session_id" = String, Path, description = "Session ID"),
        ("application_id" = String, Path, description = "Application ID"),
    ),
    request_body = RespondRequest,
    responses(
        (status = 200, description = "Application resolved", body = Application),
        (status = 400, description = "Already responded", body = ApiErrorBody),
        (status = 403, description = "Not the host", body = ApiErrorBody),
        (status = 404, description = "Session or application not found", body = ApiErrorBody),
        (status = 409, description = "Approval conflict; details report auto-rejection", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "applications.respond", skip_all, fields(user_id = %user_id, session_id = %session_id, application_id = %application_id))]
pub async fn respond(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path((session_id, application_id)): Path<(String, String)>,
    Json(body): Json<RespondRequest>,
) -> Result<Json<Application>, ApiError> {
    check_session_id(&session_id)?;
    check_application_id(&application_id)?;

    let engine = state.engine.clone();
    let application = detached(async move {
        engine
            .respond_to_application(&user_id, &session_id, &application_id, body.action)
            .await
    })
    .await?;

    Ok(Json(application))
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/sessions/{session_id}/applications/mine
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/api/v1/sessions/{session_id}/applications/mine",
    tag = "Applications",
    security(("bearer" = [])),
    params(("session_id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Application canceled", body = Application),
        (status = 400, description = "Application already resolved", body = ApiErrorBody),
        (status = 404, description = "No application", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "applications.cancel", skip_all, fields(user_id = %user_id, session_id = %session_id))]
pub async fn cancel(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Application>, ApiError> {
    check_session_id(&session_id)?;

    let engine = state.engine.clone();
    let application =
        detached(async move { engine.cancel_application(&user_id, &session_id).await }).await?;

    Ok(Json(application))
}
