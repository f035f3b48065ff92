//! Session endpoints: CRUD, listing and the membership lifecycle.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::middleware::{AuthUser, MaybeAuthUser};
use crate::error::{ApiError, ApiErrorBody};
use crate::membership::{NewSession, SessionPatch, UserAccess};
use crate::models::session::{SessionResponse, SessionRole, SessionStatus};
use crate::routes::{check_session_id, detached};
use crate::store::{SessionQuery, SessionSort, SortOrder};
use crate::AppState;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/mine", get(list_my_sessions))
        .route("/sessions/{session_id}", get(get_session).patch(update_session))
        .route("/sessions/{session_id}/join", post(join_session))
        .route("/sessions/{session_id}/leave", post(leave_session))
        .route("/sessions/{session_id}/start", post(start_session))
        .route("/sessions/{session_id}/end", post(end_session))
}

// ---------------------------------------------------------------------------
// POST /api/v1/sessions
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/sessions",
    tag = "Sessions",
    security(("bearer" = [])),
    request_body = NewSession,
    responses(
        (status = 201, description = "Session created", body = SessionResponse),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "User not found", body = ApiErrorBody),
        (status = 409, description = "Already in a session", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "sessions.create", skip_all, fields(user_id = %user_id))]
pub async fn create_session(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<NewSession>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let engine = state.engine.clone();
    let host_id = user_id.clone();
    let session = detached(async move { engine.create_session(&host_id, body).await }).await?;

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse::new(&session, Some(&user_id))),
    ))
}

// ---------------------------------------------------------------------------
// GET /api/v1/sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListSessionsParams {
    /// `scheduled`, `ready`, `live` or `ended`.
    pub status: Option<String>,
    /// Case-insensitive match on title and description.
    pub search: Option<String>,
    /// `created_at` (default), `scheduled_start_at`, `title` or `price`.
    pub sort: Option<String>,
    /// `asc` or `desc` (default).
    pub order: Option<String>,
    /// 1-based page number.
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionListResponse {
    pub data: Vec<SessionResponse>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
}

fn parse_status(status: Option<&str>) -> Result<Option<SessionStatus>, ApiError> {
    status
        .map(|s| s.parse::<SessionStatus>().map_err(ApiError::bad_request))
        .transpose()
}

impl ListSessionsParams {
    fn into_query(self) -> Result<(SessionQuery, i64), ApiError> {
        let page = self.page.unwrap_or(1);
        if page < 1 {
            return Err(ApiError::bad_request("page must be at least 1"));
        }
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ApiError::bad_request(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let offset = (page - 1)
            .checked_mul(limit)
            .ok_or_else(|| ApiError::bad_request("page is out of range"))?;

        let defaults = SessionQuery::default();
        let query = SessionQuery {
            status: parse_status(self.status.as_deref())?,
            search: self
                .search
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            sort: match self.sort.as_deref() {
                Some(s) => s.parse::<SessionSort>().map_err(ApiError::bad_request)?,
                None => defaults.sort,
            },
            order: match self.order.as_deref() {
                Some(s) => s.parse::<SortOrder>().map_err(ApiError::bad_request)?,
                None => defaults.order,
            },
            offset,
            limit,
        };
        Ok((query, page))
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/sessions",
    tag = "Sessions",
    params(ListSessionsParams),
    responses(
        (status = 200, description = "Page of sessions", body = SessionListResponse),
        (status = 400, description = "Bad filter or sort", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "sessions.list", skip_all, fields(user_id = ?caller))]
pub async fn list_sessions(
    MaybeAuthUser(caller): MaybeAuthUser,
    State(state): State<AppState>,
    Query(params): Query<ListSessionsParams>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let (query, page) = params.into_query()?;
    let result = state.store.list_sessions(&query).await?;

    Ok(Json(SessionListResponse {
        data: result
            .items
            .iter()
            .map(|s| SessionResponse::new(s, caller.as_deref()))
            .collect(),
        page,
        limit: query.limit,
        total: result.total,
    }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/sessions/mine
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct MySessionsParams {
    pub status: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/sessions/mine",
    tag = "Sessions",
    security(("bearer" = [])),
    params(MySessionsParams),
    responses(
        (status = 200, description = "Sessions the caller hosts or belongs to", body = Vec<SessionResponse>),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "sessions.mine", skip_all, fields(user_id = %user_id))]
pub async fn list_my_sessions(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Query(params): Query<MySessionsParams>,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    let status = parse_status(params.status.as_deref())?;
    let sessions = state.store.list_sessions_for_user(&user_id, status).await?;

    Ok(Json(
        sessions
            .iter()
            .map(|s| SessionResponse::new(s, Some(&user_id)))
            .collect(),
    ))
}

// ---------------------------------------------------------------------------
// GET /api/v1/sessions/{session_id}
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionDetailResponse {
    #[serde(flatten)]
    pub session: SessionResponse,
    pub user_access: UserAccess,
}

#[utoipa::path(
    get,
    path = "/api/v1/sessions/{session_id}",
    tag = "Sessions",
    params(("session_id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session detail", body = SessionDetailResponse),
        (status = 400, description = "Invalid id", body = ApiErrorBody),
        (status = 404, description = "Session not found", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "sessions.get", skip_all, fields(user_id = ?caller, session_id = %session_id))]
pub async fn get_session(
    MaybeAuthUser(caller): MaybeAuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    check_session_id(&session_id)?;

    let session = state
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", "Session not found"))?;
    let user_access = state.engine.user_access(&session, caller.as_deref()).await?;

    Ok(Json(SessionDetailResponse {
        session: SessionResponse::new(&session, caller.as_deref()),
        user_access,
    }))
}

// ---------------------------------------------------------------------------
// PATCH /api/v1/sessions/{session_id}
// ---------------------------------------------------------------------------

#[utoipa::path(
    patch,
    path = "/api/v1/sessions/{session_id}",
    tag = "Sessions",
    security(("bearer" = [])),
    params(("session_id" = String, Path, description = "Session ID")),
    request_body = SessionPatch,
    responses(
        (status = 200, description = "Session updated", body = SessionResponse),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 403, description = "Not the host", body = ApiErrorBody),
        (status = 404, description = "Session not found", body = ApiErrorBody),
        (status = 409, description = "Session ended or capacity conflict", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "sessions.update", skip_all, fields(user_id = %user_id, session_id = %session_id))]
pub async fn update_session(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<SessionPatch>,
) -> Result<Json<SessionResponse>, ApiError> {
    check_session_id(&session_id)?;

    let engine = state.engine.clone();
    let host_id = user_id.clone();
    let session =
        detached(async move { engine.update_session(&host_id, &session_id, body).await }).await?;

    Ok(Json(SessionResponse::new(&session, Some(&user_id))))
}

// ---------------------------------------------------------------------------
// POST /api/v1/sessions/{session_id}/join
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct JoinRequest {
    /// `viewer` (default) or `performer`.
    pub role: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JoinResponse {
    pub session_id: String,
    pub role: SessionRole,
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{session_id}/join",
    tag = "Sessions",
    security(("bearer" = [])),
    params(("session_id" = String, Path, description = "Session ID")),
    request_body = JoinRequest,
    responses(
        (status = 200, description = "Joined; `role` is the resolved role", body = JoinResponse),
        (status = 400, description = "Invalid id or role", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Session not found", body = ApiErrorBody),
        (status = 409, description = "Membership conflict", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "sessions.join", skip_all, fields(user_id = %user_id, session_id = %session_id))]
pub async fn join_session(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Option<Json<JoinRequest>>,
) -> Result<Json<JoinResponse>, ApiError> {
    check_session_id(&session_id)?;
    let role = body.and_then(|Json(body)| body.role);
    let requested = match role.as_deref() {
        None | Some("viewer") => SessionRole::Viewer,
        Some("performer") => SessionRole::Performer,
        Some(_) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_ROLE",
                "role must be `viewer` or `performer`",
            ))
        }
    };

    let engine = state.engine.clone();
    let outcome =
        detached(async move { engine.join_session(&user_id, &session_id, requested).await })
            .await?;

    Ok(Json(JoinResponse {
        session_id: outcome.session_id,
        role: outcome.role,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/sessions/{session_id}/leave
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct LeaveResponse {
    pub session_id: String,
    pub left: bool,
    /// Set when leaving ended the session.
    pub session_ended: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{session_id}/leave",
    tag = "Sessions",
    security(("bearer" = [])),
    params(("session_id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Left the session", body = LeaveResponse),
        (status = 400, description = "Not a participant, or the host may not leave", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Session not found", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "sessions.leave", skip_all, fields(user_id = %user_id, session_id = %session_id))]
pub async fn leave_session(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<LeaveResponse>, ApiError> {
    check_session_id(&session_id)?;

    let engine = state.engine.clone();
    let outcome =
        detached(async move { engine.leave_session(&user_id, &session_id).await }).await?;

    Ok(Json(LeaveResponse {
        session_id: outcome.session_id,
        left: true,
        session_ended: outcome.session_ended,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/sessions/{session_id}/start
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct StartResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{session_id}/start",
    tag = "Sessions",
    security(("bearer" = [])),
    params(("session_id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session is live", body = StartResponse),
        (status = 400, description = "Session has ended", body = ApiErrorBody),
        (status = 403, description = "Not the host", body = ApiErrorBody),
        (status = 404, description = "Session not found", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "sessions.start", skip_all, fields(user_id = %user_id, session_id = %session_id))]
pub async fn start_session(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<StartResponse>, ApiError> {
    check_session_id(&session_id)?;

    let engine = state.engine.clone();
    let session =
        detached(async move { engine.start_session(&user_id, &session_id).await }).await?;

    Ok(Json(StartResponse {
        session_id: session.id,
        status: session.status,
        started_at: session.started_at,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/sessions/{session_id}/end
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct EndResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub ended_at: Option<DateTime<Utc>>,
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{session_id}/end",
    tag = "Sessions",
    security(("bearer" = [])),
    params(("session_id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session ended", body = EndResponse),
        (status = 400, description = "Session already ended", body = ApiErrorBody),
        (status = 403, description = "Not the host", body = ApiErrorBody),
        (status = 404, description = "Session not found", body = ApiErrorBody),
    ),
)]
#[tracing::instrument(name = "sessions.end", skip_all, fields(user_id = %user_id, session_id = %session_id))]
pub async fn end_session(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<EndResponse>, ApiError> {
    check_session_id(&session_id)?;

    let engine = state.engine.clone();
    let session = detached(async move { engine.end_session(&user_id, &session_id).await }).await?;

    Ok(Json(EndResponse {
        session_id: session.id,
        status: session.status,
        ended_at: session.ended_at,
    }))
}
