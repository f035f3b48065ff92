pub mod applications;
pub mod auth;
pub mod health;
pub mod invites;
pub mod sessions;

use std::future::Future;

use axum::Router;
use jamroom_common::PrefixedId;
use tracing::Instrument;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::error::ApiError;
use crate::membership::MembershipError;
use crate::models::application::Application;
use crate::models::session::Session;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest(
            "/api/v1",
            auth::router()
                .merge(sessions::router())
                .merge(applications::router())
                .merge(invites::router()),
        )
}

/// Run a membership mutation on its own task. A client that disconnects
/// mid-request drops the handler future, not the mutation. The task runs in
/// the caller's span, so engine logs and error conversion keep the
/// operation, user and session fields.
pub(crate) async fn detached<T, F>(mutation: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, MembershipError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(mutation.in_current_span()).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            tracing::error!(error = %e, "membership task failed");
            Err(ApiError::internal("An internal error occurred"))
        }
    }
}

pub(crate) fn check_session_id(id: &str) -> Result<(), ApiError> {
    if Session::is_valid_id(id) {
        Ok(())
    } else {
        Err(ApiError::invalid_id("Invalid session id"))
    }
}

pub(crate) fn check_application_id(id: &str) -> Result<(), ApiError> {
    if Application::is_valid_id(id) {
        Ok(())
    } else {
        Err(ApiError::invalid_id("Invalid application id"))
    }
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Auth
        auth::ws_ticket,
        auth::dev_login,
        // Sessions
        sessions::create_session,
        sessions::list_sessions,
        sessions::list_my_sessions,
        sessions::get_session,
        sessions::update_session,
        sessions::join_session,
        sessions::leave_session,
        sessions::start_session,
        sessions::end_session,
        // Applications
        applications::apply,
        applications::list_applications,
        applications::respond,
        applications::cancel,
        // Invites
        invites::resolve_invite,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            // Models
            crate::models::session::SessionStatus,
            crate::models::session::SessionRole,
            crate::models::session::Member,
            crate::models::session::SessionResponse,
            crate::models::application::Application,
            crate::models::application::ApplicationStatus,
            crate::models::user::UserResponse,
            crate::models::user::ActiveSession,
            crate::membership::NewSession,
            crate::membership::SessionPatch,
            crate::membership::ApplicationAction,
            crate::membership::UserAccess,
            // Route request/response types
            health::HealthResponse,
            auth::WsTicketResponse,
            auth::DevLoginRequest,
            auth::DevLoginResponse,
            sessions::SessionListResponse,
            sessions::SessionDetailResponse,
            sessions::JoinRequest,
            sessions::JoinResponse,
            sessions::LeaveResponse,
            sessions::StartResponse,
            sessions::EndResponse,
            applications::RespondRequest,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Auth", description = "Gateway tickets and development login"),
        (name = "Sessions", description = "Session lifecycle and membership"),
        (name = "Applications", description = "Performer applications"),
        (name = "Invites", description = "Invite link resolution"),
    )
)]
pub struct ApiDoc;
