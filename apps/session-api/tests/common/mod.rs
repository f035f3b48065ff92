#![allow(dead_code)]

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderValue, StatusCode};
use axum::Router;
use axum_test::TestServer;
use jamroom_common::PrefixedId;
use parking_lot::Mutex;

use session_api::auth::tokens;
use session_api::config::Config;
use session_api::db::kv::{KeyValueStore, MemoryKv};
use session_api::gateway::notifier::{Audience, Notification, Notifier};
use session_api::membership::{MembershipEngine, MembershipPolicy, NewSession};
use session_api::models::user::User;
use session_api::store::{MemoryStore, SessionStore};
use session_api::AppState;

// ---------------------------------------------------------------------------
// HTTP harness
// ---------------------------------------------------------------------------

/// Build a test AppState on the in-memory store and token store.
pub fn test_state_with(config: Config) -> AppState {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    AppState::new(config, store, kv)
}

pub fn test_state() -> AppState {
    test_state_with(Config {
        dev_login_enabled: true,
        ..Config::default()
    })
}

pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    let app = session_api::routes::router().with_state(state.clone());
    (app, state)
}

pub fn test_server() -> (TestServer, AppState) {
    let (app, state) = test_app();
    (TestServer::new(app).unwrap(), state)
}

/// Create a user and an access token for them. Returns `(user_id, token)`.
pub async fn login_test_user(state: &AppState, username: &str) -> (String, String) {
    let user_id = User::generate();
    state
        .store
        .upsert_user(&user_id, username, username)
        .await
        .unwrap();

    let token = tokens::generate_pat();
    tokens::store_pat(
        state.kv.as_ref(),
        &token,
        &tokens::TokenData {
            user_id: user_id.clone(),
        },
    )
    .await
    .unwrap();
    (user_id, token)
}

pub fn bearer(token: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("Bearer {token}")).unwrap()
}

/// `POST /api/v1/sessions` as `token`; returns the new session id.
pub async fn create_session(server: &TestServer, token: &str, max_participants: i32) -> String {
    let resp = server
        .post("/api/v1/sessions")
        .add_header(AUTHORIZATION, bearer(token))
        .json(&serde_json::json!({
            "title": "Friday jam",
            "max_participants": max_participants,
        }))
        .await;
    resp.assert_status(StatusCode::CREATED);
    let body: serde_json::Value = resp.json();
    body["id"].as_str().unwrap().to_string()
}

/// Apply as `applicant` and approve as `host`; the applicant ends up a
/// performer. Returns the application id.
pub async fn apply_and_approve(
    server: &TestServer,
    session_id: &str,
    host_token: &str,
    applicant_token: &str,
) -> String {
    let resp = server
        .post(&format!("/api/v1/sessions/{session_id}/applications"))
        .add_header(AUTHORIZATION, bearer(applicant_token))
        .await;
    resp.assert_status(StatusCode::CREATED);
    let application_id = resp.json::<serde_json::Value>()["id"]
        .as_str()
        .unwrap()
        .to_string();

    server
        .post(&format!(
            "/api/v1/sessions/{session_id}/applications/{application_id}"
        ))
        .add_header(AUTHORIZATION, bearer(host_token))
        .json(&serde_json::json!({ "action": "approve" }))
        .await
        .assert_status_ok();
    application_id
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

/// Notifier that records everything it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Drain recorded notifications.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Drain and summarise as `(audience, event_name)` pairs.
    pub fn take_names(&self) -> Vec<(Audience, &'static str)> {
        self.take()
            .into_iter()
            .map(|n| (n.audience, n.event_name))
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.events.lock().push(notification);
    }
}

pub struct EngineHarness {
    pub engine: Arc<MembershipEngine>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
}

impl EngineHarness {
    pub fn new(policy: MembershipPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Arc::new(MembershipEngine::new(
            store.clone(),
            notifier.clone(),
            policy,
        ));
        Self {
            engine,
            store,
            notifier,
        }
    }

    pub async fn user(&self, name: &str) -> String {
        let id = User::generate();
        self.store.upsert_user(&id, name, name).await.unwrap();
        id
    }

    pub async fn pointer(&self, user_id: &str) -> Option<(String, String)> {
        self.store
            .get_user(user_id)
            .await
            .unwrap()
            .unwrap()
            .active_session
            .map(|a| (a.session_id, a.role.to_string()))
    }

    /// Create a session hosted by a fresh user. Returns `(host_id, session_id)`.
    pub async fn hosted_session(&self, max_participants: i32) -> (String, String) {
        let host = self.user("host").await;
        let session = self
            .engine
            .create_session(&host, new_session(max_participants))
            .await
            .unwrap();
        (host, session.id)
    }

    /// Apply and approve `user` as a performer.
    pub async fn approve(&self, host: &str, session_id: &str, user: &str) {
        let application = self
            .engine
            .apply_as_performer(user, session_id)
            .await
            .unwrap();
        self.engine
            .respond_to_application(
                host,
                session_id,
                &application.id,
                session_api::membership::ApplicationAction::Approve,
            )
            .await
            .unwrap();
    }
}

pub fn new_session(max_participants: i32) -> NewSession {
    NewSession {
        title: "Friday jam".to_string(),
        description: None,
        is_paid: false,
        price: None,
        max_participants,
        is_archive_enabled: false,
        scheduled_start_at: None,
    }
}
