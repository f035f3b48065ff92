//! Persistence boundary for sessions, users and applications.
//!
//! The store offers per-document atomic operations only. Multi-document
//! consistency is the membership engine's job: it serializes work per session
//! and composes these primitives with compare-and-swap plus compensation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::application::{Application, ApplicationStatus};
use crate::models::session::{Session, SessionStatus};
use crate::models::user::{ActiveSession, User};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("duplicate {0}")]
    Duplicate(&'static str),

    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The backend failed (connection, query, pool).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Sort keys accepted by session listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSort {
    CreatedAt,
    ScheduledStartAt,
    Title,
    Price,
}

impl std::str::FromStr for SessionSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(Self::CreatedAt),
            "scheduled_start_at" => Ok(Self::ScheduledStartAt),
            "title" => Ok(Self::Title),
            "price" => Ok(Self::Price),
            other => Err(format!("unknown sort field `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown sort order `{other}`")),
        }
    }
}

/// Filter, sort and page parameters for [`SessionStore::list_sessions`].
#[derive(Debug, Clone)]
pub struct SessionQuery {
    pub status: Option<SessionStatus>,
    /// Case-insensitive substring matched against title and description.
    pub search: Option<String>,
    pub sort: SessionSort,
    pub order: SortOrder,
    pub offset: i64,
    pub limit: i64,
}

impl Default for SessionQuery {
    fn default() -> Self {
        Self {
            status: None,
            search: None,
            sort: SessionSort::CreatedAt,
            order: SortOrder::Desc,
            offset: 0,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionPage {
    pub items: Vec<Session>,
    pub total: i64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    // -- users --------------------------------------------------------------

    /// Create the user or refresh their profile fields. Never touches the
    /// active-session pointer.
    async fn upsert_user(
        &self,
        id: &str,
        username: &str,
        display_name: &str,
    ) -> Result<User, StoreError>;

    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError>;

    /// Replace the user's pointer with `next` only if it currently equals
    /// `expected`. Returns `false` when the comparison failed or the user
    /// does not exist.
    async fn swap_active_session(
        &self,
        user_id: &str,
        expected: Option<&ActiveSession>,
        next: Option<&ActiveSession>,
    ) -> Result<bool, StoreError>;

    /// Clear the user's pointer if it references `session_id`, whatever the
    /// role. Idempotent.
    async fn release_active_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<bool, StoreError>;

    // -- sessions -----------------------------------------------------------

    /// Insert a new session. Fails with [`StoreError::Duplicate`] when the
    /// id or join token is already taken.
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    async fn find_session_by_join_token(&self, token: &str)
        -> Result<Option<Session>, StoreError>;

    /// Overwrite the stored document if its version still equals
    /// `session.version`; the stored version becomes `session.version + 1`.
    /// Returns `false` on a version mismatch.
    async fn update_session(&self, session: &Session) -> Result<bool, StoreError>;

    async fn list_sessions(&self, query: &SessionQuery) -> Result<SessionPage, StoreError>;

    /// Sessions the user hosts or belongs to, newest first.
    async fn list_sessions_for_user(
        &self,
        user_id: &str,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, StoreError>;

    /// Scheduled sessions whose `scheduled_start_at` is at or before `now`.
    async fn list_due_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Session>, StoreError>;

    // -- applications -------------------------------------------------------

    /// Insert or overwrite the (session, user) application. An existing
    /// record keeps its id.
    async fn upsert_application(&self, application: &Application)
        -> Result<Application, StoreError>;

    async fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError>;

    async fn find_application(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<Application>, StoreError>;

    /// Move an application from `expected` to `next`, stamping
    /// `responded_at`. Returns `None` when the status no longer matched.
    async fn transition_application(
        &self,
        id: &str,
        expected: ApplicationStatus,
        next: ApplicationStatus,
        responded_at: DateTime<Utc>,
    ) -> Result<Option<Application>, StoreError>;

    /// Applications for a session ordered by `requested_at`, ties broken by
    /// insertion order.
    async fn list_applications(
        &self,
        session_id: &str,
        status: Option<ApplicationStatus>,
    ) -> Result<Vec<Application>, StoreError>;
}
