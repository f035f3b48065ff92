//! In-memory document store.
//!
//! Every operation runs under one `parking_lot::Mutex`, which gives each call
//! the same per-document atomicity a document database provides. Used by
//! default when no `DATABASE_URL` is configured, and by the test suite.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::models::application::{Application, ApplicationStatus};
use crate::models::session::{Session, SessionStatus};
use crate::models::user::{ActiveSession, User};

use super::{SessionPage, SessionQuery, SessionSort, SessionStore, SortOrder, StoreError};

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    sessions: HashMap<String, Session>,
    /// join_token → session id (unique index).
    join_tokens: HashMap<String, String>,
    /// application id → (record, insertion sequence).
    applications: HashMap<String, (Application, u64)>,
    /// (session id, user id) → application id (unique index).
    application_keys: HashMap<(String, String), String>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn compare_sessions(a: &Session, b: &Session, sort: SessionSort) -> Ordering {
    let primary = match sort {
        SessionSort::CreatedAt => a.created_at.cmp(&b.created_at),
        SessionSort::ScheduledStartAt => a.scheduled_start_at.cmp(&b.scheduled_start_at),
        SessionSort::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        SessionSort::Price => a.price.cmp(&b.price),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

fn matches_search(session: &Session, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    session.title.to_lowercase().contains(&needle)
        || session
            .description
            .as_deref()
            .is_some_and(|d| d.to_lowercase().contains(&needle))
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn upsert_user(
        &self,
        id: &str,
        username: &str,
        display_name: &str,
    ) -> Result<User, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .entry(id.to_string())
            .or_insert_with(|| User::new(id, username, display_name));
        user.username = username.to_string();
        user.display_name = display_name.to_string();
        user.updated_at = now;
        Ok(user.clone())
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().users.get(id).cloned())
    }

    async fn swap_active_session(
        &self,
        user_id: &str,
        expected: Option<&ActiveSession>,
        next: Option<&ActiveSession>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(user) = inner.users.get_mut(user_id) else {
            return Ok(false);
        };
        if user.active_session.as_ref() != expected {
            return Ok(false);
        }
        user.active_session = next.cloned();
        user.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_active_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(user) = inner.users.get_mut(user_id) else {
            return Ok(false);
        };
        if user.active_in(session_id).is_none() {
            return Ok(false);
        }
        user.active_session = None;
        user.updated_at = Utc::now();
        Ok(true)
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate("session id"));
        }
        if inner.join_tokens.contains_key(&session.join_token) {
            return Err(StoreError::Duplicate("join token"));
        }
        inner
            .join_tokens
            .insert(session.join_token.clone(), session.id.clone());
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.inner.lock().sessions.get(id).cloned())
    }

    async fn find_session_by_join_token(
        &self,
        token: &str,
    ) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .join_tokens
            .get(token)
            .and_then(|id| inner.sessions.get(id))
            .cloned())
    }

    async fn update_session(&self, session: &Session) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(stored) = inner.sessions.get_mut(&session.id) else {
            return Ok(false);
        };
        if stored.version != session.version {
            return Ok(false);
        }
        let join_token = stored.join_token.clone();
        *stored = session.clone();
        // The join token is immutable once issued.
        stored.join_token = join_token;
        stored.version = session.version + 1;
        Ok(true)
    }

    async fn list_sessions(&self, query: &SessionQuery) -> Result<SessionPage, StoreError> {
        let inner = self.inner.lock();
        let mut matched: Vec<&Session> = inner
            .sessions
            .values()
            .filter(|s| query.status.is_none_or(|status| s.status == status))
            .filter(|s| {
                query
                    .search
                    .as_deref()
                    .is_none_or(|needle| matches_search(s, needle))
            })
            .collect();

        matched.sort_by(|a, b| {
            let ord = compare_sessions(a, b, query.sort);
            match query.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let total = matched.len() as i64;
        let items = matched
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .cloned()
            .collect();

        Ok(SessionPage { items, total })
    }

    async fn list_sessions_for_user(
        &self,
        user_id: &str,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.lock();
        let mut list: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.is_host(user_id) || s.has_member(user_id))
            .filter(|s| status.is_none_or(|status| s.status == status))
            .cloned()
            .collect();
        list.sort_by(|a, b| compare_sessions(b, a, SessionSort::CreatedAt));
        Ok(list)
    }

    async fn list_due_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.lock();
        let mut due: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Scheduled)
            .filter(|s| s.scheduled_start_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by(|a, b| compare_sessions(a, b, SessionSort::ScheduledStartAt));
        Ok(due)
    }

    async fn upsert_application(
        &self,
        application: &Application,
    ) -> Result<Application, StoreError> {
        let mut inner = self.inner.lock();
        let key = (application.session_id.clone(), application.user_id.clone());
        let id = inner
            .application_keys
            .get(&key)
            .cloned()
            .unwrap_or_else(|| application.id.clone());

        inner.next_seq += 1;
        let seq = match inner.applications.get(&id) {
            Some((_, seq)) => *seq,
            None => inner.next_seq,
        };

        let mut stored = application.clone();
        stored.id = id.clone();
        inner.application_keys.insert(key, id.clone());
        inner.applications.insert(id, (stored.clone(), seq));
        Ok(stored)
    }

    async fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError> {
        Ok(self
            .inner
            .lock()
            .applications
            .get(id)
            .map(|(app, _)| app.clone()))
    }

    async fn find_application(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<Application>, StoreError> {
        let inner = self.inner.lock();
        let key = (session_id.to_string(), user_id.to_string());
        Ok(inner
            .application_keys
            .get(&key)
            .and_then(|id| inner.applications.get(id))
            .map(|(app, _)| app.clone()))
    }

    async fn transition_application(
        &self,
        id: &str,
        expected: ApplicationStatus,
        next: ApplicationStatus,
        responded_at: DateTime<Utc>,
    ) -> Result<Option<Application>, StoreError> {
        let mut inner = self.inner.lock();
        let Some((app, _)) = inner.applications.get_mut(id) else {
            return Ok(None);
        };
        if app.status != expected {
            return Ok(None);
        }
        app.status = next;
        app.responded_at = Some(responded_at);
        Ok(Some(app.clone()))
    }

    async fn list_applications(
        &self,
        session_id: &str,
        status: Option<ApplicationStatus>,
    ) -> Result<Vec<Application>, StoreError> {
        let inner = self.inner.lock();
        let mut list: Vec<(&Application, u64)> = inner
            .applications
            .values()
            .filter(|(app, _)| app.session_id == session_id)
            .filter(|(app, _)| status.is_none_or(|s| app.status == s))
            .map(|(app, seq)| (app, *seq))
            .collect();
        list.sort_by(|(a, sa), (b, sb)| a.requested_at.cmp(&b.requested_at).then(sa.cmp(sb)));
        Ok(list.into_iter().map(|(app, _)| app.clone()).collect())
    }
}
