use chrono::{DateTime, Utc};
use diesel::prelude::*;
use jamroom_common::id::prefix;
use jamroom_common::PrefixedId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::schema::users;
use crate::models::session::SessionRole;

/// Which session a user currently occupies, and as what.
///
/// Stored as two nullable columns; held in memory as one value so a half-set
/// pointer cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ActiveSession {
    pub session_id: String,
    pub role: SessionRole,
}

/// A user known to this service, with the active-session pointer embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub active_session: Option<ActiveSession>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrefixedId for User {
    const PREFIX: &'static str = prefix::USER;
}

impl User {
    /// A fresh user with no active session.
    pub fn new(id: impl Into<String>, username: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            username: username.into(),
            display_name: display_name.into(),
            active_session: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The pointer, if it references `session_id`.
    pub fn active_in(&self, session_id: &str) -> Option<&ActiveSession> {
        self.active_session
            .as_ref()
            .filter(|a| a.session_id == session_id)
    }
}

/// Public user shape with the pointer flattened into its two wire fields.
#[derive(Debug, Serialize, ToSchema)]
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub active_session_id: Option<String>,
    pub active_session_role: Option<SessionRole>,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            active_session_id: user.active_session.as_ref().map(|a| a.session_id.clone()),
            active_session_role: user.active_session.as_ref().map(|a| a.role),
        }
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub active_session_id: Option<String>,
    pub active_session_role: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUserRow<'a> {
    pub id: &'a str,
    pub username: &'a str,
    pub display_name: &'a str,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = String;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let active_session = match (row.active_session_id, row.active_session_role) {
            (Some(session_id), Some(role)) => Some(ActiveSession {
                session_id,
                role: role.parse()?,
            }),
            (None, None) => None,
            _ => return Err(format!("user {} has a half-set active session", row.id)),
        };
        Ok(User {
            id: row.id,
            username: row.username,
            display_name: row.display_name,
            active_session,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
