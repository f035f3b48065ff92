use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use jamroom_common::id::prefix;
use jamroom_common::PrefixedId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::schema::sessions;

/// Lifecycle status of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Ready,
    Live,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Ready => "ready",
            Self::Live => "live",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "ready" => Ok(Self::Ready),
            "live" => Ok(Self::Live),
            "ended" => Ok(Self::Ended),
            other => Err(format!("unknown session status `{other}`")),
        }
    }
}

/// The role a user occupies inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Host,
    Performer,
    Viewer,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Performer => "performer",
            Self::Viewer => "viewer",
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "performer" => Ok(Self::Performer),
            "viewer" => Ok(Self::Viewer),
            other => Err(format!("unknown session role `{other}`")),
        }
    }
}

/// One entry in a session's `participants` or `viewers` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Member {
    pub user_id: String,
    pub role: SessionRole,
    pub joined_at: DateTime<Utc>,
}

/// The session document.
///
/// `participants` holds the host and approved performers and is bounded by
/// `max_participants`. `viewers` is the uncapped audience. `version` is bumped
/// by the store on every committed write and guards optimistic updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub host_id: String,
    pub participants: Vec<Member>,
    pub viewers: Vec<Member>,
    pub is_paid: bool,
    /// Ticket price in minor currency units. Always 0 for free sessions.
    pub price: i64,
    pub max_participants: i32,
    pub is_archive_enabled: bool,
    pub status: SessionStatus,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub join_token: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrefixedId for Session {
    const PREFIX: &'static str = prefix::SESSION;
}

impl Session {
    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_id == user_id
    }

    /// Look up a host/performer entry.
    pub fn participant(&self, user_id: &str) -> Option<&Member> {
        self.participants.iter().find(|m| m.user_id == user_id)
    }

    pub fn viewer(&self, user_id: &str) -> Option<&Member> {
        self.viewers.iter().find(|m| m.user_id == user_id)
    }

    /// Whether the user appears in either membership list.
    pub fn has_member(&self, user_id: &str) -> bool {
        self.participant(user_id).is_some() || self.viewer(user_id).is_some()
    }

    pub fn performer_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|m| m.role == SessionRole::Performer)
            .count()
    }

    /// Insert a membership entry into the list matching `role`. Returns
    /// `false` when the user was already present in that list.
    pub fn add_member(&mut self, user_id: &str, role: SessionRole, at: DateTime<Utc>) -> bool {
        let list = match role {
            SessionRole::Viewer => &mut self.viewers,
            SessionRole::Host | SessionRole::Performer => &mut self.participants,
        };
        if list.iter().any(|m| m.user_id == user_id) {
            return false;
        }
        list.push(Member {
            user_id: user_id.to_string(),
            role,
            joined_at: at,
        });
        true
    }

    /// Remove the user from both membership lists. The host entry is never
    /// removed. Returns `true` when something was removed.
    pub fn remove_member(&mut self, user_id: &str) -> bool {
        if self.is_host(user_id) {
            return false;
        }
        let before = self.participants.len() + self.viewers.len();
        self.participants.retain(|m| m.user_id != user_id);
        self.viewers.retain(|m| m.user_id != user_id);
        before != self.participants.len() + self.viewers.len()
    }

    /// Every user id in `participants` followed by `viewers`.
    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.participants
            .iter()
            .chain(self.viewers.iter())
            .map(|m| m.user_id.as_str())
    }
}

/// Public session shape. `join_token` is only revealed to the host.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub host_id: String,
    pub participants: Vec<Member>,
    pub viewers: Vec<Member>,
    pub participant_count: usize,
    pub viewer_count: usize,
    pub is_paid: bool,
    pub price: i64,
    pub max_participants: i32,
    pub is_archive_enabled: bool,
    pub status: SessionStatus,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionResponse {
    pub fn new(session: &Session, caller: Option<&str>) -> Self {
        let is_host = caller.is_some_and(|id| session.is_host(id));
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            description: session.description.clone(),
            host_id: session.host_id.clone(),
            participants: session.participants.clone(),
            viewers: session.viewers.clone(),
            participant_count: session.participants.len(),
            viewer_count: session.viewers.len(),
            is_paid: session.is_paid,
            price: session.price,
            max_participants: session.max_participants,
            is_archive_enabled: session.is_archive_enabled,
            status: session.status,
            scheduled_start_at: session.scheduled_start_at,
            started_at: session.started_at,
            ended_at: session.ended_at,
            join_token: is_host.then(|| session.join_token.clone()),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Diesel rows
// ---------------------------------------------------------------------------

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = sessions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SessionRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub host_id: String,
    pub participants: serde_json::Value,
    pub viewers: serde_json::Value,
    pub is_paid: bool,
    pub price: i64,
    pub max_participants: i32,
    pub is_archive_enabled: bool,
    pub status: String,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub join_token: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sessions)]
pub struct NewSessionRow<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub host_id: &'a str,
    pub participants: serde_json::Value,
    pub viewers: serde_json::Value,
    pub is_paid: bool,
    pub price: i64,
    pub max_participants: i32,
    pub is_archive_enabled: bool,
    pub status: &'a str,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub join_token: &'a str,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full-document overwrite used by the optimistic update.
#[derive(Debug, AsChangeset)]
#[diesel(table_name = sessions)]
#[diesel(treat_none_as_null = true)]
pub struct SessionChanges<'a> {
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub participants: serde_json::Value,
    pub viewers: serde_json::Value,
    pub is_paid: bool,
    pub price: i64,
    pub max_participants: i32,
    pub is_archive_enabled: bool,
    pub status: &'a str,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = String;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let participants: Vec<Member> = serde_json::from_value(row.participants)
            .map_err(|e| format!("session {} participants: {e}", row.id))?;
        let viewers: Vec<Member> = serde_json::from_value(row.viewers)
            .map_err(|e| format!("session {} viewers: {e}", row.id))?;
        Ok(Session {
            status: row.status.parse()?,
            id: row.id,
            title: row.title,
            description: row.description,
            host_id: row.host_id,
            participants,
            viewers,
            is_paid: row.is_paid,
            price: row.price,
            max_participants: row.max_participants,
            is_archive_enabled: row.is_archive_enabled,
            scheduled_start_at: row.scheduled_start_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            join_token: row.join_token,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Serialize a membership list for a `jsonb` column.
pub fn members_json(members: &[Member]) -> serde_json::Value {
    serde_json::to_value(members).unwrap_or_else(|_| serde_json::Value::Array(Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let now = Utc::now();
        Session {
            id: Session::generate(),
            title: "Late night jam".to_string(),
            description: None,
            host_id: "usr_host".to_string(),
            participants: vec![Member {
                user_id: "usr_host".to_string(),
                role: SessionRole::Host,
                joined_at: now,
            }],
            viewers: Vec::new(),
            is_paid: false,
            price: 0,
            max_participants: 3,
            is_archive_enabled: false,
            status: SessionStatus::Scheduled,
            scheduled_start_at: None,
            started_at: None,
            ended_at: None,
            join_token: "jt_test".to_string(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn add_member_routes_viewers_to_audience_list() {
        let mut s = session();
        assert!(s.add_member("usr_v", SessionRole::Viewer, Utc::now()));
        assert!(s.add_member("usr_p", SessionRole::Performer, Utc::now()));
        assert_eq!(s.participants.len(), 2);
        assert_eq!(s.viewers.len(), 1);
        assert_eq!(s.performer_count(), 1);
        assert!(s.has_member("usr_v"));
        assert!(s.participant("usr_v").is_none());
    }

    #[test]
    fn add_member_is_idempotent() {
        let mut s = session();
        assert!(s.add_member("usr_p", SessionRole::Performer, Utc::now()));
        assert!(!s.add_member("usr_p", SessionRole::Performer, Utc::now()));
        assert_eq!(s.participants.len(), 2);
    }

    #[test]
    fn remove_member_never_removes_host() {
        let mut s = session();
        s.add_member("usr_p", SessionRole::Performer, Utc::now());
        assert!(!s.remove_member("usr_host"));
        assert!(s.remove_member("usr_p"));
        assert!(!s.remove_member("usr_p"));
        assert_eq!(s.member_ids().collect::<Vec<_>>(), vec!["usr_host"]);
    }

    #[test]
    fn status_and_role_parse_from_wire_names() {
        assert_eq!("live".parse::<SessionStatus>(), Ok(SessionStatus::Live));
        assert!("paused".parse::<SessionStatus>().is_err());
        assert_eq!("viewer".parse::<SessionRole>(), Ok(SessionRole::Viewer));
        assert_eq!(SessionRole::Performer.to_string(), "performer");
    }

    #[test]
    fn row_conversion_rejects_corrupt_members() {
        let s = session();
        let row = SessionRow {
            id: s.id.clone(),
            title: s.title.clone(),
            description: None,
            host_id: s.host_id.clone(),
            participants: serde_json::json!([{ "user_id": "usr_host" }]),
            viewers: serde_json::json!([]),
            is_paid: false,
            price: 0,
            max_participants: 3,
            is_archive_enabled: false,
            status: "scheduled".to_string(),
            scheduled_start_at: None,
            started_at: None,
            ended_at: None,
            join_token: s.join_token.clone(),
            version: 0,
            created_at: s.created_at,
            updated_at: s.updated_at,
        };
        assert!(Session::try_from(row).is_err());
    }

    #[test]
    fn join_token_is_only_shown_to_the_host() {
        let s = session();
        assert_eq!(
            SessionResponse::new(&s, Some("usr_host")).join_token.as_deref(),
            Some("jt_test")
        );
        assert!(SessionResponse::new(&s, Some("usr_other")).join_token.is_none());
        assert!(SessionResponse::new(&s, None).join_token.is_none());
    }
}
