use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use jamroom_common::id::prefix;
use jamroom_common::PrefixedId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::schema::session_applications;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Rejected,
    Canceled,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown application status `{other}`")),
        }
    }
}

/// A user's request to perform in a session. One record per (session, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Application {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub status: ApplicationStatus,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl PrefixedId for Application {
    const PREFIX: &'static str = prefix::APPLICATION;
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = session_applications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ApplicationRow {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub status: String,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = session_applications)]
pub struct NewApplicationRow<'a> {
    pub id: &'a str,
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub status: &'a str,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl TryFrom<ApplicationRow> for Application {
    type Error = String;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        Ok(Application {
            status: row.status.parse()?,
            id: row.id,
            session_id: row.session_id,
            user_id: row.user_id,
            requested_at: row.requested_at,
            responded_at: row.responded_at,
        })
    }
}
