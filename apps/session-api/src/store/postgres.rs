//! PostgreSQL store on diesel-async.
//!
//! Membership lists live in `jsonb` columns so a session stays one row and
//! one atomic write. Optimistic writes are `UPDATE ... WHERE version = $n`;
//! pointer writes filter on the expected previous pointer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::{count_star, sql};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, OptionalExtension};
use diesel::sql_types::{Bool, Jsonb};
use diesel::upsert::excluded;
use diesel_async::pooled_connection::deadpool::PoolError;
use diesel_async::AsyncConnection;
use scoped_futures::ScopedFutureExt;

use crate::db::pool::DbPool;
use crate::db::schema::{session_applications, sessions, users};
use crate::models::application::{Application, ApplicationRow, ApplicationStatus, NewApplicationRow};
use crate::models::session::{members_json, NewSessionRow, Session, SessionChanges, SessionRow, SessionStatus};
use crate::models::user::{ActiveSession, NewUserRow, User, UserRow};

use super::{SessionPage, SessionQuery, SessionSort, SessionStore, SortOrder, StoreError};

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                StoreError::Duplicate("unique key")
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<PoolError> for StoreError {
    fn from(err: PoolError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

fn decode<R, T>(row: R) -> Result<T, StoreError>
where
    T: TryFrom<R, Error = String>,
{
    T::try_from(row).map_err(StoreError::Corrupt)
}

/// Escape `%`, `_` and `\` so user input matches literally inside `ILIKE`.
fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn upsert_user(
        &self,
        id: &str,
        username: &str,
        display_name: &str,
    ) -> Result<User, StoreError> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();

        let row: UserRow = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(users::table)
                .values(NewUserRow {
                    id,
                    username,
                    display_name,
                    created_at: now,
                    updated_at: now,
                })
                .on_conflict(users::id)
                .do_update()
                .set((
                    users::username.eq(excluded(users::username)),
                    users::display_name.eq(excluded(users::display_name)),
                    users::updated_at.eq(now),
                ))
                .returning(UserRow::as_returning()),
            &mut conn,
        )
        .await?;

        decode(row)
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        let mut conn = self.pool.get().await?;

        let row: Option<UserRow> = diesel_async::RunQueryDsl::get_result(
            users::table.find(id).select(UserRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;

        row.map(decode).transpose()
    }

    async fn swap_active_session(
        &self,
        user_id: &str,
        expected: Option<&ActiveSession>,
        next: Option<&ActiveSession>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        let next_id = next.map(|a| a.session_id.as_str());
        let next_role = next.map(|a| a.role.as_str());

        let updated = match expected {
            None => {
                diesel_async::RunQueryDsl::execute(
                    diesel::update(
                        users::table
                            .find(user_id)
                            .filter(users::active_session_id.is_null()),
                    )
                    .set((
                        users::active_session_id.eq(next_id),
                        users::active_session_role.eq(next_role),
                        users::updated_at.eq(now),
                    )),
                    &mut conn,
                )
                .await?
            }
            Some(current) => {
                diesel_async::RunQueryDsl::execute(
                    diesel::update(
                        users::table
                            .find(user_id)
                            .filter(users::active_session_id.eq(&current.session_id))
                            .filter(users::active_session_role.eq(current.role.as_str())),
                    )
                    .set((
                        users::active_session_id.eq(next_id),
                        users::active_session_role.eq(next_role),
                        users::updated_at.eq(now),
                    )),
                    &mut conn,
                )
                .await?
            }
        };

        Ok(updated == 1)
    }

    async fn release_active_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;

        let updated = diesel_async::RunQueryDsl::execute(
            diesel::update(
                users::table
                    .find(user_id)
                    .filter(users::active_session_id.eq(session_id)),
            )
            .set((
                users::active_session_id.eq(None::<String>),
                users::active_session_role.eq(None::<String>),
                users::updated_at.eq(Utc::now()),
            )),
            &mut conn,
        )
        .await?;

        Ok(updated == 1)
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;

        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(sessions::table).values(NewSessionRow {
                id: &session.id,
                title: &session.title,
                description: session.description.as_deref(),
                host_id: &session.host_id,
                participants: members_json(&session.participants),
                viewers: members_json(&session.viewers),
                is_paid: session.is_paid,
                price: session.price,
                max_participants: session.max_participants,
                is_archive_enabled: session.is_archive_enabled,
                status: session.status.as_str(),
                scheduled_start_at: session.scheduled_start_at,
                started_at: session.started_at,
                ended_at: session.ended_at,
                join_token: &session.join_token,
                version: session.version,
                created_at: session.created_at,
                updated_at: session.updated_at,
            }),
            &mut conn,
        )
        .await?;

        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let mut conn = self.pool.get().await?;

        let row: Option<SessionRow> = diesel_async::RunQueryDsl::get_result(
            sessions::table.find(id).select(SessionRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;

        row.map(decode).transpose()
    }

    async fn find_session_by_join_token(
        &self,
        token: &str,
    ) -> Result<Option<Session>, StoreError> {
        let mut conn = self.pool.get().await?;

        let row: Option<SessionRow> = diesel_async::RunQueryDsl::get_result(
            sessions::table
                .filter(sessions::join_token.eq(token))
                .select(SessionRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;

        row.map(decode).transpose()
    }

    async fn update_session(&self, session: &Session) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;

        let changes = SessionChanges {
            title: &session.title,
            description: session.description.as_deref(),
            participants: members_json(&session.participants),
            viewers: members_json(&session.viewers),
            is_paid: session.is_paid,
            price: session.price,
            max_participants: session.max_participants,
            is_archive_enabled: session.is_archive_enabled,
            status: session.status.as_str(),
            scheduled_start_at: session.scheduled_start_at,
            started_at: session.started_at,
            ended_at: session.ended_at,
            version: session.version + 1,
            updated_at: session.updated_at,
        };

        let updated = diesel_async::RunQueryDsl::execute(
            diesel::update(
                sessions::table
                    .find(&session.id)
                    .filter(sessions::version.eq(session.version)),
            )
            .set(&changes),
            &mut conn,
        )
        .await?;

        Ok(updated == 1)
    }

    async fn list_sessions(&self, query: &SessionQuery) -> Result<SessionPage, StoreError> {
        let mut conn = self.pool.get().await?;
        let query = query.clone();

        // Count and page read from one snapshot.
        let (rows, total) = conn
            .transaction::<_, diesel::result::Error, _>(move |conn| {
                async move {
                    let mut page = sessions::table.select(SessionRow::as_select()).into_boxed();
                    let mut count = sessions::table.select(count_star()).into_boxed();

                    if let Some(status) = query.status {
                        page = page.filter(sessions::status.eq(status.as_str()));
                        count = count.filter(sessions::status.eq(status.as_str()));
                    }
                    if let Some(search) = query.search.as_deref() {
                        let pattern = like_pattern(search);
                        page = page.filter(
                            sessions::title
                                .ilike(pattern.clone())
                                .or(sessions::description.assume_not_null().ilike(pattern.clone())),
                        );
                        count = count.filter(
                            sessions::title
                                .ilike(pattern.clone())
                                .or(sessions::description.assume_not_null().ilike(pattern)),
                        );
                    }

                    page = match (query.sort, query.order) {
                        (SessionSort::CreatedAt, SortOrder::Asc) => page.order(sessions::created_at.asc()),
                        (SessionSort::CreatedAt, SortOrder::Desc) => page.order(sessions::created_at.desc()),
                        (SessionSort::ScheduledStartAt, SortOrder::Asc) => {
                            page.order(sessions::scheduled_start_at.asc().nulls_first())
                        }
                        (SessionSort::ScheduledStartAt, SortOrder::Desc) => {
                            page.order(sessions::scheduled_start_at.desc().nulls_last())
                        }
                        (SessionSort::Title, SortOrder::Asc) => page.order(sessions::title.asc()),
                        (SessionSort::Title, SortOrder::Desc) => page.order(sessions::title.desc()),
                        (SessionSort::Price, SortOrder::Asc) => page.order(sessions::price.asc()),
                        (SessionSort::Price, SortOrder::Desc) => page.order(sessions::price.desc()),
                    };
                    page = match query.order {
                        SortOrder::Asc => page.then_order_by(sessions::id.asc()),
                        SortOrder::Desc => page.then_order_by(sessions::id.desc()),
                    };

                    let rows: Vec<SessionRow> = diesel_async::RunQueryDsl::load(
                        page.offset(query.offset.max(0)).limit(query.limit.max(0)),
                        conn,
                    )
                    .await?;
                    let total: i64 = diesel_async::RunQueryDsl::get_result(count, conn).await?;

                    Ok((rows, total))
                }
                .scope_boxed()
            })
            .await?;

        let items = rows.into_iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        Ok(SessionPage { items, total })
    }

    async fn list_sessions_for_user(
        &self,
        user_id: &str,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, StoreError> {
        let mut conn = self.pool.get().await?;
        let needle = serde_json::json!([{ "user_id": user_id }]);

        let membership = sql::<Bool>("(participants @> ")
            .bind::<Jsonb, _>(needle.clone())
            .sql(" OR viewers @> ")
            .bind::<Jsonb, _>(needle)
            .sql(")");

        let mut query = sessions::table
            .filter(sessions::host_id.eq(user_id).or(membership))
            .select(SessionRow::as_select())
            .order((sessions::created_at.desc(), sessions::id.desc()))
            .into_boxed();

        if let Some(status) = status {
            query = query.filter(sessions::status.eq(status.as_str()));
        }

        let rows: Vec<SessionRow> = diesel_async::RunQueryDsl::load(query, &mut conn).await?;
        rows.into_iter().map(decode).collect()
    }

    async fn list_due_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        let mut conn = self.pool.get().await?;

        let rows: Vec<SessionRow> = diesel_async::RunQueryDsl::load(
            sessions::table
                .filter(sessions::status.eq(SessionStatus::Scheduled.as_str()))
                .filter(sessions::scheduled_start_at.le(now))
                .order(sessions::scheduled_start_at.asc())
                .select(SessionRow::as_select()),
            &mut conn,
        )
        .await?;

        rows.into_iter().map(decode).collect()
    }

    async fn upsert_application(
        &self,
        application: &Application,
    ) -> Result<Application, StoreError> {
        let mut conn = self.pool.get().await?;

        let row: ApplicationRow = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(session_applications::table)
                .values(NewApplicationRow {
                    id: &application.id,
                    session_id: &application.session_id,
                    user_id: &application.user_id,
                    status: application.status.as_str(),
                    requested_at: application.requested_at,
                    responded_at: application.responded_at,
                })
                .on_conflict((session_applications::session_id, session_applications::user_id))
                .do_update()
                .set((
                    session_applications::status.eq(excluded(session_applications::status)),
                    session_applications::requested_at
                        .eq(excluded(session_applications::requested_at)),
                    session_applications::responded_at
                        .eq(excluded(session_applications::responded_at)),
                ))
                .returning(ApplicationRow::as_returning()),
            &mut conn,
        )
        .await?;

        decode(row)
    }

    async fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError> {
        let mut conn = self.pool.get().await?;

        let row: Option<ApplicationRow> = diesel_async::RunQueryDsl::get_result(
            session_applications::table
                .find(id)
                .select(ApplicationRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;

        row.map(decode).transpose()
    }

    async fn find_application(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<Application>, StoreError> {
        let mut conn = self.pool.get().await?;

        let row: Option<ApplicationRow> = diesel_async::RunQueryDsl::get_result(
            session_applications::table
                .filter(session_applications::session_id.eq(session_id))
                .filter(session_applications::user_id.eq(user_id))
                .select(ApplicationRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;

        row.map(decode).transpose()
    }

    async fn transition_application(
        &self,
        id: &str,
        expected: ApplicationStatus,
        next: ApplicationStatus,
        responded_at: DateTime<Utc>,
    ) -> Result<Option<Application>, StoreError> {
        let mut conn = self.pool.get().await?;

        let row: Option<ApplicationRow> = diesel_async::RunQueryDsl::get_result(
            diesel::update(
                session_applications::table
                    .find(id)
                    .filter(session_applications::status.eq(expected.as_str())),
            )
            .set((
                session_applications::status.eq(next.as_str()),
                session_applications::responded_at.eq(Some(responded_at)),
            ))
            .returning(ApplicationRow::as_returning()),
            &mut conn,
        )
        .await
        .optional()?;

        row.map(decode).transpose()
    }

    async fn list_applications(
        &self,
        session_id: &str,
        status: Option<ApplicationStatus>,
    ) -> Result<Vec<Application>, StoreError> {
        let mut conn = self.pool.get().await?;

        let mut query = session_applications::table
            .filter(session_applications::session_id.eq(session_id))
            .order((
                session_applications::requested_at.asc(),
                session_applications::seq.asc(),
            ))
            .select(ApplicationRow::as_select())
            .into_boxed();

        if let Some(status) = status {
            query = query.filter(session_applications::status.eq(status.as_str()));
        }

        let rows: Vec<ApplicationRow> = diesel_async::RunQueryDsl::load(query, &mut conn).await?;
        rows.into_iter().map(decode).collect()
    }
}
