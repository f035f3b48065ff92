//! Membership invariant engine.
//!
//! Every mutation runs under the session's lock and commits in a fixed
//! order: user pointer (CAS), then the session document (version CAS), then
//! the application record. A failed later step undoes the earlier ones, so a
//! user never ends up pointing at a session that does not list them.
//! Notifications are queued while the lock is held and handed to the
//! notifier only after it is released.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jamroom_common::PrefixedId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::tokens::generate_opaque_token;
use crate::error::FieldError;
use crate::gateway::events::{
    ApplicationEvent, ApplicationResponded, EventName, ParticipantApproved, SessionStatusUpdated,
    SessionUpdated, UserJoinedSession, UserLeftSession,
};
use crate::gateway::notifier::{Notification, Notifier};
use crate::models::application::{Application, ApplicationStatus};
use crate::models::session::{Member, Session, SessionRole, SessionStatus};
use crate::models::user::{ActiveSession, User};
use crate::store::{SessionStore, StoreError};

use super::error::{ConflictReason, ForbiddenReason, MembershipError, NotFoundReason, StateReason};
use super::lifecycle::{self, LifecycleEvent, Transition};
use super::locks::SessionLocks;
use super::policy::{HostLeave, MembershipPolicy};

pub const TITLE_MAX_CHARS: usize = 100;
pub const DESCRIPTION_MAX_CHARS: usize = 2000;
pub const MIN_PARTICIPANTS: i32 = 2;
pub const MAX_PARTICIPANTS: i32 = 10;
const JOIN_TOKEN_ATTEMPTS: usize = 3;

pub type Outbox = Vec<Notification>;

/// Fields supplied when creating a session.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewSession {
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub is_paid: bool,
    /// Ticket price in minor currency units; required when `is_paid`.
    pub price: Option<i64>,
    pub max_participants: i32,
    #[serde(default)]
    pub is_archive_enabled: bool,
    pub scheduled_start_at: Option<DateTime<Utc>>,
}

/// Partial update of a session's settings. Absent fields are unchanged.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SessionPatch {
    pub title: Option<String>,
    /// An empty string clears the description.
    pub description: Option<String>,
    pub is_paid: Option<bool>,
    pub price: Option<i64>,
    pub max_participants: Option<i32>,
    pub is_archive_enabled: Option<bool>,
    pub scheduled_start_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub session_id: String,
    pub role: SessionRole,
    /// `false` for an idempotent repeat.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub session_id: String,
    pub role: SessionRole,
    /// The leave ended the session (host leave under `end_session`), or
    /// the session had already ended.
    pub session_ended: bool,
}

/// What the calling user may do with a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct UserAccess {
    pub is_host: bool,
    pub is_participant: bool,
    pub can_join: bool,
    pub application_status: Option<ApplicationStatus>,
    pub can_apply: bool,
    pub user_role: Option<SessionRole>,
}

/// Validated, normalized session settings.
#[derive(Debug)]
struct Settings {
    title: String,
    description: Option<String>,
    is_paid: bool,
    price: i64,
    max_participants: i32,
}

fn validate_settings(
    title: &str,
    description: Option<&str>,
    is_paid: bool,
    price: Option<i64>,
    max_participants: i32,
) -> Result<Settings, MembershipError> {
    let mut errors = Vec::new();
    let field = |field: &str, message: &str| FieldError {
        field: field.to_string(),
        message: message.to_string(),
    };

    let title = title.trim().to_string();
    if title.is_empty() || title.chars().count() > TITLE_MAX_CHARS {
        errors.push(field("title", "must be 1-100 characters"));
    }

    let description = description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string);
    if description
        .as_deref()
        .is_some_and(|d| d.chars().count() > DESCRIPTION_MAX_CHARS)
    {
        errors.push(field("description", "must be at most 2000 characters"));
    }

    if !(MIN_PARTICIPANTS..=MAX_PARTICIPANTS).contains(&max_participants) {
        errors.push(field("max_participants", "must be between 2 and 10"));
    }

    let price = if is_paid {
        match price {
            Some(p) if p >= 0 => p,
            Some(_) => {
                errors.push(field("price", "must not be negative"));
                0
            }
            None => {
                errors.push(field("price", "is required for paid sessions"));
                0
            }
        }
    } else {
        0
    };

    if !errors.is_empty() {
        return Err(MembershipError::Validation(errors));
    }

    Ok(Settings {
        title,
        description,
        is_paid,
        price,
        max_participants,
    })
}

/// Opaque invite token; never derived from the session id.
fn generate_join_token() -> String {
    generate_opaque_token("jt", 16)
}

pub struct MembershipEngine {
    store: Arc<dyn SessionStore>,
    notifier: Arc<dyn Notifier>,
    policy: MembershipPolicy,
    locks: SessionLocks,
}

impl MembershipEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        notifier: Arc<dyn Notifier>,
        policy: MembershipPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            policy,
            locks: SessionLocks::new(),
        }
    }

    pub fn policy(&self) -> MembershipPolicy {
        self.policy
    }

    /// Drop idle session locks. Returns the number removed.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    fn flush(&self, outbox: Outbox) {
        for notification in outbox {
            self.notifier.notify(notification);
        }
    }

    async fn load_session(&self, session_id: &str) -> Result<Session, MembershipError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or(MembershipError::NotFound(NotFoundReason::Session))
    }

    async fn load_user(&self, user_id: &str) -> Result<User, MembershipError> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or(MembershipError::NotFound(NotFoundReason::User))
    }

    /// Version-checked write. Keeps the in-memory copy's version in step
    /// with the store.
    async fn commit_session(&self, session: &mut Session) -> Result<(), MembershipError> {
        session.updated_at = Utc::now();
        if self.store.update_session(session).await? {
            session.version += 1;
            Ok(())
        } else {
            tracing::warn!(session_id = %session.id, version = session.version, "session version conflict");
            Err(MembershipError::ConcurrentModification)
        }
    }

    /// Undo a pointer write made earlier in the same operation.
    async fn restore_pointer(
        &self,
        user_id: &str,
        current: Option<&ActiveSession>,
        previous: Option<&ActiveSession>,
    ) {
        match self
            .store
            .swap_active_session(user_id, current, previous)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!(user_id, "active session pointer changed before it could be restored")
            }
            Err(e) => tracing::error!(user_id, error = %e, "failed to restore active session pointer"),
        }
    }

    /// Explain why a pointer CAS from the empty state lost.
    async fn pointer_conflict(&self, user_id: &str, session_id: &str) -> MembershipError {
        match self.store.get_user(user_id).await {
            Ok(Some(user)) => match user.active_session {
                Some(ptr) if ptr.session_id == session_id => {
                    MembershipError::conflict(ConflictReason::AlreadyInSameSessionDifferentRole)
                }
                Some(_) => MembershipError::conflict(ConflictReason::AlreadyInAnotherSession),
                None => MembershipError::ConcurrentModification,
            },
            Ok(None) => MembershipError::NotFound(NotFoundReason::User),
            Err(e) => e.into(),
        }
    }

    fn occupied_conflict(ptr: &ActiveSession, session_id: &str) -> MembershipError {
        if ptr.session_id == session_id {
            MembershipError::conflict(ConflictReason::AlreadyInSameSessionDifferentRole)
        } else {
            MembershipError::conflict(ConflictReason::AlreadyInAnotherSession)
        }
    }

    // -----------------------------------------------------------------------
    // createSession
    // -----------------------------------------------------------------------

    pub async fn create_session(
        &self,
        host_id: &str,
        params: NewSession,
    ) -> Result<Session, MembershipError> {
        let settings = validate_settings(
            &params.title,
            params.description.as_deref(),
            params.is_paid,
            params.price,
            params.max_participants,
        )?;

        let host = self.load_user(host_id).await?;
        if host.active_session.is_some() {
            return Err(MembershipError::conflict(ConflictReason::AlreadyInAnotherSession));
        }

        let now = Utc::now();
        let mut session = Session {
            id: Session::generate(),
            title: settings.title,
            description: settings.description,
            host_id: host_id.to_string(),
            participants: vec![Member {
                user_id: host_id.to_string(),
                role: SessionRole::Host,
                joined_at: now,
            }],
            viewers: Vec::new(),
            is_paid: settings.is_paid,
            price: settings.price,
            max_participants: settings.max_participants,
            is_archive_enabled: params.is_archive_enabled,
            status: SessionStatus::Scheduled,
            scheduled_start_at: params.scheduled_start_at,
            started_at: None,
            ended_at: None,
            join_token: generate_join_token(),
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let pointer = ActiveSession {
            session_id: session.id.clone(),
            role: SessionRole::Host,
        };
        if !self
            .store
            .swap_active_session(host_id, None, Some(&pointer))
            .await?
        {
            return Err(MembershipError::conflict(ConflictReason::AlreadyInAnotherSession));
        }

        let mut attempt = 1;
        loop {
            match self.store.insert_session(&session).await {
                Ok(()) => {
                    tracing::info!(session_id = %session.id, user_id = host_id, "session created");
                    return Ok(session);
                }
                Err(StoreError::Duplicate(what)) if attempt < JOIN_TOKEN_ATTEMPTS => {
                    tracing::warn!(attempt, what, "session insert collided, regenerating join token");
                    session.join_token = generate_join_token();
                    attempt += 1;
                }
                Err(e) => {
                    self.restore_pointer(host_id, Some(&pointer), None).await;
                    return Err(e.into());
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // applyAsPerformer
    // -----------------------------------------------------------------------

    pub async fn apply_as_performer(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Application, MembershipError> {
        let mut outbox = Outbox::new();
        let result = {
            let _guard = self.locks.acquire(session_id).await;
            self.apply_locked(user_id, session_id, &mut outbox).await
        };
        self.flush(outbox);
        result
    }

    async fn apply_locked(
        &self,
        user_id: &str,
        session_id: &str,
        outbox: &mut Outbox,
    ) -> Result<Application, MembershipError> {
        let session = self.load_session(session_id).await?;
        let user = self.load_user(user_id).await?;

        if session.is_host(user_id) || session.participant(user_id).is_some() {
            return Err(MembershipError::conflict(ConflictReason::AlreadyParticipant));
        }
        if !lifecycle::accepts_membership_changes(session.status) {
            return Err(MembershipError::conflict(ConflictReason::SessionEnded));
        }
        if let Some(ptr) = &user.active_session {
            return Err(Self::occupied_conflict(ptr, session_id));
        }
        if !self.policy.has_performer_slot(&session) {
            return Err(MembershipError::conflict(ConflictReason::RoomFullForPerformers));
        }

        let existing = self.store.find_application(session_id, user_id).await?;
        if existing
            .as_ref()
            .is_some_and(|a| a.status == ApplicationStatus::Pending)
        {
            return Err(MembershipError::conflict(ConflictReason::ApplicationAlreadyPending));
        }

        let application = self
            .store
            .upsert_application(&Application {
                id: existing.map_or_else(Application::generate, |a| a.id),
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                status: ApplicationStatus::Pending,
                requested_at: Utc::now(),
                responded_at: None,
            })
            .await?;

        tracing::info!(session_id, user_id, application_id = %application.id, "performer application received");

        outbox.push(Notification::to_user(
            &session.host_id,
            EventName::PERFORMER_APPLICATION_RECEIVED,
            ApplicationEvent {
                session_id: session_id.to_string(),
                application_id: application.id.clone(),
                user_id: user_id.to_string(),
                requested_at: application.requested_at,
            },
        ));

        Ok(application)
    }

    // -----------------------------------------------------------------------
    // respondToApplication
    // -----------------------------------------------------------------------

    pub async fn respond_to_application(
        &self,
        host_id: &str,
        session_id: &str,
        application_id: &str,
        action: ApplicationAction,
    ) -> Result<Application, MembershipError> {
        let mut outbox = Outbox::new();
        let result = {
            let _guard = self.locks.acquire(session_id).await;
            self.respond_locked(host_id, session_id, application_id, action, &mut outbox)
                .await
        };
        self.flush(outbox);
        result
    }

    async fn respond_locked(
        &self,
        host_id: &str,
        session_id: &str,
        application_id: &str,
        action: ApplicationAction,
        outbox: &mut Outbox,
    ) -> Result<Application, MembershipError> {
        let mut session = self.load_session(session_id).await?;
        if !session.is_host(host_id) {
            return Err(MembershipError::Forbidden(ForbiddenReason::NotHost));
        }

        let application = self
            .store
            .get_application(application_id)
            .await?
            .filter(|a| a.session_id == session_id)
            .ok_or(MembershipError::NotFound(NotFoundReason::Application))?;
        if application.status != ApplicationStatus::Pending {
            return Err(MembershipError::InvalidState(
                StateReason::ApplicationAlreadyResponded,
            ));
        }

        match action {
            ApplicationAction::Reject => {
                let rejected = self
                    .resolve_application(&application, ApplicationStatus::Rejected, None, outbox)
                    .await?;
                tracing::info!(session_id, application_id, user_id = %application.user_id, "application rejected");
                Ok(rejected)
            }
            ApplicationAction::Approve => {
                self.approve_locked(&mut session, application, outbox).await
            }
        }
    }

    /// Pending → `status`, notifying the applicant.
    async fn resolve_application(
        &self,
        application: &Application,
        status: ApplicationStatus,
        reason: Option<ConflictReason>,
        outbox: &mut Outbox,
    ) -> Result<Application, MembershipError> {
        let updated = self
            .store
            .transition_application(
                &application.id,
                ApplicationStatus::Pending,
                status,
                Utc::now(),
            )
            .await?
            .ok_or(MembershipError::InvalidState(
                StateReason::ApplicationAlreadyResponded,
            ))?;

        outbox.push(Notification::to_user(
            &application.user_id,
            EventName::APPLICATION_RESPONDED,
            ApplicationResponded {
                session_id: application.session_id.clone(),
                application_id: application.id.clone(),
                status,
                reason: reason.map(|r| r.as_code()),
            },
        ));

        Ok(updated)
    }

    /// Reject instead of approving, then report the original conflict.
    async fn auto_reject(
        &self,
        application: &Application,
        reason: ConflictReason,
        outbox: &mut Outbox,
    ) -> MembershipError {
        tracing::warn!(
            session_id = %application.session_id,
            application_id = %application.id,
            user_id = %application.user_id,
            reason = reason.as_code(),
            "approval no longer valid, application auto-rejected"
        );
        match self
            .resolve_application(application, ApplicationStatus::Rejected, Some(reason), outbox)
            .await
        {
            Ok(_) => MembershipError::Conflict {
                reason,
                auto_rejected: true,
            },
            Err(e) => e,
        }
    }

    async fn approve_locked(
        &self,
        session: &mut Session,
        application: Application,
        outbox: &mut Outbox,
    ) -> Result<Application, MembershipError> {
        let applicant_id = application.user_id.clone();
        let applicant = self.load_user(&applicant_id).await?;

        // Commit-time re-check; state may have moved since the application.
        let violation = if !lifecycle::accepts_membership_changes(session.status) {
            Some(ConflictReason::SessionEnded)
        } else if let Some(ptr) = &applicant.active_session {
            Some(if ptr.session_id == session.id {
                ConflictReason::AlreadyInSameSessionDifferentRole
            } else {
                ConflictReason::AlreadyInAnotherSession
            })
        } else if session.participant(&applicant_id).is_some() {
            Some(ConflictReason::AlreadyParticipant)
        } else if !self.policy.has_performer_slot(session) {
            Some(ConflictReason::RoomFullForPerformers)
        } else {
            None
        };
        if let Some(reason) = violation {
            return Err(self.auto_reject(&application, reason, outbox).await);
        }

        let pointer = ActiveSession {
            session_id: session.id.clone(),
            role: SessionRole::Performer,
        };
        if !self
            .store
            .swap_active_session(&applicant_id, None, Some(&pointer))
            .await?
        {
            let reason = match self.pointer_conflict(&applicant_id, &session.id).await {
                MembershipError::Conflict { reason, .. } => reason,
                other => return Err(other),
            };
            return Err(self.auto_reject(&application, reason, outbox).await);
        }

        let now = Utc::now();
        session.viewers.retain(|m| m.user_id != applicant_id);
        session.add_member(&applicant_id, SessionRole::Performer, now);
        if let Err(e) = self.commit_session(session).await {
            self.restore_pointer(&applicant_id, Some(&pointer), None).await;
            return Err(e);
        }

        let approved = match self
            .resolve_application(&application, ApplicationStatus::Approved, None, outbox)
            .await
        {
            Ok(approved) => approved,
            Err(e) => {
                session.remove_member(&applicant_id);
                if let Err(undo) = self.commit_session(session).await {
                    tracing::error!(session_id = %session.id, user_id = %applicant_id, error = %undo, "failed to undo approval");
                }
                self.restore_pointer(&applicant_id, Some(&pointer), None).await;
                return Err(e);
            }
        };

        tracing::info!(session_id = %session.id, user_id = %applicant_id, application_id = %approved.id, "application approved");

        outbox.push(Notification::to_session(
            &session.id,
            EventName::SESSION_PARTICIPANT_APPROVED,
            ParticipantApproved {
                session_id: session.id.clone(),
                user_id: applicant_id,
                role: SessionRole::Performer,
            },
        ));

        Ok(approved)
    }

    // -----------------------------------------------------------------------
    // cancelApplication
    // -----------------------------------------------------------------------

    pub async fn cancel_application(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Application, MembershipError> {
        let mut outbox = Outbox::new();
        let result = {
            let _guard = self.locks.acquire(session_id).await;
            self.cancel_locked(user_id, session_id, &mut outbox).await
        };
        self.flush(outbox);
        result
    }

    async fn cancel_locked(
        &self,
        user_id: &str,
        session_id: &str,
        outbox: &mut Outbox,
    ) -> Result<Application, MembershipError> {
        let session = self.load_session(session_id).await?;
        let application = self
            .store
            .find_application(session_id, user_id)
            .await?
            .ok_or(MembershipError::NotFound(NotFoundReason::Application))?;
        if application.status != ApplicationStatus::Pending {
            return Err(MembershipError::InvalidState(
                StateReason::ApplicationAlreadyResponded,
            ));
        }

        let canceled = self
            .store
            .transition_application(
                &application.id,
                ApplicationStatus::Pending,
                ApplicationStatus::Canceled,
                Utc::now(),
            )
            .await?
            .ok_or(MembershipError::InvalidState(
                StateReason::ApplicationAlreadyResponded,
            ))?;

        tracing::info!(session_id, user_id, application_id = %canceled.id, "application canceled");

        outbox.push(Notification::to_user(
            &session.host_id,
            EventName::PERFORMER_APPLICATION_CANCELED,
            ApplicationEvent {
                session_id: session_id.to_string(),
                application_id: canceled.id.clone(),
                user_id: user_id.to_string(),
                requested_at: canceled.requested_at,
            },
        ));

        Ok(canceled)
    }

    // -----------------------------------------------------------------------
    // joinSession
    // -----------------------------------------------------------------------

    /// Join as `requested` (viewer or performer). The host always joins as
    /// host, and performers need an approved application.
    pub async fn join_session(
        &self,
        user_id: &str,
        session_id: &str,
        requested: SessionRole,
    ) -> Result<JoinOutcome, MembershipError> {
        let mut outbox = Outbox::new();
        let result = {
            let _guard = self.locks.acquire(session_id).await;
            self.join_locked(user_id, session_id, requested, &mut outbox)
                .await
        };
        self.flush(outbox);
        result
    }

    async fn resolve_role(
        &self,
        session: &Session,
        user_id: &str,
        requested: SessionRole,
    ) -> Result<SessionRole, MembershipError> {
        if session.is_host(user_id) {
            return Ok(SessionRole::Host);
        }
        if requested == SessionRole::Viewer {
            return Ok(SessionRole::Viewer);
        }
        let approved = self
            .store
            .find_application(&session.id, user_id)
            .await?
            .is_some_and(|a| a.status == ApplicationStatus::Approved);
        if approved {
            Ok(SessionRole::Performer)
        } else {
            Err(MembershipError::conflict(ConflictReason::ApplicationRequired))
        }
    }

    async fn join_locked(
        &self,
        user_id: &str,
        session_id: &str,
        requested: SessionRole,
        outbox: &mut Outbox,
    ) -> Result<JoinOutcome, MembershipError> {
        let mut session = self.load_session(session_id).await?;
        if !lifecycle::accepts_membership_changes(session.status) {
            return Err(MembershipError::conflict(ConflictReason::SessionEnded));
        }
        let user = self.load_user(user_id).await?;
        let role = self.resolve_role(&session, user_id, requested).await?;

        let changed = match &user.active_session {
            Some(ptr) if ptr.session_id != session_id => {
                return Err(MembershipError::conflict(ConflictReason::AlreadyInAnotherSession));
            }
            Some(ptr) if ptr.role != role => {
                return Err(MembershipError::conflict(
                    ConflictReason::AlreadyInSameSessionDifferentRole,
                ));
            }
            Some(_) => {
                // Already joined. Repair a missing entry, otherwise no-op.
                let repaired = session.add_member(user_id, role, Utc::now());
                if repaired {
                    tracing::warn!(session_id, user_id, %role, "membership entry repaired on join");
                    self.commit_session(&mut session).await?;
                }
                repaired
            }
            None => {
                let listed = match role {
                    SessionRole::Viewer => session.viewer(user_id).is_some(),
                    SessionRole::Host | SessionRole::Performer => {
                        session.participant(user_id).is_some()
                    }
                };
                if role == SessionRole::Performer && !listed && !self.policy.has_performer_slot(&session) {
                    return Err(MembershipError::conflict(ConflictReason::RoomFullForPerformers));
                }

                let pointer = ActiveSession {
                    session_id: session_id.to_string(),
                    role,
                };
                if !self
                    .store
                    .swap_active_session(user_id, None, Some(&pointer))
                    .await?
                {
                    return Err(self.pointer_conflict(user_id, session_id).await);
                }

                // Drop a stale entry left in the other list.
                let stale = match role {
                    SessionRole::Viewer => session.participant(user_id).is_some(),
                    SessionRole::Host | SessionRole::Performer => session.viewer(user_id).is_some(),
                };
                if stale {
                    session.remove_member(user_id);
                }
                let added = session.add_member(user_id, role, Utc::now());
                if stale || added {
                    if let Err(e) = self.commit_session(&mut session).await {
                        self.restore_pointer(user_id, Some(&pointer), None).await;
                        return Err(e);
                    }
                }
                true
            }
        };

        if changed {
            tracing::info!(session_id, user_id, %role, "user joined session");
            outbox.push(Notification::to_session(
                session_id,
                EventName::USER_JOINED_SESSION,
                UserJoinedSession {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    role,
                },
            ));
        }

        Ok(JoinOutcome {
            session_id: session_id.to_string(),
            role,
            changed,
        })
    }

    // -----------------------------------------------------------------------
    // leaveSession
    // -----------------------------------------------------------------------

    pub async fn leave_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<LeaveOutcome, MembershipError> {
        let mut outbox = Outbox::new();
        let result = {
            let _guard = self.locks.acquire(session_id).await;
            self.leave_locked(user_id, session_id, &mut outbox).await
        };
        self.flush(outbox);
        result
    }

    async fn leave_locked(
        &self,
        user_id: &str,
        session_id: &str,
        outbox: &mut Outbox,
    ) -> Result<LeaveOutcome, MembershipError> {
        let mut session = self.load_session(session_id).await?;
        let user = self.load_user(user_id).await?;
        let pointer = user
            .active_in(session_id)
            .cloned()
            .ok_or(MembershipError::InvalidState(StateReason::NotAParticipant))?;

        // An interrupted end cascade can leave pointers behind.
        if session.status == SessionStatus::Ended {
            self.store.release_active_session(user_id, session_id).await?;
            return Ok(LeaveOutcome {
                session_id: session_id.to_string(),
                role: pointer.role,
                session_ended: true,
            });
        }

        let left = Notification::to_session(
            session_id,
            EventName::USER_LEFT_SESSION,
            UserLeftSession {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                role: pointer.role,
            },
        );

        if session.is_host(user_id) {
            return match self.policy.host_leave {
                HostLeave::Forbid => Err(MembershipError::InvalidState(StateReason::HostCannotLeave)),
                HostLeave::EndSession => {
                    let mut ended = Outbox::new();
                    self.end_locked(&mut session, &mut ended).await?;
                    tracing::info!(session_id, user_id, "host left, session ended");
                    outbox.push(left);
                    outbox.extend(ended);
                    Ok(LeaveOutcome {
                        session_id: session_id.to_string(),
                        role: SessionRole::Host,
                        session_ended: true,
                    })
                }
            };
        }

        if !self
            .store
            .swap_active_session(user_id, Some(&pointer), None)
            .await?
        {
            return Err(MembershipError::ConcurrentModification);
        }
        if session.remove_member(user_id) {
            if let Err(e) = self.commit_session(&mut session).await {
                self.restore_pointer(user_id, None, Some(&pointer)).await;
                return Err(e);
            }
        }

        tracing::info!(session_id, user_id, role = %pointer.role, "user left session");
        outbox.push(left);

        Ok(LeaveOutcome {
            session_id: session_id.to_string(),
            role: pointer.role,
            session_ended: false,
        })
    }

    // -----------------------------------------------------------------------
    // startSession / endSession
    // -----------------------------------------------------------------------

    pub async fn start_session(
        &self,
        host_id: &str,
        session_id: &str,
    ) -> Result<Session, MembershipError> {
        let mut outbox = Outbox::new();
        let result = {
            let _guard = self.locks.acquire(session_id).await;
            self.start_locked(host_id, session_id, &mut outbox).await
        };
        self.flush(outbox);
        result
    }

    async fn start_locked(
        &self,
        host_id: &str,
        session_id: &str,
        outbox: &mut Outbox,
    ) -> Result<Session, MembershipError> {
        let mut session = self.load_session(session_id).await?;
        if !session.is_host(host_id) {
            return Err(MembershipError::Forbidden(ForbiddenReason::NotHost));
        }

        match lifecycle::transition(session.status, LifecycleEvent::HostStart) {
            Err(_) => Err(MembershipError::InvalidState(StateReason::SessionEnded)),
            Ok(Transition::Unchanged) => Ok(session),
            Ok(Transition::To(status)) => {
                let now = Utc::now();
                session.status = status;
                session.started_at = Some(now);
                self.commit_session(&mut session).await?;

                tracing::info!(session_id, "session started");
                outbox.push(Notification::to_session(
                    session_id,
                    EventName::SESSION_STATUS_UPDATED,
                    SessionStatusUpdated {
                        session_id: session_id.to_string(),
                        status,
                        at: now,
                    },
                ));
                Ok(session)
            }
        }
    }

    pub async fn end_session(
        &self,
        host_id: &str,
        session_id: &str,
    ) -> Result<Session, MembershipError> {
        let mut outbox = Outbox::new();
        let result = {
            let _guard = self.locks.acquire(session_id).await;
            self.end_checked(host_id, session_id, &mut outbox).await
        };
        self.flush(outbox);
        result
    }

    async fn end_checked(
        &self,
        host_id: &str,
        session_id: &str,
        outbox: &mut Outbox,
    ) -> Result<Session, MembershipError> {
        let mut session = self.load_session(session_id).await?;
        if !session.is_host(host_id) {
            return Err(MembershipError::Forbidden(ForbiddenReason::NotHost));
        }
        self.end_locked(&mut session, outbox).await?;
        Ok(session)
    }

    /// Mark ended, then release every member's pointer. On an already-ended
    /// session the release sweep still runs before the error is returned.
    async fn end_locked(
        &self,
        session: &mut Session,
        outbox: &mut Outbox,
    ) -> Result<(), MembershipError> {
        match lifecycle::transition(session.status, LifecycleEvent::HostEnd) {
            Err(_) => {
                self.release_members(session).await;
                Err(MembershipError::InvalidState(StateReason::SessionAlreadyEnded))
            }
            Ok(Transition::Unchanged) => Ok(()),
            Ok(Transition::To(status)) => {
                let now = Utc::now();
                session.status = status;
                session.ended_at = Some(now);
                self.commit_session(session).await?;

                let released = self.release_members(session).await;
                tracing::info!(session_id = %session.id, released, "session ended");

                outbox.push(Notification::to_session(
                    &session.id,
                    EventName::SESSION_STATUS_UPDATED,
                    SessionStatusUpdated {
                        session_id: session.id.clone(),
                        status,
                        at: now,
                    },
                ));
                Ok(())
            }
        }
    }

    /// Clear the pointer of every member still pointing at this session.
    /// Failures are logged; the sweep is safe to re-run.
    async fn release_members(&self, session: &Session) -> usize {
        let members: BTreeSet<&str> = session
            .member_ids()
            .chain(std::iter::once(session.host_id.as_str()))
            .collect();

        let mut released = 0;
        for user_id in members {
            match self
                .store
                .release_active_session(user_id, &session.id)
                .await
            {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session.id, user_id, error = %e, "failed to release member")
                }
            }
        }
        released
    }

    // -----------------------------------------------------------------------
    // markReady (readiness task)
    // -----------------------------------------------------------------------

    /// `scheduled → ready` once `scheduled_start_at <= now`. Returns whether
    /// the session moved.
    pub async fn mark_ready(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, MembershipError> {
        let mut outbox = Outbox::new();
        let result = {
            let _guard = self.locks.acquire(session_id).await;
            self.mark_ready_locked(session_id, now, &mut outbox).await
        };
        self.flush(outbox);
        result
    }

    async fn mark_ready_locked(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<bool, MembershipError> {
        let mut session = self.load_session(session_id).await?;
        if session.scheduled_start_at.is_none_or(|at| at > now) {
            return Ok(false);
        }

        match lifecycle::transition(session.status, LifecycleEvent::SchedulerTick) {
            Ok(Transition::To(status)) => {
                session.status = status;
                self.commit_session(&mut session).await?;

                tracing::info!(session_id, "session ready");
                outbox.push(Notification::to_session(
                    session_id,
                    EventName::SESSION_STATUS_UPDATED,
                    SessionStatusUpdated {
                        session_id: session_id.to_string(),
                        status,
                        at: now,
                    },
                ));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Promote every due scheduled session. Returns how many moved.
    pub async fn promote_due_sessions(&self, now: DateTime<Utc>) -> Result<usize, MembershipError> {
        let due = self.store.list_due_sessions(now).await?;
        let mut promoted = 0;
        for session in due {
            match self.mark_ready(&session.id, now).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "failed to mark session ready")
                }
            }
        }
        Ok(promoted)
    }

    // -----------------------------------------------------------------------
    // updateSession
    // -----------------------------------------------------------------------

    pub async fn update_session(
        &self,
        host_id: &str,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<Session, MembershipError> {
        let mut outbox = Outbox::new();
        let result = {
            let _guard = self.locks.acquire(session_id).await;
            self.update_locked(host_id, session_id, patch, &mut outbox)
                .await
        };
        self.flush(outbox);
        result
    }

    async fn update_locked(
        &self,
        host_id: &str,
        session_id: &str,
        patch: SessionPatch,
        outbox: &mut Outbox,
    ) -> Result<Session, MembershipError> {
        let mut session = self.load_session(session_id).await?;
        if !session.is_host(host_id) {
            return Err(MembershipError::Forbidden(ForbiddenReason::NotHost));
        }
        if !lifecycle::accepts_membership_changes(session.status) {
            return Err(MembershipError::conflict(ConflictReason::SessionEnded));
        }

        let is_paid = patch.is_paid.unwrap_or(session.is_paid);
        let price = patch
            .price
            .or_else(|| session.is_paid.then_some(session.price));
        let description = match &patch.description {
            Some(d) => Some(d.as_str()),
            None => session.description.as_deref(),
        };
        let settings = validate_settings(
            patch.title.as_deref().unwrap_or(&session.title),
            description,
            is_paid,
            price,
            patch.max_participants.unwrap_or(session.max_participants),
        )?;

        let mut draft = session.clone();
        draft.max_participants = settings.max_participants;
        if draft.performer_count() > self.policy.performer_slots(&draft) {
            return Err(MembershipError::conflict(
                ConflictReason::MaxParticipantsBelowCurrent,
            ));
        }

        session.title = settings.title;
        session.description = settings.description;
        session.is_paid = settings.is_paid;
        session.price = settings.price;
        session.max_participants = settings.max_participants;
        if let Some(archive) = patch.is_archive_enabled {
            session.is_archive_enabled = archive;
        }
        if let Some(at) = patch.scheduled_start_at {
            session.scheduled_start_at = Some(at);
        }
        self.commit_session(&mut session).await?;

        tracing::info!(session_id, "session updated");
        outbox.push(Notification::to_session(
            session_id,
            EventName::SESSION_UPDATED,
            SessionUpdated {
                session_id: session_id.to_string(),
                title: session.title.clone(),
                description: session.description.clone(),
                is_paid: session.is_paid,
                price: session.price,
                max_participants: session.max_participants,
                is_archive_enabled: session.is_archive_enabled,
                scheduled_start_at: session.scheduled_start_at,
            },
        ));

        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Pending applications, oldest first. Host only.
    pub async fn list_pending_applications(
        &self,
        host_id: &str,
        session_id: &str,
    ) -> Result<Vec<Application>, MembershipError> {
        let session = self.load_session(session_id).await?;
        if !session.is_host(host_id) {
            return Err(MembershipError::Forbidden(ForbiddenReason::NotHost));
        }
        Ok(self
            .store
            .list_applications(session_id, Some(ApplicationStatus::Pending))
            .await?)
    }

    pub async fn user_access(
        &self,
        session: &Session,
        user_id: Option<&str>,
    ) -> Result<UserAccess, MembershipError> {
        let Some(user_id) = user_id else {
            return Ok(UserAccess::default());
        };
        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(UserAccess::default());
        };

        let open = lifecycle::accepts_membership_changes(session.status);
        let is_host = session.is_host(user_id);
        let is_participant = session.participant(user_id).is_some();
        let here = user.active_in(&session.id);
        let application_status = self
            .store
            .find_application(&session.id, user_id)
            .await?
            .map(|a| a.status);

        let user_role = here.map(|p| p.role).or_else(|| {
            session
                .participant(user_id)
                .or_else(|| session.viewer(user_id))
                .map(|m| m.role)
        });

        Ok(UserAccess {
            is_host,
            is_participant,
            can_join: open && (user.active_session.is_none() || here.is_some()),
            can_apply: open
                && !is_host
                && !is_participant
                && user.active_session.is_none()
                && self.policy.has_performer_slot(session)
                && application_status != Some(ApplicationStatus::Pending),
            application_status,
            user_role,
        })
    }
}
