use thiserror::Error;

use crate::error::FieldError;
use crate::store::StoreError;

/// Missing-resource reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    Session,
    User,
    Application,
}

impl NotFoundReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Session => "SESSION_NOT_FOUND",
            Self::User => "USER_NOT_FOUND",
            Self::Application => "APPLICATION_NOT_FOUND",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Session => "Session not found",
            Self::User => "User not found",
            Self::Application => "Application not found",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenReason {
    NotHost,
}

impl ForbiddenReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::NotHost => "NOT_HOST",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::NotHost => "Only the session host can do this",
        }
    }
}

/// The request is well-formed but the current state does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateReason {
    SessionEnded,
    SessionAlreadyEnded,
    ApplicationAlreadyResponded,
    NotAParticipant,
    HostCannotLeave,
}

impl StateReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::SessionEnded => "SESSION_ENDED",
            Self::SessionAlreadyEnded => "SESSION_ALREADY_ENDED",
            Self::ApplicationAlreadyResponded => "APPLICATION_ALREADY_RESPONDED",
            Self::NotAParticipant => "NOT_A_PARTICIPANT",
            Self::HostCannotLeave => "HOST_CANNOT_LEAVE",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::SessionEnded => "Session has ended",
            Self::SessionAlreadyEnded => "Session has already ended",
            Self::ApplicationAlreadyResponded => "Application has already been responded to",
            Self::NotAParticipant => "You are not in this session",
            Self::HostCannotLeave => "The host cannot leave; end the session instead",
        }
    }
}

/// Violations of the one-user-one-role-one-session invariant and of
/// session capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    AlreadyInAnotherSession,
    AlreadyInSameSessionDifferentRole,
    AlreadyParticipant,
    SessionEnded,
    RoomFullForPerformers,
    ApplicationAlreadyPending,
    ApplicationRequired,
    MaxParticipantsBelowCurrent,
}

impl ConflictReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::AlreadyInAnotherSession => "ALREADY_IN_ANOTHER_SESSION",
            Self::AlreadyInSameSessionDifferentRole => "ALREADY_IN_SAME_SESSION_DIFFERENT_ROLE",
            Self::AlreadyParticipant => "ALREADY_PARTICIPANT",
            Self::SessionEnded => "SESSION_ENDED",
            Self::RoomFullForPerformers => "ROOM_FULL_FOR_PERFORMERS",
            Self::ApplicationAlreadyPending => "APPLICATION_ALREADY_PENDING",
            Self::ApplicationRequired => "APPLICATION_REQUIRED",
            Self::MaxParticipantsBelowCurrent => "MAX_PARTICIPANTS_BELOW_CURRENT",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::AlreadyInAnotherSession => "You are already in another session",
            Self::AlreadyInSameSessionDifferentRole => {
                "You are already in this session with a different role"
            }
            Self::AlreadyParticipant => "You are already a participant of this session",
            Self::SessionEnded => "Session has ended",
            Self::RoomFullForPerformers => "No performer slots are left in this session",
            Self::ApplicationAlreadyPending => "You already have a pending application",
            Self::ApplicationRequired => "Joining as a performer requires an approved application",
            Self::MaxParticipantsBelowCurrent => {
                "max_participants cannot be lower than the current participant count"
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("{}", .0.message())]
    NotFound(NotFoundReason),

    #[error("{}", .0.message())]
    Forbidden(ForbiddenReason),

    #[error("{}", .0.message())]
    InvalidState(StateReason),

    /// `auto_rejected` is set when an approval failed its commit-time
    /// re-check and the application was rejected instead.
    #[error("{}", .reason.message())]
    Conflict {
        reason: ConflictReason,
        auto_rejected: bool,
    },

    #[error("session was modified concurrently")]
    ConcurrentModification,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MembershipError {
    pub fn conflict(reason: ConflictReason) -> Self {
        Self::Conflict {
            reason,
            auto_rejected: false,
        }
    }

    /// Machine-readable code carried in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(r) => r.as_code(),
            Self::Forbidden(r) => r.as_code(),
            Self::InvalidState(r) => r.as_code(),
            Self::Conflict { reason, .. } => reason.as_code(),
            Self::ConcurrentModification => "CONCURRENT_MODIFICATION",
            Self::Store(_) => "INTERNAL_ERROR",
        }
    }
}
