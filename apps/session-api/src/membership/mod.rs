//! Session membership and lifecycle coordination.
//!
//! One user occupies at most one role in at most one session at a time.
//! [`MembershipEngine`] is the only writer of memberships, user pointers
//! and application statuses.

pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod locks;
pub mod policy;

pub use engine::{
    ApplicationAction, JoinOutcome, LeaveOutcome, MembershipEngine, NewSession, SessionPatch,
    UserAccess,
};
pub use error::MembershipError;
pub use policy::{HostLeave, MembershipPolicy};
