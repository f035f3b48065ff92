use std::str::FromStr;

use crate::models::session::Session;

/// What happens when the host leaves their own session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostLeave {
    /// Refuse; the host must end the session explicitly.
    #[default]
    Forbid,
    /// Leaving ends the session and releases every member.
    EndSession,
}

impl FromStr for HostLeave {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forbid" => Ok(Self::Forbid),
            "end_session" => Ok(Self::EndSession),
            other => Err(format!("unknown host leave policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipPolicy {
    /// Whether the host counts against `max_participants`.
    pub host_occupies_slot: bool,
    pub host_leave: HostLeave,
}

impl Default for MembershipPolicy {
    fn default() -> Self {
        Self {
            host_occupies_slot: true,
            host_leave: HostLeave::Forbid,
        }
    }
}

impl MembershipPolicy {
    /// Number of performer slots a session offers. `max_participants`
    /// bounds the whole participant list whatever the host counts as, so
    /// non-performer members already in the list always take their slot.
    pub fn performer_slots(&self, session: &Session) -> usize {
        let max = session.max_participants.max(0) as usize;
        let reserved = usize::from(self.host_occupies_slot);
        let others = session
            .participants
            .len()
            .saturating_sub(session.performer_count());
        max.saturating_sub(reserved.max(others))
    }

    pub fn has_performer_slot(&self, session: &Session) -> bool {
        session.performer_count() < self.performer_slots(session)
    }
}
