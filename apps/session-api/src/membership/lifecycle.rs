//! Session lifecycle: `scheduled → ready → live → ended`.
//!
//! Pure functions; the engine applies the result under the session lock.

use crate::models::session::SessionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `scheduled_start_at` has been reached.
    SchedulerTick,
    HostStart,
    HostEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(SessionStatus),
    /// Legal, but nothing changes.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Start on an ended session.
    Terminal,
    /// End on an ended session.
    AlreadyEnded,
}

pub fn transition(from: SessionStatus, event: LifecycleEvent) -> Result<Transition, Rejection> {
    use LifecycleEvent::*;
    use SessionStatus::*;

    match (from, event) {
        (Scheduled, SchedulerTick) => Ok(Transition::To(Ready)),
        (Ready | Live | Ended, SchedulerTick) => Ok(Transition::Unchanged),

        (Scheduled | Ready, HostStart) => Ok(Transition::To(Live)),
        (Live, HostStart) => Ok(Transition::Unchanged),
        (Ended, HostStart) => Err(Rejection::Terminal),

        (Scheduled | Ready | Live, HostEnd) => Ok(Transition::To(Ended)),
        (Ended, HostEnd) => Err(Rejection::AlreadyEnded),
    }
}

/// Join, apply, approve and settings updates are refused once ended.
pub fn accepts_membership_changes(status: SessionStatus) -> bool {
    status != SessionStatus::Ended
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::*;

    #[test]
    fn scheduler_only_moves_scheduled() {
        assert_eq!(
            transition(Scheduled, LifecycleEvent::SchedulerTick),
            Ok(Transition::To(Ready))
        );
        for s in [Ready, Live, Ended] {
            assert_eq!(
                transition(s, LifecycleEvent::SchedulerTick),
                Ok(Transition::Unchanged)
            );
        }
    }

    #[test]
    fn start_is_idempotent_when_live_and_refused_when_ended() {
        assert_eq!(
            transition(Scheduled, LifecycleEvent::HostStart),
            Ok(Transition::To(Live))
        );
        assert_eq!(transition(Ready, LifecycleEvent::HostStart), Ok(Transition::To(Live)));
        assert_eq!(transition(Live, LifecycleEvent::HostStart), Ok(Transition::Unchanged));
        assert_eq!(transition(Ended, LifecycleEvent::HostStart), Err(Rejection::Terminal));
    }

    #[test]
    fn end_is_terminal() {
        for s in [Scheduled, Ready, Live] {
            assert_eq!(transition(s, LifecycleEvent::HostEnd), Ok(Transition::To(Ended)));
        }
        assert_eq!(
            transition(Ended, LifecycleEvent::HostEnd),
            Err(Rejection::AlreadyEnded)
        );
    }

    #[test]
    fn status_never_moves_backwards() {
        let rank = |s: SessionStatus| match s {
            Scheduled => 0,
            Ready => 1,
            Live => 2,
            Ended => 3,
        };
        let events = [
            LifecycleEvent::SchedulerTick,
            LifecycleEvent::HostStart,
            LifecycleEvent::HostEnd,
        ];
        for from in [Scheduled, Ready, Live, Ended] {
            for event in events {
                if let Ok(Transition::To(to)) = transition(from, event) {
                    assert!(rank(to) > rank(from), "{from} -> {to} via {event:?}");
                }
            }
        }
    }

    #[test]
    fn only_ended_refuses_membership_changes() {
        assert!(accepts_membership_changes(Scheduled));
        assert!(accepts_membership_changes(Ready));
        assert!(accepts_membership_changes(Live));
        assert!(!accepts_membership_changes(Ended));
    }
}
