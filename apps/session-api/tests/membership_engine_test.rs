mod common;

use common::{new_session, EngineHarness};
use session_api::gateway::notifier::Audience;
use session_api::membership::{
    ApplicationAction, HostLeave, MembershipError, MembershipPolicy, SessionPatch,
};
use session_api::models::application::ApplicationStatus;
use session_api::models::session::{SessionRole, SessionStatus};
use session_api::store::SessionStore;

fn policy(host_occupies_slot: bool, host_leave: HostLeave) -> MembershipPolicy {
    MembershipPolicy {
        host_occupies_slot,
        host_leave,
    }
}

fn code<T: std::fmt::Debug>(result: Result<T, MembershipError>) -> &'static str {
    result.unwrap_err().code()
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn host_occupies_a_slot_by_default() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, session_id) = h.hosted_session(3).await;

    let p1 = h.user("p1").await;
    let p2 = h.user("p2").await;
    let p3 = h.user("p3").await;
    h.approve(&host, &session_id, &p1).await;
    h.approve(&host, &session_id, &p2).await;

    assert_eq!(
        code(h.engine.apply_as_performer(&p3, &session_id).await),
        "ROOM_FULL_FOR_PERFORMERS"
    );

    let session = h.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.participants.len(), 3);
    assert!(session.participant(&host).is_some());
}

#[tokio::test]
async fn host_outside_the_count_still_respects_max_participants() {
    let h = EngineHarness::new(policy(false, HostLeave::Forbid));
    let (host, session_id) = h.hosted_session(2).await;

    let p1 = h.user("p1").await;
    let p2 = h.user("p2").await;
    h.approve(&host, &session_id, &p1).await;

    assert_eq!(
        code(h.engine.apply_as_performer(&p2, &session_id).await),
        "ROOM_FULL_FOR_PERFORMERS"
    );

    let session = h.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.participants.len(), 2);
    assert!(session.participants.len() <= session.max_participants as usize);
}

#[tokio::test]
async fn viewers_are_not_capped() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (_host, session_id) = h.hosted_session(2).await;

    for i in 0..12 {
        let viewer = h.user(&format!("v{i}")).await;
        let outcome = h
            .engine
            .join_session(&viewer, &session_id, SessionRole::Viewer)
            .await
            .unwrap();
        assert_eq!(outcome.role, SessionRole::Viewer);
    }

    let session = h.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.viewers.len(), 12);
    assert_eq!(session.participants.len(), 1);
}

// ---------------------------------------------------------------------------
// One user, one role, one session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn joining_a_second_session_conflicts() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (_, first) = h.hosted_session(4).await;
    let (_, second) = h.hosted_session(4).await;
    let user = h.user("listener").await;

    h.engine
        .join_session(&user, &first, SessionRole::Viewer)
        .await
        .unwrap();
    assert_eq!(
        code(h.engine.join_session(&user, &second, SessionRole::Viewer).await),
        "ALREADY_IN_ANOTHER_SESSION"
    );
    assert_eq!(h.pointer(&user).await, Some((first, "viewer".to_string())));

    let second = h.store.get_session(&second).await.unwrap().unwrap();
    assert!(!second.has_member(&user));
}

#[tokio::test]
async fn hosting_blocks_creating_another_session() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, _) = h.hosted_session(4).await;

    assert_eq!(
        code(h.engine.create_session(&host, new_session(4)).await),
        "ALREADY_IN_ANOTHER_SESSION"
    );
}

#[tokio::test]
async fn join_is_idempotent() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (_, session_id) = h.hosted_session(4).await;
    let user = h.user("listener").await;

    let first = h
        .engine
        .join_session(&user, &session_id, SessionRole::Viewer)
        .await
        .unwrap();
    let second = h
        .engine
        .join_session(&user, &session_id, SessionRole::Viewer)
        .await
        .unwrap();
    assert!(first.changed);
    assert!(!second.changed);

    let session = h.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.viewers.len(), 1);

    // Only the first join is announced.
    let joined: Vec<_> = h
        .notifier
        .take_names()
        .into_iter()
        .filter(|(_, name)| *name == "user_joined_session")
        .collect();
    assert_eq!(joined.len(), 1);
}

#[tokio::test]
async fn viewer_cannot_switch_role_in_place() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (_, session_id) = h.hosted_session(4).await;
    let user = h.user("listener").await;

    h.engine
        .join_session(&user, &session_id, SessionRole::Viewer)
        .await
        .unwrap();
    assert_eq!(
        code(h.engine.apply_as_performer(&user, &session_id).await),
        "ALREADY_IN_SAME_SESSION_DIFFERENT_ROLE"
    );
}

#[tokio::test]
async fn performer_join_requires_approval() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (_, session_id) = h.hosted_session(4).await;
    let user = h.user("drummer").await;

    assert_eq!(
        code(h.engine.join_session(&user, &session_id, SessionRole::Performer).await),
        "APPLICATION_REQUIRED"
    );
    assert!(h.pointer(&user).await.is_none());
}

#[tokio::test]
async fn host_always_joins_as_host() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, session_id) = h.hosted_session(4).await;

    let outcome = h
        .engine
        .join_session(&host, &session_id, SessionRole::Viewer)
        .await
        .unwrap();
    assert_eq!(outcome.role, SessionRole::Host);
    assert!(!outcome.changed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_joins_to_two_sessions_admit_exactly_one() {
    for _ in 0..20 {
        let h = EngineHarness::new(MembershipPolicy::default());
        let (_, first) = h.hosted_session(4).await;
        let (_, second) = h.hosted_session(4).await;
        let user = h.user("racer").await;

        let a = {
            let engine = h.engine.clone();
            let (user, first) = (user.clone(), first.clone());
            tokio::spawn(async move { engine.join_session(&user, &first, SessionRole::Viewer).await })
        };
        let b = {
            let engine = h.engine.clone();
            let (user, second) = (user.clone(), second.clone());
            tokio::spawn(async move { engine.join_session(&user, &second, SessionRole::Viewer).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        let err = results.into_iter().find_map(|r| r.err()).unwrap();
        assert_eq!(err.code(), "ALREADY_IN_ANOTHER_SESSION");

        let in_first = h.store.get_session(&first).await.unwrap().unwrap().has_member(&user);
        let in_second = h.store.get_session(&second).await.unwrap().unwrap().has_member(&user);
        assert!(in_first ^ in_second);
    }
}

// ---------------------------------------------------------------------------
// Applications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approval_adds_performer_and_notifies() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, session_id) = h.hosted_session(4).await;
    let user = h.user("guitar").await;

    let application = h.engine.apply_as_performer(&user, &session_id).await.unwrap();
    assert_eq!(application.status, ApplicationStatus::Pending);
    assert_eq!(
        h.notifier.take_names(),
        vec![(Audience::User(host.clone()), "performer_application_received")]
    );

    let approved = h
        .engine
        .respond_to_application(&host, &session_id, &application.id, ApplicationAction::Approve)
        .await
        .unwrap();
    assert_eq!(approved.status, ApplicationStatus::Approved);
    assert!(approved.responded_at.is_some());
    assert_eq!(
        h.notifier.take_names(),
        vec![
            (Audience::User(user.clone()), "application_responded"),
            (Audience::Session(session_id.clone()), "session_participant_approved"),
        ]
    );

    assert_eq!(h.pointer(&user).await, Some((session_id.clone(), "performer".to_string())));
    let session = h.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.participant(&user).unwrap().role, SessionRole::Performer);

    // The approved performer's join is a no-op.
    let outcome = h
        .engine
        .join_session(&user, &session_id, SessionRole::Performer)
        .await
        .unwrap();
    assert_eq!(outcome.role, SessionRole::Performer);
    assert!(!outcome.changed);
}

#[tokio::test]
async fn second_response_is_rejected() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, session_id) = h.hosted_session(4).await;
    let user = h.user("bass").await;
    let application = h.engine.apply_as_performer(&user, &session_id).await.unwrap();

    h.engine
        .respond_to_application(&host, &session_id, &application.id, ApplicationAction::Approve)
        .await
        .unwrap();
    for action in [ApplicationAction::Approve, ApplicationAction::Reject] {
        assert_eq!(
            code(
                h.engine
                    .respond_to_application(&host, &session_id, &application.id, action)
                    .await
            ),
            "APPLICATION_ALREADY_RESPONDED"
        );
    }

    let session = h.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.performer_count(), 1);
}

#[tokio::test]
async fn rejected_applicant_can_reapply() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, session_id) = h.hosted_session(4).await;
    let user = h.user("keys").await;

    let first = h.engine.apply_as_performer(&user, &session_id).await.unwrap();
    let rejected = h
        .engine
        .respond_to_application(&host, &session_id, &first.id, ApplicationAction::Reject)
        .await
        .unwrap();
    assert_eq!(rejected.status, ApplicationStatus::Rejected);
    assert!(h.pointer(&user).await.is_none());

    let second = h.engine.apply_as_performer(&user, &session_id).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.status, ApplicationStatus::Pending);
    assert!(second.responded_at.is_none());

    let pending = h
        .engine
        .list_pending_applications(&host, &session_id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn duplicate_pending_application_conflicts() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (_, session_id) = h.hosted_session(4).await;
    let user = h.user("sax").await;

    h.engine.apply_as_performer(&user, &session_id).await.unwrap();
    assert_eq!(
        code(h.engine.apply_as_performer(&user, &session_id).await),
        "APPLICATION_ALREADY_PENDING"
    );
}

#[tokio::test]
async fn only_the_host_responds_or_lists() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (_, session_id) = h.hosted_session(4).await;
    let user = h.user("vox").await;
    let other = h.user("other").await;
    let application = h.engine.apply_as_performer(&user, &session_id).await.unwrap();

    assert_eq!(
        code(
            h.engine
                .respond_to_application(&other, &session_id, &application.id, ApplicationAction::Approve)
                .await
        ),
        "NOT_HOST"
    );
    assert_eq!(
        code(h.engine.list_pending_applications(&other, &session_id).await),
        "NOT_HOST"
    );
}

#[tokio::test]
async fn cancel_notifies_host_and_frees_reapply() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, session_id) = h.hosted_session(4).await;
    let user = h.user("cello").await;
    h.engine.apply_as_performer(&user, &session_id).await.unwrap();
    h.notifier.take();

    let canceled = h.engine.cancel_application(&user, &session_id).await.unwrap();
    assert_eq!(canceled.status, ApplicationStatus::Canceled);
    assert_eq!(
        h.notifier.take_names(),
        vec![(Audience::User(host), "performer_application_canceled")]
    );
    assert_eq!(
        code(h.engine.cancel_application(&user, &session_id).await),
        "APPLICATION_ALREADY_RESPONDED"
    );
    h.engine.apply_as_performer(&user, &session_id).await.unwrap();
}

#[tokio::test]
async fn approval_of_user_busy_elsewhere_auto_rejects() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, session_id) = h.hosted_session(4).await;
    let (_, elsewhere) = h.hosted_session(4).await;
    let user = h.user("flute").await;

    let application = h.engine.apply_as_performer(&user, &session_id).await.unwrap();
    h.engine
        .join_session(&user, &elsewhere, SessionRole::Viewer)
        .await
        .unwrap();
    h.notifier.take();

    let err = h
        .engine
        .respond_to_application(&host, &session_id, &application.id, ApplicationAction::Approve)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MembershipError::Conflict {
            auto_rejected: true,
            ..
        }
    ));
    assert_eq!(err.code(), "ALREADY_IN_ANOTHER_SESSION");

    let stored = h.store.get_application(&application.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Rejected);

    let events = h.notifier.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].audience, Audience::User(user.clone()));
    assert_eq!(events[0].data["status"], "rejected");
    assert_eq!(events[0].data["reason"], "ALREADY_IN_ANOTHER_SESSION");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_for_the_last_slot_admit_one() {
    for _ in 0..20 {
        let h = EngineHarness::new(MembershipPolicy::default());
        // Two performer slots; one is taken up front.
        let (host, session_id) = h.hosted_session(3).await;
        let first = h.user("first").await;
        h.approve(&host, &session_id, &first).await;

        let a = h.user("a").await;
        let b = h.user("b").await;
        let app_a = h.engine.apply_as_performer(&a, &session_id).await.unwrap();
        let app_b = h.engine.apply_as_performer(&b, &session_id).await.unwrap();

        let spawn_approve = |application_id: String| {
            let engine = h.engine.clone();
            let (host, session_id) = (host.clone(), session_id.clone());
            tokio::spawn(async move {
                engine
                    .respond_to_application(&host, &session_id, &application_id, ApplicationAction::Approve)
                    .await
            })
        };
        let ta = spawn_approve(app_a.id.clone());
        let tb = spawn_approve(app_b.id.clone());
        let results = [ta.await.unwrap(), tb.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.into_iter().find_map(|r| r.err()).unwrap();
        assert_eq!(err.code(), "ROOM_FULL_FOR_PERFORMERS");
        assert!(matches!(err, MembershipError::Conflict { auto_rejected: true, .. }));

        let session = h.store.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.participants.len(), 3);
        let statuses = [
            h.store.get_application(&app_a.id).await.unwrap().unwrap().status,
            h.store.get_application(&app_b.id).await.unwrap().unwrap().status,
        ];
        assert!(statuses.contains(&ApplicationStatus::Approved));
        assert!(statuses.contains(&ApplicationStatus::Rejected));
    }
}

// ---------------------------------------------------------------------------
// Leave
// ---------------------------------------------------------------------------

#[tokio::test]
async fn leave_clears_pointer_and_broadcasts() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (_, session_id) = h.hosted_session(4).await;
    let user = h.user("listener").await;
    h.engine
        .join_session(&user, &session_id, SessionRole::Viewer)
        .await
        .unwrap();
    h.notifier.take();

    let outcome = h.engine.leave_session(&user, &session_id).await.unwrap();
    assert_eq!(outcome.role, SessionRole::Viewer);
    assert!(!outcome.session_ended);
    assert!(h.pointer(&user).await.is_none());
    assert_eq!(
        h.notifier.take_names(),
        vec![(Audience::Session(session_id.clone()), "user_left_session")]
    );

    assert_eq!(
        code(h.engine.leave_session(&user, &session_id).await),
        "NOT_A_PARTICIPANT"
    );
}

#[tokio::test]
async fn host_cannot_leave_under_forbid_policy() {
    let h = EngineHarness::new(policy(true, HostLeave::Forbid));
    let (host, session_id) = h.hosted_session(4).await;

    assert_eq!(
        code(h.engine.leave_session(&host, &session_id).await),
        "HOST_CANNOT_LEAVE"
    );
    let session = h.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Scheduled);
}

#[tokio::test]
async fn host_leave_ends_session_under_end_session_policy() {
    let h = EngineHarness::new(policy(true, HostLeave::EndSession));
    let (host, session_id) = h.hosted_session(4).await;
    let performer = h.user("performer").await;
    let viewer = h.user("viewer").await;
    h.approve(&host, &session_id, &performer).await;
    h.engine
        .join_session(&viewer, &session_id, SessionRole::Viewer)
        .await
        .unwrap();
    h.notifier.take();

    let outcome = h.engine.leave_session(&host, &session_id).await.unwrap();
    assert!(outcome.session_ended);
    assert_eq!(
        h.notifier.take_names(),
        vec![
            (Audience::Session(session_id.clone()), "user_left_session"),
            (Audience::Session(session_id.clone()), "session_status_updated"),
        ]
    );

    for user in [&host, &performer, &viewer] {
        assert!(h.pointer(user).await.is_none());
    }
    let session = h.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Ended);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ending_releases_every_member() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, session_id) = h.hosted_session(4).await;
    let performer = h.user("performer").await;
    let viewer = h.user("viewer").await;
    h.approve(&host, &session_id, &performer).await;
    h.engine
        .join_session(&viewer, &session_id, SessionRole::Viewer)
        .await
        .unwrap();
    h.notifier.take();

    let ended = h.engine.end_session(&host, &session_id).await.unwrap();
    assert_eq!(ended.status, SessionStatus::Ended);
    assert!(ended.ended_at.is_some());
    assert_eq!(
        h.notifier.take_names(),
        vec![(Audience::Session(session_id.clone()), "session_status_updated")]
    );
    for user in [&host, &performer, &viewer] {
        assert!(h.pointer(user).await.is_none());
    }

    // The former performer is free to go elsewhere.
    let (_, next) = h.hosted_session(4).await;
    h.engine
        .join_session(&performer, &next, SessionRole::Viewer)
        .await
        .unwrap();

    assert_eq!(
        code(h.engine.end_session(&host, &session_id).await),
        "SESSION_ALREADY_ENDED"
    );
    // The finished session accepts nobody.
    let late = h.user("late").await;
    assert_eq!(
        code(h.engine.join_session(&late, &session_id, SessionRole::Viewer).await),
        "SESSION_ENDED"
    );
    assert_eq!(
        code(h.engine.apply_as_performer(&late, &session_id).await),
        "SESSION_ENDED"
    );
}

#[tokio::test]
async fn start_is_host_only_and_idempotent() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, session_id) = h.hosted_session(4).await;
    let other = h.user("other").await;

    assert_eq!(code(h.engine.start_session(&other, &session_id).await), "NOT_HOST");

    let live = h.engine.start_session(&host, &session_id).await.unwrap();
    assert_eq!(live.status, SessionStatus::Live);
    let started_at = live.started_at;
    assert_eq!(
        h.notifier.take_names(),
        vec![(Audience::Session(session_id.clone()), "session_status_updated")]
    );

    let again = h.engine.start_session(&host, &session_id).await.unwrap();
    assert_eq!(again.status, SessionStatus::Live);
    assert_eq!(again.started_at, started_at);
    assert!(h.notifier.take().is_empty());

    h.engine.end_session(&host, &session_id).await.unwrap();
    assert_eq!(code(h.engine.start_session(&host, &session_id).await), "SESSION_ENDED");
}

#[tokio::test]
async fn mark_ready_waits_for_scheduled_start() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let host = h.user("host").await;
    let start = chrono::Utc::now() + chrono::Duration::minutes(10);
    let session = h
        .engine
        .create_session(
            &host,
            session_api::membership::NewSession {
                scheduled_start_at: Some(start),
                ..new_session(4)
            },
        )
        .await
        .unwrap();

    assert!(!h.engine.mark_ready(&session.id, start - chrono::Duration::seconds(1)).await.unwrap());
    assert!(h.engine.mark_ready(&session.id, start).await.unwrap());
    assert!(!h.engine.mark_ready(&session.id, start).await.unwrap());

    let stored = h.store.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Ready);
    let events = h.notifier.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["status"], "ready");
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_cannot_shrink_below_current_performers() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let (host, session_id) = h.hosted_session(4).await;
    let p1 = h.user("p1").await;
    let p2 = h.user("p2").await;
    h.approve(&host, &session_id, &p1).await;
    h.approve(&host, &session_id, &p2).await;

    let shrink = SessionPatch {
        max_participants: Some(2),
        ..SessionPatch::default()
    };
    assert_eq!(
        code(h.engine.update_session(&host, &session_id, shrink).await),
        "MAX_PARTICIPANTS_BELOW_CURRENT"
    );

    h.notifier.take();
    let retitle = SessionPatch {
        title: Some("  Saturday jam ".into()),
        ..SessionPatch::default()
    };
    let updated = h.engine.update_session(&host, &session_id, retitle).await.unwrap();
    assert_eq!(updated.title, "Saturday jam");
    assert_eq!(updated.max_participants, 4);
    let events = h.notifier.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_name, "session_updated");
    assert_eq!(events[0].data["title"], "Saturday jam");
}

#[tokio::test]
async fn create_validates_settings() {
    let h = EngineHarness::new(MembershipPolicy::default());
    let host = h.user("host").await;
    let bad = session_api::membership::NewSession {
        title: " ".into(),
        is_paid: true,
        price: None,
        ..new_session(11)
    };

    let err = h.engine.create_session(&host, bad).await.unwrap_err();
    let MembershipError::Validation(fields) = err else {
        panic!("expected validation error");
    };
    let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
    assert!(names.contains(&"title"));
    assert!(names.contains(&"max_participants"));
    assert!(names.contains(&"price"));
    assert!(h.pointer(&host).await.is_none());
}
