//! Wave ordering, readiness and retry scheduling.

use tokio_test::{assert_err, assert_ok};

use hive::bus::{MessageFilter, MessageType};
use hive::core::dag;
use hive::core::{Task, TaskDescriptor, TaskStatus, TaskStore};
use hive::orchestration::{Outcome, ReportOutcome};
use hive::{Error, ErrorKind};

use crate::fixtures::{
    claim, developer, enqueue_diamond, id, memory_scheduler, message_types, planner, scanner,
};

/// Scenario: diamond graph
/// Given A, B(A), C(A), D(B, C)
/// Then waves are A:1, B:2, C:2, D:3 and wave 2 comes out as [B, C]
#[tokio::test]
async fn test_diamond_waves_and_ready_order() {
    let s = memory_scheduler();
    enqueue_diamond(&s).await;

    let waves = assert_ok!(s.waves().await);
    assert_eq!(waves.wave_of(&id("A")), Some(1));
    assert_eq!(waves.wave_of(&id("B")), Some(2));
    assert_eq!(waves.wave_of(&id("C")), Some(2));
    assert_eq!(waves.wave_of(&id("D")), Some(3));

    assert_eq!(claim(&s, &scanner()).await.as_deref(), Some("A"));
    assert_ok!(s.report(&id("A"), Outcome::Completed, None).await);

    let tasks = assert_ok!(s.store().snapshot());
    let ready = assert_ok!(dag::ready(&tasks, &scanner(), chrono::Utc::now()));
    let ready_ids: Vec<&str> = ready.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ready_ids, vec!["B", "C"]);
}

/// No task in a later wave starts before its dependencies complete.
#[tokio::test]
async fn test_full_run_respects_waves() {
    let s = memory_scheduler();
    enqueue_diamond(&s).await;

    let mut order = Vec::new();
    while let Some(task) = claim(&s, &scanner()).await {
        for dep in assert_ok!(s.get(&id(&task)).await).depends_on {
            assert_eq!(assert_ok!(s.get(&dep).await).status, TaskStatus::Completed);
        }
        assert_ok!(s.report(&id(&task), Outcome::Completed, None).await);
        order.push(task);
    }

    assert_eq!(order, vec!["A", "B", "C", "D"]);
    let summary = assert_ok!(s.status_summary().await);
    assert_eq!(summary.completed, 4);
    assert!(summary.all_finished());
}

/// Scenario: self dependency
/// Given task X with depends_on = [X]
/// Then create fails with SelfDependency
#[tokio::test]
async fn test_self_dependency_rejected_everywhere() {
    let s = memory_scheduler();
    let err = assert_err!(
        s.enqueue(TaskDescriptor::new("DEV-X").with_id("X").depends_on(&["X"]))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::SelfDependency);
    assert_eq!(err.task_ids(), vec![id("X")]);

    let err = assert_err!(s
        .store()
        .create(Task::new("X", "DEV-X").with_dependencies(["X"])));
    assert!(matches!(err, Error::SelfDependency { .. }));
}

#[tokio::test]
async fn test_cycle_rejected_without_partial_state() {
    let s = memory_scheduler();
    assert_ok!(
        s.enqueue(TaskDescriptor::new("SCAN-1").with_id("one").depends_on(&["three"]))
            .await
    );
    assert_ok!(
        s.enqueue(TaskDescriptor::new("SCAN-2").with_id("two").depends_on(&["one"]))
            .await
    );
    let err = assert_err!(
        s.enqueue(TaskDescriptor::new("SCAN-3").with_id("three").depends_on(&["two"]))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::CycleDetected);
    assert_eq!(err.task_ids(), vec![id("one"), id("three"), id("two")]);

    // The earlier tasks stay, and their dangling reference is reported.
    let report = assert_ok!(s.validate().await);
    assert_eq!(report.waves.len(), 2);
    assert_eq!(report.dangling.len(), 1);
    assert_eq!(report.dangling[0].missing, id("three"));
}

#[tokio::test]
async fn test_dangling_dependency_does_not_block_independent_work() {
    let s = memory_scheduler();
    assert_ok!(
        s.enqueue(TaskDescriptor::new("SCAN-late").with_id("late").depends_on(&["later"]))
            .await
    );
    assert_ok!(s.enqueue(TaskDescriptor::new("SCAN-now").with_id("now")).await);

    assert_eq!(claim(&s, &scanner()).await.as_deref(), Some("now"));
    assert_eq!(claim(&s, &scanner()).await, None);

    // Once the missing task shows up and finishes, the waiter becomes ready.
    assert_ok!(s.enqueue(TaskDescriptor::new("SCAN-later").with_id("later")).await);
    assert_eq!(claim(&s, &scanner()).await.as_deref(), Some("later"));
    assert_ok!(s.report(&id("later"), Outcome::Completed, None).await);
    assert_eq!(claim(&s, &scanner()).await.as_deref(), Some("late"));
}

#[tokio::test]
async fn test_roles_only_see_their_prefix_and_owner() {
    let s = memory_scheduler();
    assert_ok!(s.enqueue(TaskDescriptor::new("PLAN-1").with_id("P1")).await);
    assert_ok!(
        s.enqueue(TaskDescriptor::new("DEV-1").with_id("D1").owned_by("be-developer"))
            .await
    );
    assert_ok!(s.enqueue(TaskDescriptor::new("DEV-2").with_id("D2")).await);

    assert_eq!(claim(&s, &scanner()).await, None);
    assert_eq!(claim(&s, &planner()).await.as_deref(), Some("P1"));
    assert_eq!(claim(&s, &developer()).await.as_deref(), Some("D2"));
    assert_eq!(claim(&s, &developer()).await, None);
}

#[tokio::test]
async fn test_failure_retries_until_attempts_exhausted() {
    let s = memory_scheduler();
    assert_ok!(s.enqueue(TaskDescriptor::new("SCAN-1").with_id("S1")).await);

    let mut outcomes = Vec::new();
    while claim(&s, &scanner()).await.is_some() {
        let outcome = assert_ok!(
            s.report(&id("S1"), Outcome::Failed { error: "timeout".into() }, None)
                .await
        );
        outcomes.push(outcome);
    }

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], ReportOutcome::RetryScheduled { attempt: 1, .. }));
    assert!(matches!(outcomes[1], ReportOutcome::RetryScheduled { attempt: 2, .. }));
    assert!(matches!(outcomes[2], ReportOutcome::Failed(_)));

    let task = assert_ok!(s.get(&id("S1")).await);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.last_error.as_deref(), Some("timeout"));

    let retries = s
        .subscribe(MessageFilter::all().kind(MessageType::RetryScheduled))
        .count();
    assert_eq!(retries, 2);
    assert_eq!(
        message_types(&s).last(),
        Some(&MessageType::TaskFailed)
    );
}

#[tokio::test]
async fn test_completion_messages_follow_role_family() {
    let s = memory_scheduler();
    assert_ok!(s.enqueue(TaskDescriptor::new("PLAN-1").with_id("P1")).await);
    assert_ok!(
        s.enqueue(TaskDescriptor::new("DEV-1").with_id("D1").depends_on(&["P1"]))
            .await
    );

    assert_eq!(claim(&s, &planner()).await.as_deref(), Some("P1"));
    assert_ok!(
        s.report(&id("P1"), Outcome::Completed, Some("plans/p1.md".into()))
            .await
    );
    assert_eq!(claim(&s, &developer()).await.as_deref(), Some("D1"));
    assert_ok!(s.report(&id("D1"), Outcome::Completed, None).await);

    let plan_ready: Vec<_> = s
        .subscribe(MessageFilter::all().kind(MessageType::PlanReady))
        .collect::<hive::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(plan_ready.len(), 1);
    assert_eq!(plan_ready[0].artifact_ref.as_deref(), Some("plans/p1.md"));
    assert!(message_types(&s).contains(&MessageType::ImplComplete));
}
