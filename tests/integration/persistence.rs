//! Restart behavior of the on-disk task table and message log.

use std::fs;

use tokio_test::{assert_err, assert_ok};

use hive::bus::{MessageFilter, MessageType};
use hive::core::{TaskDescriptor, TaskStatus};
use hive::orchestration::Outcome;
use hive::ErrorKind;

use crate::fixtures::{claim, enqueue_diamond, id, message_types, scanner, StateDir};

/// Scenario: restart mid-run
/// Given the diamond with A completed and B claimed
/// When the process restarts
/// Then statuses, dependencies and message sequence numbers carry over
#[tokio::test]
async fn test_restart_preserves_tasks_and_messages() {
    let dir = StateDir::new();
    {
        let s = assert_ok!(dir.open());
        enqueue_diamond(&s).await;
        assert_eq!(claim(&s, &scanner()).await.as_deref(), Some("A"));
        assert_ok!(s.report(&id("A"), Outcome::Completed, Some("scans/a.json".into())).await);
        assert_eq!(claim(&s, &scanner()).await.as_deref(), Some("B"));
        assert_eq!(assert_ok!(s.bus().last_seq()), 7);
    }

    let s = assert_ok!(dir.open());
    let a = assert_ok!(s.get(&id("A")).await);
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.artifact_ref.as_deref(), Some("scans/a.json"));
    let b = assert_ok!(s.get(&id("B")).await);
    assert_eq!(b.status, TaskStatus::InProgress);
    assert_eq!(b.attempts, 1);
    let d = assert_ok!(s.get(&id("D")).await);
    assert_eq!(d.depends_on.iter().map(|t| t.as_str()).collect::<Vec<_>>(), vec!["B", "C"]);

    let waves = assert_ok!(s.waves().await);
    assert_eq!(waves.wave_of(&id("D")), Some(3));

    // The log continues from where it left off.
    assert_eq!(assert_ok!(s.bus().last_seq()), 7);
    assert_eq!(claim(&s, &scanner()).await.as_deref(), Some("C"));
    let after: Vec<_> = s
        .bus()
        .query_after(MessageFilter::all(), 7)
        .collect::<hive::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].seq, 8);
    assert_eq!(after[0].kind, MessageType::TaskClaimed);
    assert_eq!(after[0].task_id, Some(id("C")));
}

/// A task stranded in progress by a crash can be cancelled and retried.
#[tokio::test]
async fn test_stranded_task_recovered_after_restart() {
    let dir = StateDir::new();
    {
        let s = assert_ok!(dir.open());
        assert_ok!(s.enqueue(TaskDescriptor::new("SCAN-1").with_id("S1")).await);
        assert_eq!(claim(&s, &scanner()).await.as_deref(), Some("S1"));
    }

    let s = assert_ok!(dir.open());
    assert_eq!(claim(&s, &scanner()).await, None);
    assert_ok!(s.cancel(&id("S1"), "worker lost").await);
    let task = assert_ok!(s.retry(&id("S1")).await);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(claim(&s, &scanner()).await.as_deref(), Some("S1"));
    assert_ok!(s.report(&id("S1"), Outcome::Completed, None).await);

    let types = message_types(&s);
    assert_eq!(types.first(), Some(&MessageType::TaskCreated));
    assert_eq!(types.last(), Some(&MessageType::ScanComplete));
}

#[tokio::test]
async fn test_on_disk_files_are_readable() {
    let dir = StateDir::new();
    let s = assert_ok!(dir.open());
    enqueue_diamond(&s).await;

    let table: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.tasks_path()).unwrap()).unwrap();
    assert_eq!(table["version"], 1);
    assert_eq!(table["tasks"]["B"]["depends_on"], serde_json::json!(["A"]));
    assert_eq!(table["tasks"]["A"]["status"], "pending");

    let lines: Vec<serde_json::Value> = fs::read_to_string(dir.messages_path())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0]["seq"], 1);
    assert_eq!(lines[0]["type"], "task_created");
    assert_eq!(lines[3]["team"], "test");
}

#[tokio::test]
async fn test_corrupt_task_table_refuses_to_open() {
    let dir = StateDir::new();
    fs::write(dir.tasks_path(), "{ not json").unwrap();
    let err = assert_err!(dir.open());
    assert!(matches!(err, hive::Error::Json(_)));
}

#[tokio::test]
async fn test_rejected_cycle_leaves_file_untouched() {
    let dir = StateDir::new();
    let s = assert_ok!(dir.open());
    assert_ok!(s.enqueue(TaskDescriptor::new("SCAN-a").with_id("a").depends_on(&["b"])).await);
    let before = fs::read_to_string(dir.tasks_path()).unwrap();

    let err = assert_err!(
        s.enqueue(TaskDescriptor::new("SCAN-b").with_id("b").depends_on(&["a"]))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::CycleDetected);
    assert_eq!(fs::read_to_string(dir.tasks_path()).unwrap(), before);

    let reopened = assert_ok!(dir.open());
    assert_eq!(assert_ok!(reopened.status_summary().await).total, 1);
}

/// Two schedulers over one state directory behave like two `hive`
/// processes: claims, new tasks and message numbers are shared.
#[tokio::test]
async fn test_schedulers_on_same_files_share_state() {
    let dir = StateDir::new();
    let first = assert_ok!(dir.open());
    let second = assert_ok!(dir.open());

    assert_ok!(first.enqueue(TaskDescriptor::new("SCAN-1").with_id("S1")).await);
    assert_eq!(claim(&second, &scanner()).await.as_deref(), Some("S1"));
    assert_eq!(claim(&first, &scanner()).await, None);

    // A task created by one side survives the other's writes.
    assert_ok!(second.enqueue(TaskDescriptor::new("SCAN-2").with_id("S2")).await);
    assert_ok!(first.report(&id("S1"), Outcome::Completed, None).await);
    assert_eq!(claim(&first, &scanner()).await.as_deref(), Some("S2"));

    let reopened = assert_ok!(dir.open());
    let summary = assert_ok!(reopened.status_summary().await);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.in_progress, 1);

    let seqs: Vec<u64> = reopened
        .subscribe(MessageFilter::all())
        .map(|m| m.unwrap().seq)
        .collect();
    assert_eq!(seqs, (1..=5).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_cross_scheduler_cycle_rejected() {
    let dir = StateDir::new();
    let first = assert_ok!(dir.open());
    let second = assert_ok!(dir.open());

    assert_ok!(first.enqueue(TaskDescriptor::new("SCAN-x").with_id("X").depends_on(&["Y"])).await);
    let err = assert_err!(
        second
            .enqueue(TaskDescriptor::new("SCAN-y").with_id("Y").depends_on(&["X"]))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::CycleDetected);
    assert_ok!(first.waves().await);
}
