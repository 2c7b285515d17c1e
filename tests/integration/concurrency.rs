//! Claim races, cancellation and concurrent workers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use hive::bus::MessageType;
use hive::core::{Task, TaskDescriptor, TaskStatus, TaskStore};
use hive::orchestration::{ClaimOutcome, Outcome, PollOutcome, WorkResult, Worker};
use hive::Error;

use crate::fixtures::{claim, id, memory_scheduler, message_types, scanner};

/// Two concurrent claims for one ready task: exactly one wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_single_winner() {
    for round in 0..20 {
        let s = memory_scheduler();
        let task_id = format!("SCAN-{}", round);
        assert_ok!(s.enqueue(TaskDescriptor::new(&task_id).with_id(&task_id)).await);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                tokio::spawn(async move { s.claim(&scanner()).await })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            match assert_ok!(h.await.unwrap()) {
                ClaimOutcome::Claimed(task) => {
                    assert_eq!(task.id.as_str(), task_id);
                    winners += 1;
                }
                ClaimOutcome::Idle => {}
            }
        }
        assert_eq!(winners, 1, "round {}: expected one winner", round);
    }
}

/// Many tasks, many claimers: every task is handed out exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_partition_tasks() {
    let s = memory_scheduler();
    for i in 0..24 {
        let task_id = format!("SCAN-{:02}", i);
        assert_ok!(s.enqueue(TaskDescriptor::new(&task_id).with_id(&task_id)).await);
    }

    let claimed = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let s = Arc::clone(&s);
            let claimed = Arc::clone(&claimed);
            tokio::spawn(async move {
                while let ClaimOutcome::Claimed(task) = s.claim(&scanner()).await.unwrap() {
                    claimed.lock().unwrap().push(task.id.to_string());
                }
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    let claimed = claimed.lock().unwrap();
    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(claimed.len(), 24);
    assert_eq!(unique.len(), 24);
}

/// A task cancelled while in progress refuses the owner's completion.
#[tokio::test]
async fn test_cancel_in_progress_rejects_completion() {
    let s = memory_scheduler();
    assert_ok!(s.enqueue(TaskDescriptor::new("SCAN-1").with_id("S1")).await);
    assert_eq!(claim(&s, &scanner()).await.as_deref(), Some("S1"));

    let task = assert_ok!(s.cancel(&id("S1"), "scope changed").await);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_error.as_deref(), Some("cancelled: scope changed"));

    let err = assert_err!(s.report(&id("S1"), Outcome::Completed, None).await);
    assert!(matches!(err, Error::InvalidTransition { .. }));

    // Cancellation is final: no retry is scheduled.
    assert_eq!(claim(&s, &scanner()).await, None);
    let types = message_types(&s);
    assert!(types.contains(&MessageType::TaskCancelled));
    assert!(!types.contains(&MessageType::RetryScheduled));
}

/// A worker whose task is cancelled mid-run discards its result.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_discards_result_of_cancelled_task() {
    let s = memory_scheduler();
    assert_ok!(s.enqueue(TaskDescriptor::new("SCAN-1").with_id("S1")).await);

    let canceller = Arc::clone(&s);
    let work = move |task: &Task| {
        let id = task.id.clone();
        tokio::runtime::Handle::current()
            .block_on(canceller.cancel(&id, "operator"))
            .unwrap();
        WorkResult::Completed {
            artifact_ref: Some("out/s1".into()),
        }
    };
    let worker = Worker::new(scanner(), Arc::clone(&s), Arc::new(work));

    assert_eq!(
        assert_ok!(worker.poll_once().await),
        PollOutcome::Discarded(id("S1"))
    );
    let task = assert_ok!(s.get(&id("S1")).await);
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.artifact_ref.is_none());
}

/// A pool of workers drains a layered graph and honors every dependency.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_drains_graph_in_dependency_order() {
    let s = memory_scheduler();
    // Three layers: 4 roots, 4 middles each on two roots, 1 sink on all middles.
    for i in 0..4 {
        let tid = format!("r{}", i);
        assert_ok!(s.enqueue(TaskDescriptor::new(&format!("SCAN-{}", tid)).with_id(&tid)).await);
    }
    for i in 0..4 {
        let tid = format!("m{}", i);
        let a = format!("r{}", i);
        let b = format!("r{}", (i + 1) % 4);
        assert_ok!(
            s.enqueue(
                TaskDescriptor::new(&format!("SCAN-{}", tid))
                    .with_id(&tid)
                    .depends_on(&[&a, &b])
            )
            .await
        );
    }
    assert_ok!(
        s.enqueue(
            TaskDescriptor::new("SCAN-sink")
                .with_id("sink")
                .depends_on(&["m0", "m1", "m2", "m3"])
        )
        .await
    );

    let finished: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let log = Arc::clone(&finished);
        let store = Arc::clone(s.store());
        let work = move |task: &Task| {
            for dep in &task.depends_on {
                let status = store.get(dep).map(|t| t.status);
                assert_eq!(status.ok(), Some(TaskStatus::Completed), "{} ran early", task.id);
            }
            log.lock().unwrap().push(task.id.to_string());
            WorkResult::Completed { artifact_ref: None }
        };
        let worker = Worker::new(scanner(), Arc::clone(&s), Arc::new(work))
            .with_idle_poll(Duration::from_millis(5));
        let token = cancel.clone();
        handles.push(tokio::spawn(async move { worker.run(token).await }));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !assert_ok!(s.status_summary().await).all_finished() {
        assert!(tokio::time::Instant::now() < deadline, "workers did not drain the graph");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();

    let mut completed = 0;
    for h in handles {
        let stats = h.await.unwrap();
        assert_eq!(stats.errors, 0);
        completed += stats.completed;
    }
    assert_eq!(completed, 9);

    let order = finished.lock().unwrap();
    assert_eq!(order.len(), 9);
    assert_eq!(order.last().map(String::as_str), Some("sink"));
}
