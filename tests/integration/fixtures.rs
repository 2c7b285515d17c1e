//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building schedulers over memory or on-disk state
//! - Predefined task sets
//! - Reading back bus traffic

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use hive::bus::{JsonlLog, MessageBus, MessageFilter, MessageType};
use hive::core::{JsonTaskStore, MemoryTaskStore, TaskDescriptor, TaskId};
use hive::orchestration::{ClaimOutcome, RetryPolicy, Scheduler};
use hive::Role;

pub fn scanner() -> Role {
    Role::new("scanner", "SCAN")
}

pub fn planner() -> Role {
    Role::new("planner", "PLAN")
}

pub fn developer() -> Role {
    Role::new("fe-developer", "DEV")
}

/// Scheduler over in-memory state with zero-delay retries.
pub fn memory_scheduler() -> Arc<Scheduler> {
    Arc::new(
        Scheduler::new(Arc::new(MemoryTaskStore::new()), MessageBus::in_memory("test"))
            .with_retry_policy(RetryPolicy::immediate(3)),
    )
}

/// On-disk state in a temporary directory, reopenable to simulate restarts.
pub struct StateDir {
    pub temp_dir: TempDir,
}

impl StateDir {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.temp_dir.path().join("tasks.json")
    }

    pub fn messages_path(&self) -> PathBuf {
        self.temp_dir.path().join("messages.jsonl")
    }

    /// Open a fresh scheduler over the files in this directory.
    pub fn open(&self) -> hive::Result<Scheduler> {
        let store = JsonTaskStore::open(self.tasks_path())?;
        let log = JsonlLog::open(self.messages_path())?;
        Ok(
            Scheduler::new(Arc::new(store), MessageBus::new(Arc::new(log), "test"))
                .with_retry_policy(RetryPolicy::immediate(3)),
        )
    }
}

impl Default for StateDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Enqueue the diamond A <- {B, C} <- D with scanner subjects.
///
/// ```text
///     A
///    / \
///   B   C
///    \ /
///     D
/// ```
pub async fn enqueue_diamond(s: &Scheduler) {
    for (id, deps) in [
        ("A", &[][..]),
        ("B", &["A"][..]),
        ("C", &["A"][..]),
        ("D", &["B", "C"][..]),
    ] {
        s.enqueue(
            TaskDescriptor::new(&format!("SCAN-{}", id))
                .with_id(id)
                .depends_on(deps),
        )
        .await
        .expect("Failed to enqueue diamond task");
    }
}

/// Claim for `role`, returning the claimed id or None when idle.
pub async fn claim(s: &Scheduler, role: &Role) -> Option<String> {
    match s.claim(role).await.expect("claim failed") {
        ClaimOutcome::Claimed(task) => Some(task.id.to_string()),
        ClaimOutcome::Idle => None,
    }
}

pub fn id(s: &str) -> TaskId {
    TaskId::from(s)
}

/// Types of every message on the bus, in log order.
pub fn message_types(s: &Scheduler) -> Vec<MessageType> {
    s.subscribe(MessageFilter::all())
        .map(|m| m.expect("query failed").kind)
        .collect()
}
