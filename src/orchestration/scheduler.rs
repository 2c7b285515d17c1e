//! Scheduler: the interface role workers and producers talk to.
//!
//! The scheduler holds no task state of its own. Every call reads or
//! mutates the injected [`TaskStore`] and records what happened on the
//! [`MessageBus`], so any number of schedulers (one per worker process)
//! can share one store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::bus::{Message, MessageBus, MessageDraft, MessageFilter, MessageType, Query};
use crate::core::dag::{self, ValidationReport, WaveAssignment};
use crate::core::store::TaskStore;
use crate::core::task::{Role, Task, TaskDescriptor, TaskId, TaskPayload, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::retry::RetryPolicy;
use crate::util::blocking;
use crate::{hlog, hlog_debug, hlog_warn};

/// Name used as sender/recipient for messages the scheduler emits itself.
pub const COORDINATOR: &str = "coordinator";

/// Result of a claim poll.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Task),
    /// Nothing ready for the role right now. Not an error.
    Idle,
}

/// What a worker reports back for a claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Completed(Task),
    /// The failure was recorded and the task is pending again, held back
    /// until `delay` has passed.
    RetryScheduled {
        task: Task,
        attempt: u32,
        delay: Duration,
    },
    /// The failure is final.
    Failed(Task),
}

impl ReportOutcome {
    pub fn task(&self) -> &Task {
        match self {
            ReportOutcome::Completed(task)
            | ReportOutcome::RetryScheduled { task, .. }
            | ReportOutcome::Failed(task) => task,
        }
    }
}

/// Task counts by status. `waiting` counts pending tasks whose
/// dependencies are not all completed yet and is included in `pending`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub pending: usize,
    pub waiting: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub waves: u32,
}

impl StatusSummary {
    pub fn all_finished(&self) -> bool {
        self.pending == 0 && self.in_progress == 0 && self.blocked == 0
    }
}

/// Message type announcing completion, chosen by the task's role family.
fn completion_type(task: &Task) -> MessageType {
    match task.payload {
        TaskPayload::Plan(_) => MessageType::PlanReady,
        TaskPayload::Scan(_) => MessageType::ScanComplete,
        TaskPayload::Assess(_) => MessageType::AssessmentComplete,
        TaskPayload::Develop(_) => MessageType::ImplComplete,
        TaskPayload::Other { .. } => MessageType::TaskCompleted,
    }
}

fn sender(task: &Task) -> String {
    task.owner.clone().unwrap_or_else(|| "worker".to_string())
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    bus: MessageBus,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, bus: MessageBus) -> Self {
        Self {
            store,
            bus,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn snapshot(&self) -> Result<Vec<Task>> {
        let store = Arc::clone(&self.store);
        blocking(move || store.snapshot()).await
    }

    async fn modify<F>(&self, id: &TaskId, mut f: F) -> Result<Task>
    where
        F: FnMut(&mut Task) -> Result<()> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let id = id.clone();
        blocking(move || store.modify(&id, &mut f)).await
    }

    async fn publish(&self, draft: MessageDraft) -> Result<Message> {
        self.bus.publish(draft).await
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task> {
        let store = Arc::clone(&self.store);
        let id = id.clone();
        blocking(move || store.get(&id)).await
    }

    /// Add a task.
    ///
    /// The task set with the new task must still be acyclic; otherwise the
    /// task is rejected with `CycleDetected` and nothing is stored. The
    /// check runs inside the store's write lock, so schedulers sharing one
    /// store cannot jointly commit a cycle. References to unknown tasks are
    /// accepted with a warning.
    pub async fn enqueue(&self, desc: TaskDescriptor) -> Result<TaskId> {
        let task = desc.into_task()?;
        let id = task.id.clone();

        let store = Arc::clone(&self.store);
        let created = task.clone();
        let report = blocking(move || store.create_checked(created)).await?;
        let wave = report.waves.wave_of(&id).unwrap_or(1);

        hlog!("enqueued {} ({}) wave={}", id, task.subject, wave);
        let to = task.owner.clone().unwrap_or_else(|| "*".to_string());
        self.publish(
            MessageDraft::new(COORDINATOR, &to, MessageType::TaskCreated, task.subject.clone())
                .task(&id),
        )
        .await?;
        Ok(id)
    }

    /// Claim the first ready task for `role`.
    ///
    /// Candidates are tried in id order. A candidate another worker claimed
    /// first is skipped, so two racing claims never get the same task.
    pub async fn claim(&self, role: &Role) -> Result<ClaimOutcome> {
        let tasks = self.snapshot().await?;
        let candidates: Vec<TaskId> = dag::ready(&tasks, role, Utc::now())?
            .into_iter()
            .map(|t| t.id.clone())
            .collect();

        for id in candidates {
            let store = Arc::clone(&self.store);
            let claim_id = id.clone();
            let claimed = blocking(move || {
                store.compare_and_set(&claim_id, TaskStatus::Pending, TaskStatus::InProgress)
            })
            .await;

            match claimed {
                Ok(task) => {
                    hlog!("{} claimed {} (attempt {})", role, task.id, task.attempts);
                    self.publish(
                        MessageDraft::new(
                            &role.name,
                            COORDINATOR,
                            MessageType::TaskClaimed,
                            task.subject.clone(),
                        )
                        .task(&task.id),
                    )
                    .await?;
                    return Ok(ClaimOutcome::Claimed(task));
                }
                Err(Error::InvalidTransition { .. }) => {
                    hlog_debug!("{} lost claim race for {}", role, id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ClaimOutcome::Idle)
    }

    /// Record the outcome of a claimed task.
    ///
    /// Fails with `InvalidTransition` if the task is no longer in progress,
    /// e.g. because it was cancelled; the caller should discard its result.
    pub async fn report(
        &self,
        id: &TaskId,
        outcome: Outcome,
        artifact_ref: Option<String>,
    ) -> Result<ReportOutcome> {
        match outcome {
            Outcome::Completed => {
                let task = self
                    .modify(id, move |task| {
                        task.transition(TaskStatus::Completed)?;
                        task.artifact_ref = artifact_ref.clone();
                        task.last_error = None;
                        Ok(())
                    })
                    .await?;
                hlog!("{} completed", task.id);
                self.publish(
                    MessageDraft::new(
                        &sender(&task),
                        COORDINATOR,
                        completion_type(&task),
                        task.subject.clone(),
                    )
                    .task(&task.id)
                    .artifact(task.artifact_ref.clone()),
                )
                .await?;
                Ok(ReportOutcome::Completed(task))
            }
            Outcome::Failed { error } => self.report_failure(id, error, artifact_ref).await,
        }
    }

    async fn report_failure(
        &self,
        id: &TaskId,
        error: String,
        artifact_ref: Option<String>,
    ) -> Result<ReportOutcome> {
        let retry = self.retry.clone();
        let task = self
            .modify(id, move |task| {
                task.transition(TaskStatus::Failed)?;
                task.last_error = Some(error.clone());
                task.artifact_ref = artifact_ref.clone();
                if retry.should_retry(task.attempts) {
                    let delay = retry.next_delay(task.attempts);
                    task.transition(TaskStatus::Pending)?;
                    task.retry_at = chrono::Duration::from_std(delay)
                        .ok()
                        .map(|d| Utc::now() + d);
                }
                Ok(())
            })
            .await?;

        let reason = task.last_error.clone().unwrap_or_default();
        if task.status == TaskStatus::Pending {
            let delay = self.retry.next_delay(task.attempts);
            hlog_warn!(
                "{} failed (attempt {}/{}), retry in {:?}: {}",
                task.id,
                task.attempts,
                self.retry.max_attempts,
                delay,
                reason
            );
            self.publish(
                MessageDraft::new(
                    COORDINATOR,
                    &sender(&task),
                    MessageType::RetryScheduled,
                    format!("attempt {} failed: {}", task.attempts, reason),
                )
                .task(&task.id),
            )
            .await?;
            return Ok(ReportOutcome::RetryScheduled {
                attempt: task.attempts,
                delay,
                task,
            });
        }

        hlog_warn!("{} failed after {} attempts: {}", task.id, task.attempts, reason);
        self.publish(
            MessageDraft::new(&sender(&task), COORDINATOR, MessageType::TaskFailed, reason)
                .task(&task.id)
                .artifact(task.artifact_ref.clone()),
        )
        .await?;
        Ok(ReportOutcome::Failed(task))
    }

    /// Put a failed task back to pending, ready for immediate claim.
    pub async fn retry(&self, id: &TaskId) -> Result<Task> {
        let task = self
            .modify(id, |task| {
                if task.status != TaskStatus::Failed {
                    return Err(Error::InvalidTransition {
                        id: task.id.clone(),
                        from: task.status,
                        to: TaskStatus::Pending,
                    });
                }
                task.transition(TaskStatus::Pending)?;
                task.retry_at = None;
                Ok(())
            })
            .await?;
        hlog!("{} requeued by request", task.id);
        Ok(task)
    }

    /// Release a blocked task to pending.
    pub async fn release(&self, id: &TaskId) -> Result<Task> {
        let store = Arc::clone(&self.store);
        let id = id.clone();
        blocking(move || store.compare_and_set(&id, TaskStatus::Blocked, TaskStatus::Pending))
            .await
    }

    /// Mark an in-progress task failed without scheduling a retry.
    pub async fn cancel(&self, id: &TaskId, reason: &str) -> Result<Task> {
        let note = format!("cancelled: {}", reason);
        let task = self
            .modify(id, move |task| {
                if task.status != TaskStatus::InProgress {
                    return Err(Error::InvalidTransition {
                        id: task.id.clone(),
                        from: task.status,
                        to: TaskStatus::Failed,
                    });
                }
                task.transition(TaskStatus::Failed)?;
                task.last_error = Some(note.clone());
                Ok(())
            })
            .await?;

        hlog!("{} cancelled: {}", task.id, reason);
        self.publish(
            MessageDraft::new(
                COORDINATOR,
                &sender(&task),
                MessageType::TaskCancelled,
                reason.to_string(),
            )
            .task(&task.id),
        )
        .await?;
        Ok(task)
    }

    /// Messages matching `filter`, from the start of the log.
    pub fn subscribe(&self, filter: MessageFilter) -> Query {
        self.bus.query(filter)
    }

    pub async fn waves(&self) -> Result<WaveAssignment> {
        let tasks = self.snapshot().await?;
        dag::compute_waves(&tasks)
    }

    pub async fn validate(&self) -> Result<ValidationReport> {
        let tasks = self.snapshot().await?;
        dag::validate(&tasks)
    }

    pub async fn status_summary(&self) -> Result<StatusSummary> {
        let tasks = self.snapshot().await?;
        let graph = dag::DependencyGraph::build(&tasks)?;
        let mut summary = StatusSummary {
            total: tasks.len(),
            waves: graph.waves().map(|w| w.depth()).unwrap_or(0),
            ..Default::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => {
                    summary.pending += 1;
                    if !graph.dependencies_completed(task) {
                        summary.waiting += 1;
                    }
                }
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Blocked => summary.blocked += 1,
            }
        }
        Ok(summary)
    }
}
