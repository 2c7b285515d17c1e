//! Role worker loop.
//!
//! A worker polls the scheduler for its role, runs the opaque work
//! function on whatever it claims and reports the result. It never waits
//! on another worker: an empty poll sleeps for the idle interval and tries
//! again.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::task::{Role, Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::scheduler::{ClaimOutcome, Outcome, ReportOutcome, Scheduler};
use crate::util::blocking;
use crate::{hlog, hlog_debug, hlog_error, hlog_warn};

/// What the work function produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkResult {
    Completed { artifact_ref: Option<String> },
    Failed { error: String },
}

/// The opaque work a role performs on a claimed task.
///
/// Runs on the blocking pool, so implementations may do synchronous I/O.
pub trait WorkFunction: Send + Sync + 'static {
    fn run(&self, task: &Task) -> WorkResult;
}

impl<F> WorkFunction for F
where
    F: Fn(&Task) -> WorkResult + Send + Sync + 'static,
{
    fn run(&self, task: &Task) -> WorkResult {
        self(task)
    }
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Idle,
    Completed(TaskId),
    RetryScheduled(TaskId),
    Failed(TaskId),
    /// The task changed under the worker (e.g. cancelled) and the result
    /// was dropped.
    Discarded(TaskId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub polls: u64,
    pub completed: u64,
    pub failed: u64,
    pub discarded: u64,
    pub errors: u64,
}

pub struct Worker {
    role: Role,
    scheduler: Arc<Scheduler>,
    work: Arc<dyn WorkFunction>,
    idle_poll: Duration,
}

impl Worker {
    pub fn new(role: Role, scheduler: Arc<Scheduler>, work: Arc<dyn WorkFunction>) -> Self {
        Self {
            role,
            scheduler,
            work,
            idle_poll: Duration::from_millis(500),
        }
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Claim, execute and report at most one task.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let task = match self.scheduler.claim(&self.role).await? {
            ClaimOutcome::Claimed(task) => task,
            ClaimOutcome::Idle => return Ok(PollOutcome::Idle),
        };
        let id = task.id.clone();

        let work = Arc::clone(&self.work);
        let result = blocking(move || Ok(work.run(&task))).await?;

        let (outcome, artifact_ref) = match result {
            WorkResult::Completed { artifact_ref } => (Outcome::Completed, artifact_ref),
            WorkResult::Failed { error } => (Outcome::Failed { error }, None),
        };

        match self.scheduler.report(&id, outcome, artifact_ref).await {
            Ok(ReportOutcome::Completed(_)) => Ok(PollOutcome::Completed(id)),
            Ok(ReportOutcome::RetryScheduled { .. }) => Ok(PollOutcome::RetryScheduled(id)),
            Ok(ReportOutcome::Failed(_)) => Ok(PollOutcome::Failed(id)),
            Err(Error::InvalidTransition { from, .. }) => {
                hlog_warn!("{}: result for {} discarded, task is {}", self.role, id, from);
                Ok(PollOutcome::Discarded(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until `cancel` fires. Errors are logged and followed by an
    /// idle wait; they never end the loop.
    ///
    /// Cancellation is only observed between polls and during the idle
    /// wait. A task already claimed is always run and reported, so stopping
    /// a worker never strands a task in progress.
    pub async fn run(&self, cancel: CancellationToken) -> WorkerStats {
        hlog!("worker {} started", self.role);
        let mut stats = WorkerStats::default();

        while !cancel.is_cancelled() {
            stats.polls += 1;
            let outcome = self.poll_once().await;

            let idle = match outcome {
                Ok(PollOutcome::Idle) => true,
                Ok(PollOutcome::Completed(_)) => {
                    stats.completed += 1;
                    false
                }
                Ok(PollOutcome::RetryScheduled(_)) | Ok(PollOutcome::Failed(_)) => {
                    stats.failed += 1;
                    false
                }
                Ok(PollOutcome::Discarded(_)) => {
                    stats.discarded += 1;
                    false
                }
                Err(e) => {
                    stats.errors += 1;
                    hlog_error!("worker {} poll failed: {}", self.role, e);
                    true
                }
            };

            if idle {
                hlog_debug!("worker {} idle", self.role);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_poll) => {}
                }
            }
        }

        hlog!(
            "worker {} stopped: completed={} failed={} discarded={} errors={}",
            self.role,
            stats.completed,
            stats.failed,
            stats.discarded,
            stats.errors
        );
        stats
    }
}
