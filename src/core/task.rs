//! Task data model for the dependency scheduler.
//!
//! Tasks are the units of work pulled by role workers. Each task tracks
//! its routing subject, owner, lifecycle status, dependencies and the
//! bookkeeping needed for retries.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{Error, Result};

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]*$").expect("task id pattern is valid")
    })
}

/// Stable identifier of a task.
///
/// Ids are caller-chosen strings (`SCAN-001`, `PLAN-2`) so that scheduling
/// order is reproducible: everything that needs a tie-break sorts by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Parse and validate a task id.
    pub fn parse(s: &str) -> Result<Self> {
        if id_pattern().is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::Validation(format!("invalid task id: {:?}", s)))
        }
    }

    /// Generate a fresh id for descriptors that do not carry one.
    pub fn generate() -> Self {
        Self(format!("task-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Task status in its lifecycle.
///
/// Allowed transitions:
/// - Pending -> InProgress (claim)
/// - InProgress -> Completed | Failed
/// - Failed -> Pending (explicit retry)
/// - Blocked -> Pending (release)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Never assigned by the store; kept so records written by other
    /// producers still load.
    Blocked,
}

impl TaskStatus {
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Pending)
                | (TaskStatus::Blocked, TaskStatus::Pending)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Opaque work payload, tagged by the role family its subject routes to.
///
/// The scheduler never looks inside `body`; only workers do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "body")]
pub enum TaskPayload {
    Plan(serde_json::Value),
    Scan(serde_json::Value),
    Assess(serde_json::Value),
    Develop(serde_json::Value),
    Other {
        prefix: String,
        body: serde_json::Value,
    },
}

impl TaskPayload {
    /// Wrap `body` in the variant matching the subject's prefix.
    pub fn for_subject(subject: &str, body: serde_json::Value) -> Self {
        let prefix = subject_prefix(subject);
        match prefix.to_ascii_uppercase().as_str() {
            "PLAN" => TaskPayload::Plan(body),
            "SCAN" => TaskPayload::Scan(body),
            "ASSESS" => TaskPayload::Assess(body),
            "DEV" | "IMPL" => TaskPayload::Develop(body),
            _ => TaskPayload::Other {
                prefix: prefix.to_string(),
                body,
            },
        }
    }

    pub fn body(&self) -> &serde_json::Value {
        match self {
            TaskPayload::Plan(body)
            | TaskPayload::Scan(body)
            | TaskPayload::Assess(body)
            | TaskPayload::Develop(body)
            | TaskPayload::Other { body, .. } => body,
        }
    }
}

impl Default for TaskPayload {
    fn default() -> Self {
        TaskPayload::Other {
            prefix: String::new(),
            body: serde_json::Value::Null,
        }
    }
}

/// Leading segment of a subject up to the first `-`.
fn subject_prefix(subject: &str) -> &str {
    subject.split('-').next().unwrap_or(subject)
}

/// A named class of worker restricted to a subject prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub prefix: String,
}

impl Role {
    pub fn new(name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}*)", self.name, self.prefix)
    }
}

/// A single task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Routing key; roles select work by subject prefix.
    pub subject: String,
    /// Role name, or None when any matching role may take it.
    pub owner: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    #[serde(default)]
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of times the task has been claimed.
    #[serde(default)]
    pub attempts: u32,
    /// Opaque pointer reported with the outcome; stored, never dereferenced.
    #[serde(default)]
    pub artifact_ref: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest time a retried task may be claimed again.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with no dependencies and an empty payload.
    pub fn new(id: impl Into<TaskId>, subject: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            subject: subject.to_string(),
            owner: None,
            status: TaskStatus::Pending,
            depends_on: BTreeSet::new(),
            payload: TaskPayload::for_subject(subject, serde_json::Value::Null),
            created_at: now,
            updated_at: now,
            attempts: 0,
            artifact_ref: None,
            last_error: None,
            retry_at: None,
        }
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, body: serde_json::Value) -> Self {
        self.payload = TaskPayload::for_subject(&self.subject, body);
        self
    }

    /// Reject a task whose dependency set names itself.
    pub fn check_self_dependency(&self) -> Result<()> {
        if self.depends_on.contains(&self.id) {
            return Err(Error::SelfDependency {
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Subject prefix and owner both admit `role`.
    pub fn routes_to(&self, prefix: &str, role: &str) -> bool {
        self.subject.starts_with(prefix)
            && self.owner.as_deref().map_or(true, |owner| owner == role)
    }

    /// A retried task is held back until its backoff has elapsed.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_at.map_or(true, |at| at <= now)
    }

    /// Apply a status transition, enforcing the lifecycle rules.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        if next == TaskStatus::InProgress {
            self.attempts += 1;
            self.retry_at = None;
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Producer-facing description of work to enqueue.
///
/// Only `subject` and `depends_on` are interpreted; `payload` is carried
/// through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskDescriptor {
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn owned_by(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    /// Validate ids and build the task record.
    pub fn into_task(self) -> Result<Task> {
        if self.subject.trim().is_empty() {
            return Err(Error::Validation("task subject must not be empty".into()));
        }
        let id = match self.id.as_deref() {
            Some(id) => TaskId::parse(id)?,
            None => TaskId::generate(),
        };
        let depends_on = self
            .depends_on
            .iter()
            .map(|d| TaskId::parse(d))
            .collect::<Result<BTreeSet<_>>>()?;

        let mut task = Task::new(id, &self.subject).with_payload(self.payload);
        task.owner = self.owner;
        task.depends_on = depends_on;
        task.check_self_dependency()?;
        Ok(task)
    }
}
