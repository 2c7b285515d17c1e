//! Message records carried by the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::TaskId;

/// Kind of event, enumerated per producing role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    PlanReady,
    ScanComplete,
    AssessmentComplete,
    ImplComplete,
    TaskCreated,
    TaskClaimed,
    TaskCompleted,
    TaskFailed,
    RetryScheduled,
    TaskCancelled,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::PlanReady => "plan_ready",
            MessageType::ScanComplete => "scan_complete",
            MessageType::AssessmentComplete => "assessment_complete",
            MessageType::ImplComplete => "impl_complete",
            MessageType::TaskCreated => "task_created",
            MessageType::TaskClaimed => "task_claimed",
            MessageType::TaskCompleted => "task_completed",
            MessageType::TaskFailed => "task_failed",
            MessageType::RetryScheduled => "retry_scheduled",
            MessageType::TaskCancelled => "task_cancelled",
            MessageType::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| crate::Error::Validation(format!("unknown message type: {}", s)))
    }
}

/// A published event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Position in the log, starting at 1.
    pub seq: u64,
    pub team: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Opaque artifact pointer, never dereferenced by the bus.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A message before the log assigns its sequence number.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub team: String,
    pub from: String,
    pub to: String,
    pub kind: MessageType,
    pub summary: String,
    pub task_id: Option<TaskId>,
    pub artifact_ref: Option<String>,
}

impl MessageDraft {
    pub fn new(from: &str, to: &str, kind: MessageType, summary: impl Into<String>) -> Self {
        Self {
            team: String::new(),
            from: from.to_string(),
            to: to.to_string(),
            kind,
            summary: summary.into(),
            task_id: None,
            artifact_ref: None,
        }
    }

    pub fn team(mut self, team: &str) -> Self {
        self.team = team.to_string();
        self
    }

    pub fn task(mut self, id: &TaskId) -> Self {
        self.task_id = Some(id.clone());
        self
    }

    pub fn artifact(mut self, artifact_ref: Option<String>) -> Self {
        self.artifact_ref = artifact_ref;
        self
    }

    pub(crate) fn seal(self, seq: u64) -> Message {
        Message {
            seq,
            team: self.team,
            from: self.from,
            to: self.to,
            kind: self.kind,
            summary: self.summary,
            task_id: self.task_id,
            artifact_ref: self.artifact_ref,
            timestamp: Utc::now(),
        }
    }
}

/// Selects messages by team, sender/recipient and type. Empty fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub team: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub kinds: Vec<MessageType>,
}

impl MessageFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn team(mut self, team: &str) -> Self {
        self.team = Some(team.to_string());
        self
    }

    pub fn from(mut self, from: &str) -> Self {
        self.from = Some(from.to_string());
        self
    }

    pub fn to(mut self, to: &str) -> Self {
        self.to = Some(to.to_string());
        self
    }

    /// Restrict to one sender/recipient pair.
    pub fn between(self, from: &str, to: &str) -> Self {
        self.from(from).to(to)
    }

    pub fn kind(mut self, kind: MessageType) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn matches(&self, msg: &Message) -> bool {
        self.team.as_deref().map_or(true, |t| t == msg.team)
            && self.from.as_deref().map_or(true, |f| f == msg.from)
            && self.to.as_deref().map_or(true, |t| t == msg.to)
            && (self.kinds.is_empty() || self.kinds.contains(&msg.kind))
    }
}
