use thiserror::Error;

use crate::core::task::{TaskId, TaskStatus};

/// Classification of an [`Error`] for callers that route on the kind
/// rather than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DuplicateId,
    SelfDependency,
    CycleDetected,
    DanglingDependency,
    InvalidTransition,
    NotFound,
    StorageUnavailable,
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::DuplicateId => "duplicate_id",
            ErrorKind::SelfDependency => "self_dependency",
            ErrorKind::CycleDetected => "cycle_detected",
            ErrorKind::DanglingDependency => "dangling_dependency",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Task already exists: {id}")]
    DuplicateId { id: TaskId },

    #[error("Task {id} depends on itself")]
    SelfDependency { id: TaskId },

    #[error("Dependency cycle detected among tasks: {}", join_ids(.ids))]
    CycleDetected { ids: Vec<TaskId> },

    #[error("Task {id} depends on unknown task {missing}")]
    DanglingDependency { id: TaskId, missing: TaskId },

    #[error("Invalid transition for task {id} from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task not found: {id}")]
    NotFound { id: TaskId },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateId { .. } => ErrorKind::DuplicateId,
            Error::SelfDependency { .. } => ErrorKind::SelfDependency,
            Error::CycleDetected { .. } => ErrorKind::CycleDetected,
            Error::DanglingDependency { .. } => ErrorKind::DanglingDependency,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            _ => ErrorKind::Other,
        }
    }

    /// Only storage outages are worth retrying; everything else needs the
    /// caller to change its input.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StorageUnavailable
    }

    /// Task ids the error refers to, if any.
    pub fn task_ids(&self) -> Vec<TaskId> {
        match self {
            Error::DuplicateId { id }
            | Error::SelfDependency { id }
            | Error::InvalidTransition { id, .. }
            | Error::NotFound { id } => vec![id.clone()],
            Error::DanglingDependency { id, missing } => vec![id.clone(), missing.clone()],
            Error::CycleDetected { ids } => ids.clone(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        Error::StorageUnavailable(err.to_string())
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
