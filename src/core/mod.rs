//! Core domain models for the task scheduler.
//!
//! This module contains the task record, the dependency graph used to
//! compute waves and ready sets, and the store that owns task records.

pub mod dag;
pub mod store;
pub mod task;

pub use dag::{DependencyGraph, ValidationReport, WaveAssignment};
pub use store::{JsonTaskStore, MemoryTaskStore, TaskStore};
pub use task::{Role, Task, TaskDescriptor, TaskId, TaskPayload, TaskStatus};
