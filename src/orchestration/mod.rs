//! Orchestration layer: the scheduler role workers poll, the worker loop
//! that drives opaque work functions, and the retry policy both share.

pub mod retry;
pub mod scheduler;
pub mod worker;

pub use retry::{with_backoff, RetryPolicy};
pub use scheduler::{ClaimOutcome, Outcome, ReportOutcome, Scheduler, StatusSummary};
pub use worker::{PollOutcome, WorkFunction, WorkResult, Worker, WorkerStats};
