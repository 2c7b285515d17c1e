pub mod analysis;
pub mod bus;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod util;

pub use bus::{Message, MessageBus, MessageFilter, MessageType};
pub use config::Config;
pub use core::{Role, Task, TaskDescriptor, TaskId, TaskStatus, TaskStore};
pub use error::{Error, ErrorKind, Result};
pub use orchestration::{ClaimOutcome, Outcome, ReportOutcome, Scheduler, Worker};
