//! Post-processing for analyzer roles: duplicate removal and prioritization.

pub mod dedup;
pub mod finding;
pub mod priority;

pub use dedup::{merge, merge_with_stats, MergeStats};
pub use finding::{Effort, Finding, IdentityKey, Location, Severity};
pub use priority::{assess, classify, score, Assessment, PriorityMatrix, Quadrant};
