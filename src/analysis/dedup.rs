//! Duplicate finding removal.

use std::collections::HashSet;

use serde::Serialize;

use crate::analysis::finding::Finding;
use crate::hlog_debug;

/// Counts from a [`merge_with_stats`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub input: usize,
    pub kept: usize,
    pub dropped: usize,
}

/// Drop findings whose identity key was already seen.
///
/// The first occurrence of each key is kept and input order is preserved,
/// so `merge(merge(x)) == merge(x)`.
pub fn merge(findings: Vec<Finding>) -> Vec<Finding> {
    merge_with_stats(findings).0
}

pub fn merge_with_stats(findings: Vec<Finding>) -> (Vec<Finding>, MergeStats) {
    let input = findings.len();
    let mut seen = HashSet::with_capacity(input);
    let kept: Vec<Finding> = findings
        .into_iter()
        .filter(|f| seen.insert(f.identity_key()))
        .collect();

    let stats = MergeStats {
        input,
        kept: kept.len(),
        dropped: input - kept.len(),
    };
    if stats.dropped > 0 {
        hlog_debug!("merge: dropped {} duplicate findings of {}", stats.dropped, input);
    }
    (kept, stats)
}
