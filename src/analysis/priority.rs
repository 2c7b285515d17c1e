//! Impact/cost scoring and quadrant classification.
//!
//! Impact comes from severity and cost from estimated effort, both on a
//! 1..=5 scale. Labels outside the fixed tables score a neutral 3.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::analysis::finding::{Effort, Finding, Severity};

/// Score assigned to severities or efforts outside the fixed tables.
pub const NEUTRAL_SCORE: u8 = 3;

pub fn impact_score(severity: Severity) -> u8 {
    match severity {
        Severity::Critical => 5,
        Severity::High => 4,
        Severity::Medium => 3,
        Severity::Low => 1,
        Severity::Unknown => NEUTRAL_SCORE,
    }
}

pub fn cost_score(effort: Effort) -> u8 {
    match effort {
        Effort::Small => 1,
        Effort::Medium => 3,
        Effort::Large => 5,
        Effort::Unknown => NEUTRAL_SCORE,
    }
}

/// `(impact, cost)` for a finding.
pub fn score(finding: &Finding) -> (u8, u8) {
    (impact_score(finding.severity), cost_score(finding.effort))
}

/// Priority class of a scored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quadrant {
    QuickWin,
    Strategic,
    Backlog,
    Defer,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::QuickWin,
        Quadrant::Strategic,
        Quadrant::Backlog,
        Quadrant::Defer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quadrant::QuickWin => "quick-win",
            Quadrant::Strategic => "strategic",
            Quadrant::Backlog => "backlog",
            Quadrant::Defer => "defer",
        }
    }
}

impl std::fmt::Display for Quadrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an `(impact, cost)` pair.
pub fn classify(impact: u8, cost: u8) -> Quadrant {
    match (impact >= 4, cost <= 2) {
        (true, true) => Quadrant::QuickWin,
        (true, false) => Quadrant::Strategic,
        (false, true) => Quadrant::Backlog,
        (false, false) => Quadrant::Defer,
    }
}

/// A finding with its scores and quadrant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    #[serde(flatten)]
    pub finding: Finding,
    pub impact_score: u8,
    pub cost_score: u8,
    pub quadrant: Quadrant,
}

pub fn assess(finding: Finding) -> Assessment {
    let (impact, cost) = score(&finding);
    Assessment {
        finding,
        impact_score: impact,
        cost_score: cost,
        quadrant: classify(impact, cost),
    }
}

/// Assessments grouped by quadrant.
///
/// Within a quadrant items are ordered by impact descending, cost
/// ascending, then identity key, so the head of each list is the best
/// next pick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PriorityMatrix {
    pub quadrants: BTreeMap<Quadrant, Vec<Assessment>>,
    pub by_severity: BTreeMap<Severity, usize>,
}

impl PriorityMatrix {
    pub fn build(findings: impl IntoIterator<Item = Finding>) -> Self {
        let mut matrix = PriorityMatrix::default();
        for q in Quadrant::ALL {
            matrix.quadrants.insert(q, Vec::new());
        }
        for finding in findings {
            *matrix.by_severity.entry(finding.severity).or_default() += 1;
            let a = assess(finding);
            matrix.quadrants.entry(a.quadrant).or_default().push(a);
        }
        for items in matrix.quadrants.values_mut() {
            items.sort_by(|a, b| {
                b.impact_score
                    .cmp(&a.impact_score)
                    .then(a.cost_score.cmp(&b.cost_score))
                    .then_with(|| a.finding.identity_key().cmp(&b.finding.identity_key()))
            });
        }
        matrix
    }

    pub fn get(&self, quadrant: Quadrant) -> &[Assessment] {
        self.quadrants
            .get(&quadrant)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn count(&self, quadrant: Quadrant) -> usize {
        self.get(quadrant).len()
    }

    pub fn total(&self) -> usize {
        self.quadrants.values().map(Vec::len).sum()
    }
}
