//! Findings emitted by scanner-like roles.

use serde::{Deserialize, Deserializer, Serialize};

/// Severity reported by a scanner.
///
/// Labels are matched case-insensitively. Values outside the four known
/// levels deserialize to `Unknown` instead of failing, since scanners are
/// free to invent their own labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl Severity {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Unknown,
        }
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Severity::from_label(&label))
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
            Severity::Unknown => write!(f, "unknown"),
        }
    }
}

/// Estimated effort to address a finding. Matched like [`Severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Small,
    Medium,
    Large,
    #[default]
    Unknown,
}

impl Effort {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "small" => Effort::Small,
            "medium" => Effort::Medium,
            "large" => Effort::Large,
            _ => Effort::Unknown,
        }
    }
}

impl<'de> Deserialize<'de> for Effort {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Effort::from_label(&label))
    }
}

impl std::fmt::Display for Effort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Effort::Small => write!(f, "small"),
            Effort::Medium => write!(f, "medium"),
            Effort::Large => write!(f, "large"),
            Effort::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Key under which two findings count as the same issue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub file: String,
    pub line: u32,
    pub dimension: String,
}

/// A single issue reported by a scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Analysis axis, e.g. `security` or `performance`.
    pub dimension: String,
    pub severity: Severity,
    pub location: Location,
    /// Scanner or tool that produced the finding.
    #[serde(default)]
    pub source: String,
    /// Scanner confidence in [0, 1].
    #[serde(default)]
    pub confidence: f32,
    #[serde(default, alias = "estimated_effort")]
    pub effort: Effort,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Finding {
    pub fn new(dimension: &str, severity: Severity, file: &str, line: u32) -> Self {
        Self {
            dimension: dimension.to_string(),
            severity,
            location: Location {
                file: file.to_string(),
                line,
            },
            source: String::new(),
            confidence: 1.0,
            effort: Effort::Unknown,
            description: None,
        }
    }

    pub fn with_effort(mut self, effort: Effort) -> Self {
        self.effort = effort;
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            file: self.location.file.clone(),
            line: self.location.line,
            dimension: self.dimension.clone(),
        }
    }
}
