//! Pull-request feedback triage.
//!
//! Review comments are classified into [`FeedbackItem`]s, ranked, routed to
//! an owning team, and turned into tracking issues.

mod classifier;
mod processor;
mod router;

pub use classifier::{FeedbackClassifier, KeywordClassifier};
pub use processor::{FeedbackEntry, FeedbackProcessor, FeedbackReport};
pub use router::{prioritize_feedback, route_feedback_to_teams, TeamRouting};

use serde::{Deserialize, Serialize};

/// How urgent a piece of feedback is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Sort rank; critical first.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Part of the system a comment is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffectedArea {
    Performance,
    Security,
    Ui,
    Docs,
    Testing,
    Api,
    Unknown,
}

impl AffectedArea {
    /// Key used in the team routing table.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::Security => "security",
            Self::Ui => "ui",
            Self::Docs => "docs",
            Self::Testing => "testing",
            Self::Api => "api",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AffectedArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracking priority derived from severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    #[must_use]
    pub fn from_severity(severity: Severity) -> Self {
        match severity.rank() {
            0 => Self::P0,
            1 => Self::P1,
            2 => Self::P2,
            _ => Self::P3,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One actionable comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackItem {
    pub id: String,
    pub description: String,
    pub severity: Severity,
    pub author: String,
    pub affected_area: AffectedArea,
    pub source_comment_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrioritizedFeedback {
    pub item: FeedbackItem,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutedFeedback {
    pub item: FeedbackItem,
    pub team: String,
}
