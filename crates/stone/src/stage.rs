//! Workflow stages, their wire labels, and the priority resolver.
//!
//! An issue's position in the workflow is the set of `stone-*` labels it
//! carries. Issues routinely accumulate stale labels (a handler crashed
//! between adding the next label and removing its own), so the active stage
//! is always *resolved* from the whole label set rather than read from a
//! single label.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Prefix shared by every workflow label.
pub const LABEL_PREFIX: &str = "stone-";

/// Dispatch order, highest priority first.
///
/// The first seven entries are the in-flight stages. The post-audit stages
/// follow and are only reached when no in-flight label is present.
pub const DISPATCH_PRIORITY: [Stage; 10] = [
    Stage::Error,
    Stage::Audit,
    Stage::FeatureFix,
    Stage::FeatureImplement,
    Stage::Actions,
    Stage::Qa,
    Stage::Process,
    Stage::Pr,
    Stage::Docs,
    Stage::ReadyForTests,
];

/// Canonical workflow stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Product manager breaks the issue down
    Process,
    /// QA writes the test plan
    Qa,
    /// CI workflow authoring
    Actions,
    /// First implementation pass
    FeatureImplement,
    /// Implementation rework after a failed audit or test run
    FeatureFix,
    /// Code audit
    Audit,
    /// Marker: last audit passed
    AuditPass,
    /// Marker: last audit failed
    AuditFail,
    /// Waiting on the test plan to be exercised
    ReadyForTests,
    /// Marker: tests failed
    TestFailure,
    /// Documentation pass
    Docs,
    /// Pull request creation
    Pr,
    /// Workflow finished
    Complete,
    /// Escalated failure, parked for a human
    Error,
}

impl Stage {
    /// Every stage, in lifecycle order.
    pub const ALL: [Stage; 14] = [
        Stage::Process,
        Stage::Qa,
        Stage::Actions,
        Stage::FeatureImplement,
        Stage::FeatureFix,
        Stage::Audit,
        Stage::AuditPass,
        Stage::AuditFail,
        Stage::ReadyForTests,
        Stage::TestFailure,
        Stage::Docs,
        Stage::Pr,
        Stage::Complete,
        Stage::Error,
    ];

    /// Label suffix, e.g. `feature-implement`.
    #[must_use]
    pub fn slug(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Qa => "qa",
            Self::Actions => "actions",
            Self::FeatureImplement => "feature-implement",
            Self::FeatureFix => "feature-fix",
            Self::Audit => "audit",
            Self::AuditPass => "audit-pass",
            Self::AuditFail => "audit-fail",
            Self::ReadyForTests => "ready-for-tests",
            Self::TestFailure => "test-failure",
            Self::Docs => "docs",
            Self::Pr => "pr",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// Wire label, e.g. `stone-feature-implement`.
    #[must_use]
    pub fn label(self) -> String {
        format!("{LABEL_PREFIX}{}", self.slug())
    }

    /// Parse a wire label. Anything that is not a known `stone-` label is `None`.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        let slug = label.trim().strip_prefix(LABEL_PREFIX)?;
        Self::ALL.into_iter().find(|stage| stage.slug() == slug)
    }

    /// Get the display name for this stage.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Process => "PM",
            Self::Qa => "QA",
            Self::Actions => "Actions",
            Self::FeatureImplement => "Feature",
            Self::FeatureFix => "Feature Fix",
            Self::Audit => "Audit",
            Self::AuditPass => "Audit Passed",
            Self::AuditFail => "Audit Failed",
            Self::ReadyForTests => "Ready for Tests",
            Self::TestFailure => "Test Failure",
            Self::Docs => "Docs",
            Self::Pr => "PR",
            Self::Complete => "Complete",
            Self::Error => "Error",
        }
    }

    /// Position in [`DISPATCH_PRIORITY`]; lower wins. `None` for stages that
    /// are never dispatched to a handler.
    #[must_use]
    pub fn priority(self) -> Option<usize> {
        DISPATCH_PRIORITY.iter().position(|s| *s == self)
    }

    /// Whether a handler runs for this stage.
    #[must_use]
    pub fn is_dispatchable(self) -> bool {
        self.priority().is_some()
    }

    /// Outcome markers travel alongside a stage label and never drive dispatch.
    #[must_use]
    pub fn is_marker(self) -> bool {
        matches!(self, Self::AuditPass | Self::AuditFail | Self::TestFailure)
    }

    /// Check if this is a terminal stage.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Get the next expected stage on the success path.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Process => Some(Self::Qa),
            Self::Qa => Some(Self::Actions),
            Self::Actions => Some(Self::FeatureImplement),
            Self::FeatureImplement | Self::FeatureFix => Some(Self::Audit),
            Self::Audit => Some(Self::ReadyForTests),
            Self::ReadyForTests => Some(Self::Docs),
            Self::Docs => Some(Self::Pr),
            Self::Pr => Some(Self::Complete),
            Self::AuditPass
            | Self::AuditFail
            | Self::TestFailure
            | Self::Complete
            | Self::Error => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// The labels on an issue at one evaluation point.
///
/// Read once per run and passed by value; [`LabelSet::apply`] returns the
/// set the issue carries after a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    #[must_use]
    pub fn has_stage(&self, stage: Stage) -> bool {
        self.contains(&stage.label())
    }

    /// Recognized stages present on the issue, in lifecycle order.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.0.iter().filter_map(|l| Stage::from_label(l)).collect();
        stages.sort();
        stages.dedup();
        stages
    }

    /// Highest-priority dispatchable stage on the issue.
    #[must_use]
    pub fn active_stage(&self) -> Option<Stage> {
        resolve_active_stage(self)
    }

    /// Label set after adding `add` and removing `remove`.
    #[must_use]
    pub fn apply(&self, add: &[String], remove: &[String]) -> Self {
        let mut next = self.0.clone();
        next.extend(add.iter().cloned());
        for label in remove {
            next.remove(label);
        }
        Self(next)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for LabelSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Resolve the stage a handler should run for.
///
/// Returns `None` when no dispatchable stage label is present; callers treat
/// that as a no-op. Unknown labels are ignored.
#[must_use]
pub fn resolve_active_stage(labels: &LabelSet) -> Option<Stage> {
    let present = labels.stages();

    // QA and PM co-present means some upstream handler skipped a removal.
    // QA wins by precedence; surface it rather than paper over it.
    if present.contains(&Stage::Qa) && present.contains(&Stage::Process) {
        warn!(
            labels = ?present,
            "Issue carries both stone-qa and stone-process; resolving to QA"
        );
    }

    present
        .into_iter()
        .filter_map(|stage| stage.priority().map(|rank| (rank, stage)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, stage)| stage)
}
