//! Merge-conflict detection, resolution and status reporting.
//!
//! Detection simulates the merge with `git merge-tree` and never touches the
//! working tree or remote-tracking refs; callers that compare against a
//! remote run [`ConflictManager::fetch`] first. Resolution escalates through rebase, merge and a per-file
//! "keep ours" fallback, aborting each failed attempt before the next so the
//! repository is never left mid-rebase or mid-merge.

mod detect;
mod git;
mod resolve;
mod status;

#[cfg(test)]
pub(crate) use git::testing;
pub use git::{GitError, GitOutput, GitRunner};
pub use status::MergeStatus;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of a merge simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetectionResult {
    pub has_conflicts: bool,
    pub conflicting_files: Vec<String>,
    pub branch_name: String,
    pub target_branch: String,
}

/// Resolution strategies, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    Rebase,
    Merge,
    OursPerFile,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Rebase => "rebase",
            Self::Merge => "merge",
            Self::OursPerFile => "ours-per-file",
        })
    }
}

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionResult {
    pub success: bool,
    pub resolved_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResolutionStrategy>,
    /// Files were resolved mechanically and need a human look
    pub needs_review: bool,
}

/// Conflict operations against one local clone.
#[derive(Debug, Clone)]
pub struct ConflictManager {
    git: GitRunner,
    remote: Option<String>,
    api_timeout: Duration,
}

impl ConflictManager {
    #[must_use]
    pub fn new(git: GitRunner) -> Self {
        Self {
            git,
            remote: None,
            api_timeout: Duration::from_secs(60),
        }
    }

    /// Bound for the tracker calls made by [`Self::track_merge_status`].
    #[must_use]
    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    /// Compare and push against `remote` instead of local branches.
    #[must_use]
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    #[must_use]
    pub fn git(&self) -> &GitRunner {
        &self.git
    }

    /// Ref name for `branch`, remote-qualified when a remote is set.
    fn qualify(&self, branch: &str) -> String {
        match &self.remote {
            Some(remote) => format!("{remote}/{branch}"),
            None => branch.to_string(),
        }
    }

    /// Refresh remote-tracking refs. No-op without a remote.
    pub async fn fetch(&self) -> Result<(), GitError> {
        if let Some(remote) = &self.remote {
            self.git.run_checked(&["fetch", "--prune", remote]).await?;
        }
        Ok(())
    }
}
