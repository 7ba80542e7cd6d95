use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

use super::{ConflictDetectionResult, ConflictManager};
use crate::error::{bounded, WorkflowError};
use crate::github::{IssueTracker, PullRequest, COMMENT_MARKER};

/// Read-only merge report for a feature branch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStatus {
    pub branch: String,
    pub target_branch: String,
    pub branch_exists: bool,
    /// Commits on the target that the branch does not have
    pub commits_behind: Option<u64>,
    pub pull_request: Option<PullRequest>,
    pub conflicts: Option<ConflictDetectionResult>,
    pub checked_at: DateTime<Utc>,
}

impl MergeStatus {
    /// Whether the branch can merge without intervention as far as we know.
    #[must_use]
    pub fn is_mergeable(&self) -> bool {
        self.branch_exists
            && self.conflicts.as_ref().is_some_and(|c| !c.has_conflicts)
            && self
                .pull_request
                .as_ref()
                .is_none_or(|pr| pr.mergeable != Some(false))
    }

    /// Markdown status comment.
    #[must_use]
    pub fn to_comment(&self) -> String {
        let mut out = String::new();
        out.push_str(COMMENT_MARKER);
        let icon = if self.is_mergeable() { "✅" } else { "⚠️" };
        let _ = writeln!(
            out,
            "\n## {icon} Merge status: `{}` → `{}`\n",
            self.branch, self.target_branch
        );

        if !self.branch_exists {
            let _ = writeln!(out, "Branch `{}` does not exist.", self.branch);
            return out;
        }

        if let Some(behind) = self.commits_behind {
            let _ = writeln!(out, "- **Behind target**: {behind} commit(s)");
        }

        match &self.pull_request {
            Some(pr) => {
                let mergeable = match pr.mergeable {
                    Some(true) => "yes",
                    Some(false) => "no",
                    None => "unknown",
                };
                let _ = writeln!(
                    out,
                    "- **Pull request**: [#{}]({}) (mergeable: {mergeable}, state: {})",
                    pr.number,
                    pr.html_url,
                    pr.mergeable_state.as_deref().unwrap_or("unknown")
                );
            }
            None => out.push_str("- **Pull request**: none open\n"),
        }

        match &self.conflicts {
            Some(c) if c.has_conflicts => {
                let _ = writeln!(out, "- **Conflicts**: {} file(s)", c.conflicting_files.len());
                for file in &c.conflicting_files {
                    let _ = writeln!(out, "  - `{file}`");
                }
            }
            Some(_) => out.push_str("- **Conflicts**: none\n"),
            None => out.push_str("- **Conflicts**: not checked\n"),
        }

        let _ = write!(out, "\n_Checked at {}_\n", self.checked_at.to_rfc3339());
        out
    }
}

impl ConflictManager {
    /// Gather branch, PR and conflict state without changing anything.
    ///
    /// Uses the refs as they are; fetch first to compare against a fresh remote.
    pub async fn track_merge_status(
        &self,
        branch: &str,
        target: &str,
        tracker: &dyn IssueTracker,
    ) -> Result<MergeStatus, WorkflowError> {
        let branch_ref = self.qualify(branch);
        let target_ref = self.qualify(target);

        let exists = self
            .git
            .run(&[
                "rev-parse",
                "--verify",
                "--quiet",
                &format!("{branch_ref}^{{commit}}"),
            ])
            .await?
            .success();

        let pull_request = bounded(
            self.api_timeout,
            "github.find_open_pull_request",
            tracker.find_open_pull_request(branch),
        )
        .await?;

        if !exists {
            return Ok(MergeStatus {
                branch: branch.to_string(),
                target_branch: target.to_string(),
                branch_exists: false,
                commits_behind: None,
                pull_request,
                conflicts: None,
                checked_at: Utc::now(),
            });
        }

        let behind = self
            .git
            .run_checked(&["rev-list", "--count", &format!("{branch_ref}..{target_ref}")])
            .await?;
        let commits_behind = behind.stdout.trim().parse().ok();

        let conflicts = self.detect_conflicts(branch, target).await?;

        Ok(MergeStatus {
            branch: branch.to_string(),
            target_branch: target.to_string(),
            branch_exists: true,
            commits_behind,
            pull_request,
            conflicts: Some(conflicts),
            checked_at: Utc::now(),
        })
    }
}
