use tracing::{debug, info};

use super::{ConflictDetectionResult, ConflictManager, GitError};

/// Whether merge-tree output carries a full conflict hunk.
///
/// Legacy merge-tree prints hunks as a diff, so marker lines may be prefixed
/// with `+` or a space.
pub(super) fn has_conflict_markers(output: &str) -> bool {
    let mut open = false;
    for line in output.lines() {
        let line = line.strip_prefix(['+', ' ']).unwrap_or(line);
        if line.starts_with("<<<<<<<") {
            open = true;
        } else if open && line.starts_with(">>>>>>>") {
            return true;
        }
    }
    false
}

impl ConflictManager {
    /// Simulate merging `target` into `branch` and report conflicts.
    ///
    /// Read-only: no fetch, no checkout, no index changes, no commits.
    pub async fn detect_conflicts(
        &self,
        branch: &str,
        target: &str,
    ) -> Result<ConflictDetectionResult, GitError> {
        let branch_ref = self.qualify(branch);
        let target_ref = self.qualify(target);

        let base = self
            .git
            .run_checked(&["merge-base", &target_ref, &branch_ref])
            .await?;
        let base = base.stdout.trim();

        let simulated = self
            .git
            .run(&["merge-tree", base, &target_ref, &branch_ref])
            .await?;
        if !simulated.success() {
            return Err(GitError::CommandFailed {
                command: format!("git merge-tree {base} {target_ref} {branch_ref}"),
                exit_code: simulated.exit_code,
                stderr: simulated.stderr.trim().to_string(),
            });
        }

        let has_conflicts = has_conflict_markers(&simulated.stdout);
        let conflicting_files = if has_conflicts {
            self.git
                .run_checked(&["diff", "--name-only", &target_ref, &branch_ref])
                .await?
                .lines()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        if has_conflicts {
            info!(
                branch,
                target,
                files = conflicting_files.len(),
                "Merge conflicts detected"
            );
        } else {
            debug!(branch, target, "No merge conflicts");
        }

        Ok(ConflictDetectionResult {
            has_conflicts,
            conflicting_files,
            branch_name: branch.to_string(),
            target_branch: target.to_string(),
        })
    }
}
