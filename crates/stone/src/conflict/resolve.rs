use std::future::Future;
use tracing::{info, warn};

use super::{ConflictManager, ConflictResolutionResult, GitError, ResolutionStrategy};

impl ConflictManager {
    /// Bring `branch` up to date with `target`, trying rebase, then merge,
    /// then keeping the branch's side of every conflicting file.
    ///
    /// Leaves `branch` checked out. Every failed attempt is aborted before
    /// the next one starts, and a git error or timeout inside an attempt
    /// aborts it before the error is returned. Each git call is bounded by the
    /// runner's timeout; do not wrap this call in another one.
    pub async fn resolve_conflicts(
        &self,
        branch: &str,
        target: &str,
    ) -> Result<ConflictResolutionResult, GitError> {
        self.fetch().await?;
        self.abort_in_progress().await?;
        self.checkout(branch).await?;
        let target_ref = self.qualify(target);

        let mut result = if self.guarded(self.try_rebase(&target_ref)).await? {
            resolved(ResolutionStrategy::Rebase, Vec::new(), "rebased cleanly")
        } else if self.guarded(self.try_merge(&target_ref)).await? {
            resolved(ResolutionStrategy::Merge, Vec::new(), "merged cleanly")
        } else {
            self.guarded(self.resolve_ours_per_file(&target_ref)).await?
        };

        if result.success {
            if let Some(remote) = &self.remote {
                let push = self
                    .git
                    .run(&["push", "--force-with-lease", remote, branch])
                    .await?;
                if !push.success() {
                    warn!(branch, stderr = %push.stderr.trim(), "Push after resolution failed");
                    result.success = false;
                    result.error = Some(format!("push failed: {}", push.stderr.trim()));
                }
            }
        }

        info!(
            branch,
            target,
            success = result.success,
            strategy = ?result.strategy,
            "Conflict resolution finished"
        );
        Ok(result)
    }

    /// Run one strategy; on error, abort whatever it left in progress.
    async fn guarded<T, F>(&self, attempt: F) -> Result<T, GitError>
    where
        F: Future<Output = Result<T, GitError>>,
    {
        let err = match attempt.await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        warn!(error = %err, "Resolution attempt errored, restoring repository");
        if let Err(cleanup) = self.clear_stale_index_lock().await {
            warn!(error = %cleanup, "Could not remove index lock");
        }
        if let Err(cleanup) = self.abort_in_progress().await {
            warn!(error = %cleanup, "Could not abort in-progress operation");
        }
        Err(err)
    }

    /// A git process killed on timeout can leave `index.lock` behind.
    async fn clear_stale_index_lock(&self) -> Result<(), GitError> {
        let path = self
            .git
            .run_checked(&["rev-parse", "--git-path", "index.lock"])
            .await?;
        let lock = self.git.repo().join(path.stdout.trim());
        if lock.exists() {
            warn!(path = %lock.display(), "Removing stale index lock");
            tokio::fs::remove_file(&lock)
                .await
                .map_err(|source| GitError::Spawn {
                    command: format!("rm {}", lock.display()),
                    source,
                })?;
        }
        Ok(())
    }

    async fn checkout(&self, branch: &str) -> Result<(), GitError> {
        match &self.remote {
            Some(_) => {
                let upstream = self.qualify(branch);
                self.git
                    .run_checked(&["checkout", "-q", "-B", branch, &upstream])
                    .await?
            }
            None => self.git.run_checked(&["checkout", "-q", branch]).await?,
        };
        Ok(())
    }

    async fn try_rebase(&self, target_ref: &str) -> Result<bool, GitError> {
        let rebase = self.git.run(&["rebase", target_ref]).await?;
        if rebase.success() {
            return Ok(true);
        }
        warn!(target = target_ref, "Rebase failed, aborting");
        self.git.run(&["rebase", "--abort"]).await?;
        Ok(false)
    }

    async fn try_merge(&self, target_ref: &str) -> Result<bool, GitError> {
        let merge = self.git.run(&["merge", "--no-edit", target_ref]).await?;
        if merge.success() {
            return Ok(true);
        }
        warn!(target = target_ref, "Merge failed, aborting");
        self.abort_merge().await?;
        Ok(false)
    }

    /// All-or-nothing: one file that cannot take our side aborts the merge.
    async fn resolve_ours_per_file(
        &self,
        target_ref: &str,
    ) -> Result<ConflictResolutionResult, GitError> {
        self.git
            .run(&["merge", "--no-commit", "--no-ff", target_ref])
            .await?;

        let unmerged: Vec<String> = self
            .git
            .run(&["diff", "--name-only", "--diff-filter=U"])
            .await?
            .lines()
            .map(str::to_string)
            .collect();

        if unmerged.is_empty() {
            self.abort_merge().await?;
            return Ok(failed("merge failed without reporting conflicting files"));
        }

        for file in &unmerged {
            let ours = self.git.run(&["checkout", "--ours", "--", file]).await?;
            let staged = if ours.success() {
                self.git.run(&["add", "--", file]).await?
            } else {
                ours
            };
            if !staged.success() {
                warn!(file = %file, stderr = %staged.stderr.trim(), "Cannot keep our side, aborting merge");
                self.abort_merge().await?;
                return Ok(failed(&format!(
                    "could not resolve {file}: {}",
                    staged.stderr.trim()
                )));
            }
        }

        let commit = self.git.run(&["commit", "--no-edit"]).await?;
        if !commit.success() {
            self.abort_merge().await?;
            return Ok(failed(&format!("commit failed: {}", commit.stderr.trim())));
        }

        let mut result = resolved(
            ResolutionStrategy::OursPerFile,
            unmerged,
            "kept the branch version of every conflicting file",
        );
        result.needs_review = true;
        Ok(result)
    }

    async fn abort_merge(&self) -> Result<(), GitError> {
        let abort = self.git.run(&["merge", "--abort"]).await?;
        if !abort.success() {
            // No MERGE_HEAD: drop whatever the failed attempt staged
            self.git.run_checked(&["reset", "--hard", "-q", "HEAD"]).await?;
        }
        Ok(())
    }

    /// Abort a rebase or merge left behind by an earlier crash.
    async fn abort_in_progress(&self) -> Result<(), GitError> {
        for dir in ["rebase-merge", "rebase-apply"] {
            let path = self.git.run_checked(&["rev-parse", "--git-path", dir]).await?;
            if self.git.repo().join(path.stdout.trim()).exists() {
                warn!("Aborting rebase left in progress");
                self.git.run(&["rebase", "--abort"]).await?;
                break;
            }
        }
        let merging = self
            .git
            .run(&["rev-parse", "-q", "--verify", "MERGE_HEAD"])
            .await?;
        if merging.success() {
            warn!("Aborting merge left in progress");
            self.abort_merge().await?;
        }
        Ok(())
    }
}

fn resolved(
    strategy: ResolutionStrategy,
    files: Vec<String>,
    message: &str,
) -> ConflictResolutionResult {
    ConflictResolutionResult {
        success: true,
        resolved_files: files,
        error: None,
        message: Some(message.to_string()),
        strategy: Some(strategy),
        needs_review: false,
    }
}

fn failed(error: &str) -> ConflictResolutionResult {
    ConflictResolutionResult {
        success: false,
        resolved_files: Vec::new(),
        error: Some(error.to_string()),
        message: Some("automatic resolution failed, manual intervention required".to_string()),
        strategy: None,
        needs_review: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::testing::{
        commit_file, make_clean_repo, make_conflicting_repo, make_git_repo, run_git,
    };
    use crate::conflict::GitRunner;
    use std::path::Path;

    fn assert_not_mid_operation(repo: &Path) {
        assert!(!repo.join(".git/MERGE_HEAD").exists());
        assert!(!repo.join(".git/rebase-merge").exists());
        assert!(!repo.join(".git/rebase-apply").exists());
        assert_eq!(run_git(repo, &["status", "--porcelain"]), "");
    }

    #[tokio::test]
    async fn test_clean_branch_rebases() {
        let repo = make_clean_repo();
        let manager = ConflictManager::new(GitRunner::new(repo.path()));

        let result = manager.resolve_conflicts("feature", "main").await.unwrap();
        assert!(result.success);
        assert_eq!(result.strategy, Some(ResolutionStrategy::Rebase));
        assert!(!result.needs_review);
        assert!(repo.path().join("main.txt").exists());
        assert_not_mid_operation(repo.path());
    }

    #[tokio::test]
    async fn test_conflict_falls_back_to_ours() {
        let repo = make_conflicting_repo();
        let manager = ConflictManager::new(GitRunner::new(repo.path()));

        let result = manager.resolve_conflicts("feature", "main").await.unwrap();
        assert!(result.success);
        assert_eq!(result.strategy, Some(ResolutionStrategy::OursPerFile));
        assert!(result.needs_review);
        assert_eq!(result.resolved_files, vec!["file.txt"]);
        assert_eq!(
            std::fs::read_to_string(repo.path().join("file.txt")).unwrap(),
            "one\nfeature\nthree\n"
        );
        assert_not_mid_operation(repo.path());

        // main is now an ancestor of feature
        let behind = run_git(repo.path(), &["rev-list", "--count", "feature..main"]);
        assert_eq!(behind.trim(), "0");
    }

    #[tokio::test]
    async fn test_unresolvable_file_aborts_whole_attempt() {
        // feature deletes the file main edits: there is no "ours" to keep
        let repo = make_git_repo();
        run_git(repo.path(), &["checkout", "-q", "-b", "feature"]);
        run_git(repo.path(), &["rm", "-q", "file.txt"]);
        run_git(repo.path(), &["commit", "-q", "-m", "drop file"]);
        let feature_head = run_git(repo.path(), &["rev-parse", "HEAD"]);
        run_git(repo.path(), &["checkout", "-q", "main"]);
        commit_file(repo.path(), "file.txt", "one\nchanged\nthree\n", "main edit");

        let manager = ConflictManager::new(GitRunner::new(repo.path()));
        let result = manager.resolve_conflicts("feature", "main").await.unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("file.txt"));
        assert!(result.resolved_files.is_empty());
        assert_not_mid_operation(repo.path());
        assert_eq!(run_git(repo.path(), &["rev-parse", "HEAD"]), feature_head);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_mid_merge_is_aborted() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        // The per-file strategy commits; a slow hook makes that commit time out
        let repo = make_conflicting_repo();
        let feature_head = run_git(repo.path(), &["rev-parse", "feature"]);
        let hook = repo.path().join(".git/hooks/pre-commit");
        std::fs::create_dir_all(hook.parent().unwrap()).unwrap();
        std::fs::write(&hook, "#!/bin/sh
sleep 5
").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

        let manager = ConflictManager::new(
            GitRunner::new(repo.path()).with_timeout(Duration::from_secs(2)),
        );
        let err = manager.resolve_conflicts("feature", "main").await.unwrap_err();

        assert!(matches!(err, GitError::Timeout { .. }));
        assert!(!repo.path().join(".git/index.lock").exists());
        assert_not_mid_operation(repo.path());
        assert_eq!(run_git(repo.path(), &["rev-parse", "HEAD"]), feature_head);
    }
}
