//! Workflow orchestration.
//!
//! One run handles one issue: read its labels once, resolve the active
//! stage, hand it to that stage's handler and apply the label transition the
//! handler asks for. Failures are captured and walked up the recovery ladder
//! before the original error is returned.

use chrono::{DateTime, Utc};
use notify::{Notifier, NotifyEvent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use stone_config::WorkflowConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{bounded, error_chain, WorkflowError};
use crate::github::{IssueTracker, COMMENT_MARKER};
use crate::handlers::{HandlerRegistry, LabelTransition, StageInput, StageOutcome};
use crate::recovery::{ErrorRecovery, RecoveryResult};
use crate::stage::{LabelSet, Stage};

/// One attempt at one stage of one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    /// `{owner}-{repo}-{issue}-{stage}`; stable across retries of a stage
    pub workflow_id: String,
    pub issue_number: u64,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub repo_owner: String,
    pub repo_name: String,
}

impl WorkflowRun {
    pub fn new(owner: &str, repo: &str, issue_number: u64, stage: Stage) -> Self {
        Self {
            workflow_id: format!("{owner}-{repo}-{issue_number}-{}", stage.slug()),
            issue_number,
            stage,
            started_at: Utc::now(),
            repo_owner: owner.to_string(),
            repo_name: repo.to_string(),
        }
    }
}

/// Result of a run plus the recovery decision taken for it, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub result: Result<Option<Stage>, WorkflowError>,
    pub recovery: Option<RecoveryResult>,
}

impl RunOutcome {
    fn done(result: Result<Option<Stage>, WorkflowError>) -> Self {
        Self {
            result,
            recovery: None,
        }
    }

    /// Whether the ladder asked for another attempt.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.result.is_err() && self.recovery.as_ref().is_some_and(|r| r.success)
    }
}

/// Drives issues through their stages.
pub struct Orchestrator {
    tracker: Arc<dyn IssueTracker>,
    handlers: HandlerRegistry,
    recovery: Arc<ErrorRecovery>,
    notifier: Arc<Notifier>,
    workflow: WorkflowConfig,
    owner: String,
    repo: String,
    retry_backoff: Duration,
}

impl Orchestrator {
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        handlers: HandlerRegistry,
        recovery: Arc<ErrorRecovery>,
        notifier: Arc<Notifier>,
        workflow: WorkflowConfig,
    ) -> Self {
        let repository = tracker.repository();
        let (owner, repo) = repository
            .split_once('/')
            .unwrap_or((repository.as_str(), ""));
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            tracker,
            handlers,
            recovery,
            notifier,
            workflow,
            retry_backoff: Duration::from_secs(5),
        }
    }

    /// Base delay between ladder retries; doubled per attempt.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<ErrorRecovery> {
        &self.recovery
    }

    /// Run the active stage of `issue_number` once.
    ///
    /// Returns the stage the issue resolves to afterwards; `None` once no
    /// dispatchable label remains.
    pub async fn run_workflow(
        &self,
        issue_number: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<Stage>, WorkflowError> {
        self.run_workflow_detailed(issue_number, cancel).await.result
    }

    /// [`Orchestrator::run_workflow`] plus the recovery decision.
    #[instrument(skip(self, cancel), fields(repository = %format!("{}/{}", self.owner, self.repo)))]
    pub async fn run_workflow_detailed(
        &self,
        issue_number: u64,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let timeout = self.workflow.timeout();

        if let Err(e) = checkpoint(cancel, "fetching issue") {
            return RunOutcome::done(Err(e));
        }
        let issue = match bounded(timeout, "github.get_issue", self.tracker.get_issue(issue_number)).await {
            Ok(issue) => issue,
            Err(e) => {
                error!(issue_number, error = %e, "Failed to fetch issue");
                return RunOutcome::done(Err(e));
            }
        };
        let labels: LabelSet = issue.labels.iter().cloned().collect();

        let Some(stage) = labels.active_stage() else {
            info!(issue_number, labels = ?issue.labels, "No active stage, nothing to do");
            return RunOutcome::done(Err(WorkflowError::NoActiveStage { issue_number }));
        };
        let run = WorkflowRun::new(&self.owner, &self.repo, issue_number, stage);
        info!(workflow_id = %run.workflow_id, stage = %stage, "Running stage");

        let handler = match self.handlers.get(stage) {
            Ok(handler) => handler,
            Err(e) => return self.handle_failure(&run, e).await,
        };

        if let Err(e) = checkpoint(cancel, "running handler") {
            return self.handle_failure(&run, e).await;
        }
        let input = StageInput {
            run: run.clone(),
            issue,
            labels: labels.clone(),
        };
        let processed = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(WorkflowError::Cancelled {
                step: format!("{} handler finished", handler.name()),
            }),
            outcome = handler.process(&input) => outcome,
        };

        let result = match processed {
            Ok(StageOutcome::Advance(transition)) => {
                match checkpoint(cancel, "applying labels") {
                    Ok(()) => self.apply_transition(&run, &labels, &transition).await,
                    Err(e) => Err(e),
                }
            }
            Ok(StageOutcome::Hold { reason }) => {
                info!(workflow_id = %run.workflow_id, reason = %reason, "Stage holding");
                Ok(labels)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(after) => {
                if let Err(e) = self.recovery.clear_error_state(&run.workflow_id).await {
                    warn!(workflow_id = %run.workflow_id, error = %e, "Failed to clear error state");
                }
                RunOutcome::done(Ok(after.active_stage()))
            }
            Err(e) => self.handle_failure(&run, e).await,
        }
    }

    /// Run `issue_number` until it succeeds or the ladder stops retrying.
    pub async fn run_with_retries(
        &self,
        issue_number: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<Stage>, WorkflowError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = self.run_workflow_detailed(issue_number, cancel).await;
            if !outcome.should_retry() {
                return outcome.result;
            }
            let delay = self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt));
            attempt += 1;
            info!(issue_number, attempt, delay_ms = delay.as_millis() as u64, "Retrying after backoff");
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(WorkflowError::Cancelled { step: "retry backoff".to_string() });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run several issues concurrently, one task per distinct issue.
    pub async fn run_batch(
        self: &Arc<Self>,
        issues: &[u64],
        cancel: &CancellationToken,
    ) -> Vec<(u64, Result<Option<Stage>, WorkflowError>)> {
        let mut distinct = issues.to_vec();
        distinct.sort_unstable();
        distinct.dedup();

        let mut tasks = JoinSet::new();
        for issue_number in distinct {
            let orchestrator = Arc::clone(self);
            let cancel = cancel.child_token();
            tasks.spawn(async move {
                let result = orchestrator.run_with_retries(issue_number, &cancel).await;
                (issue_number, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => error!(error = %e, "Workflow task panicked"),
            }
        }
        results.sort_by_key(|(issue, _)| *issue);
        results
    }

    /// Add first, then drop the current stage label and any cleared labels
    /// that are present.
    async fn apply_transition(
        &self,
        run: &WorkflowRun,
        labels: &LabelSet,
        transition: &LabelTransition,
    ) -> Result<LabelSet, WorkflowError> {
        let timeout = self.workflow.timeout();
        let add: Vec<String> = transition
            .add
            .iter()
            .filter(|l| !labels.contains(l))
            .cloned()
            .collect();
        if !add.is_empty() {
            bounded(
                timeout,
                "github.add_labels",
                self.tracker.add_labels(run.issue_number, &add),
            )
            .await?;
        }

        let mut remove = vec![run.stage.label()];
        remove.extend(transition.clear.iter().filter(|l| labels.contains(l)).cloned());
        remove.retain(|l| !transition.add.contains(l));
        remove.dedup();
        for label in &remove {
            bounded(
                timeout,
                "github.remove_label",
                self.tracker.remove_label(run.issue_number, label),
            )
            .await?;
        }

        info!(
            workflow_id = %run.workflow_id,
            added = ?add,
            removed = ?remove,
            "Applied label transition"
        );
        Ok(labels.apply(&transition.add, &remove))
    }

    async fn handle_failure(&self, run: &WorkflowRun, err: WorkflowError) -> RunOutcome {
        error!(
            workflow_id = %run.workflow_id,
            stage = %run.stage,
            error_kind = err.kind(),
            error = %error_chain(&err),
            "Stage failed"
        );

        if err.is_fatal() {
            if matches!(err, WorkflowError::Configuration(_)) {
                self.post_failure_comment(run, &err, None).await;
            }
            return RunOutcome {
                result: Err(err),
                recovery: None,
            };
        }

        let mut step_data = BTreeMap::new();
        step_data.insert("branch".to_string(), self.workflow.branch_for(run.issue_number));
        step_data.insert("stageLabel".to_string(), run.stage.label());

        let recovery = match self.recovery.capture_error_state(run, &err, step_data).await {
            Ok(_) => match self.recovery.attempt_recovery(&run.workflow_id).await {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(workflow_id = %run.workflow_id, error = %e, "Recovery attempt failed");
                    None
                }
            },
            Err(e) => {
                warn!(workflow_id = %run.workflow_id, error = %e, "Failed to capture error state");
                None
            }
        };

        if recovery.as_ref().is_some_and(|r| r.escalated) {
            debug!(workflow_id = %run.workflow_id, "Escalation already commented");
        } else {
            self.post_failure_comment(run, &err, recovery.as_ref()).await;
        }

        self.notifier.notify(NotifyEvent::StageFailed {
            workflow_id: run.workflow_id.clone(),
            repository: format!("{}/{}", run.repo_owner, run.repo_name),
            issue_number: run.issue_number,
            stage: run.stage.slug().to_string(),
            error: error_chain(&err),
            attempt: recovery.as_ref().map_or(0, |r| r.attempts),
            timestamp: Utc::now(),
        });

        RunOutcome {
            result: Err(err),
            recovery,
        }
    }

    async fn post_failure_comment(
        &self,
        run: &WorkflowRun,
        err: &WorkflowError,
        recovery: Option<&RecoveryResult>,
    ) {
        let body = failure_comment(run, err, recovery);
        match bounded(
            self.workflow.timeout(),
            "github.create_comment",
            self.tracker.create_comment(run.issue_number, &body),
        )
        .await
        {
            Ok(_) => {}
            Err(e) => warn!(workflow_id = %run.workflow_id, error = %e, "Failed to post failure comment"),
        }
    }
}

fn checkpoint(cancel: &CancellationToken, step: &str) -> Result<(), WorkflowError> {
    if cancel.is_cancelled() {
        return Err(WorkflowError::Cancelled {
            step: step.to_string(),
        });
    }
    Ok(())
}

fn failure_comment(run: &WorkflowRun, err: &WorkflowError, recovery: Option<&RecoveryResult>) -> String {
    let mut msg = String::new();
    msg.push_str(COMMENT_MARKER);
    let _ = writeln!(msg, "\n## ❌ {} stage failed\n", run.stage.display_name());
    let _ = writeln!(msg, "- **Workflow**: `{}`", run.workflow_id);
    let _ = writeln!(msg, "- **Error kind**: `{}`", err.kind());
    match recovery {
        Some(result) => {
            let _ = writeln!(
                msg,
                "- **Recovery**: {} (attempt {}): {}",
                result.recovery_strategy, result.attempts, result.message
            );
            for ci in &result.diagnostics {
                let _ = writeln!(
                    msg,
                    "  - {} `{}`: {}",
                    ci.name,
                    ci.conclusion.as_deref().unwrap_or(ci.status.as_str()),
                    ci.html_url
                );
            }
        }
        None if err.is_fatal() => {
            msg.push_str("- **Recovery**: none, this needs a configuration change\n");
        }
        None => msg.push_str("- **Recovery**: unavailable\n"),
    }
    msg.push_str("\n```\n");
    msg.push_str(&error_chain(err));
    msg.push_str("\n```\n");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::fake::FakeTracker;
    use crate::github::GitHubError;
    use crate::handlers::RoleHandler;
    use crate::recovery::{MemoryErrorStore, RecoveryStrategy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then advances to `next`.
    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        next: Stage,
    }

    impl Flaky {
        fn new(failures: usize, next: Stage) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                next,
            }
        }
    }

    #[async_trait]
    impl RoleHandler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn process(&self, _input: &StageInput) -> Result<StageOutcome, WorkflowError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(WorkflowError::GitHub(GitHubError::RateLimited(
                    "API rate limit exceeded".to_string(),
                )));
            }
            Ok(StageOutcome::Advance(LabelTransition::to(self.next)))
        }
    }

    struct Slow;

    #[async_trait]
    impl RoleHandler for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn process(&self, _input: &StageInput) -> Result<StageOutcome, WorkflowError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StageOutcome::Hold {
                reason: "slow".to_string(),
            })
        }
    }

    struct Permanent;

    #[async_trait]
    impl RoleHandler for Permanent {
        fn name(&self) -> &'static str {
            "permanent"
        }

        async fn process(&self, _input: &StageInput) -> Result<StageOutcome, WorkflowError> {
            Err(WorkflowError::GitHub(GitHubError::Forbidden(
                "Resource not accessible by integration".to_string(),
            )))
        }
    }

    fn orchestrator(
        tracker: &Arc<FakeTracker>,
        stage: Stage,
        handler: Arc<dyn RoleHandler>,
    ) -> Orchestrator {
        let notifier = Arc::new(Notifier::disabled());
        let recovery = Arc::new(ErrorRecovery::new(
            Arc::new(MemoryErrorStore::new()),
            tracker.clone(),
            Arc::clone(&notifier),
        ));
        let handlers = HandlerRegistry::builder()
            .register(stage, handler)
            .build(&[stage])
            .unwrap();
        Orchestrator::new(
            tracker.clone(),
            handlers,
            recovery,
            notifier,
            WorkflowConfig::default(),
        )
        .with_retry_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_workflow_id_is_deterministic() {
        let a = WorkflowRun::new("acme", "widgets", 42, Stage::FeatureImplement);
        let b = WorkflowRun::new("acme", "widgets", 42, Stage::FeatureImplement);
        assert_eq!(a.workflow_id, "acme-widgets-42-feature-implement");
        assert_eq!(a.workflow_id, b.workflow_id);
    }

    #[tokio::test]
    async fn test_labels_added_before_removed() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["stone-process", "enhancement"]));
        let orch = orchestrator(&tracker, Stage::Process, Arc::new(Flaky::new(0, Stage::Qa)));

        let next = orch.run_workflow(42, &CancellationToken::new()).await.unwrap();
        assert_eq!(next, Some(Stage::Qa));

        let ops = tracker.ops();
        let added = ops.iter().position(|o| o == "add:stone-qa").unwrap();
        let removed = ops.iter().position(|o| o == "remove:stone-process").unwrap();
        assert!(added < removed, "{ops:?}");

        let mut labels = tracker.labels(42);
        labels.sort();
        assert_eq!(labels, vec!["enhancement", "stone-qa"]);
    }

    #[tokio::test]
    async fn test_cleared_labels_only_removed_when_present() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["stone-feature-fix", "stone-audit-fail"]));
        let handler = {
            struct Fix;
            #[async_trait]
            impl RoleHandler for Fix {
                fn name(&self) -> &'static str {
                    "fix"
                }
                async fn process(&self, _input: &StageInput) -> Result<StageOutcome, WorkflowError> {
                    Ok(StageOutcome::Advance(
                        LabelTransition::to(Stage::Audit)
                            .clearing(Stage::AuditFail)
                            .clearing(Stage::TestFailure),
                    ))
                }
            }
            Arc::new(Fix)
        };
        let orch = orchestrator(&tracker, Stage::FeatureFix, handler);

        orch.run_workflow(42, &CancellationToken::new()).await.unwrap();
        let ops = tracker.ops();
        assert!(ops.contains(&"remove:stone-audit-fail".to_string()));
        assert!(!ops.contains(&"remove:stone-test-failure".to_string()));
        assert_eq!(tracker.labels(42), vec!["stone-audit"]);
    }

    #[tokio::test]
    async fn test_no_active_stage_is_noop() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["bug", "stone-complete"]));
        let orch = orchestrator(&tracker, Stage::Process, Arc::new(Flaky::new(0, Stage::Qa)));

        let err = orch.run_workflow(42, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NoActiveStage { issue_number: 42 }));
        assert!(tracker.comments(42).is_empty());
    }

    #[tokio::test]
    async fn test_disabled_stage_bypasses_recovery() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["stone-qa"]));
        let orch = orchestrator(&tracker, Stage::Process, Arc::new(Flaky::new(0, Stage::Qa)));

        let outcome = orch.run_workflow_detailed(42, &CancellationToken::new()).await;
        assert!(matches!(outcome.result, Err(WorkflowError::Configuration(_))));
        assert!(outcome.recovery.is_none());
        assert!(orch.recovery().list_error_states().await.unwrap().is_empty());
        assert!(tracker.comments(42)[0].contains("configuration change"));
        assert_eq!(tracker.labels(42), vec!["stone-qa"]);
    }

    #[tokio::test]
    async fn test_failures_climb_the_ladder() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["stone-qa"]));
        let orch = orchestrator(&tracker, Stage::Qa, Arc::new(Flaky::new(10, Stage::Actions)));
        let cancel = CancellationToken::new();

        let strategies: Vec<RecoveryStrategy> = {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let outcome = orch.run_workflow_detailed(42, &cancel).await;
                assert!(matches!(outcome.result, Err(WorkflowError::GitHub(_))));
                seen.push(outcome.recovery.unwrap().recovery_strategy);
            }
            seen
        };
        assert_eq!(
            strategies,
            vec![
                RecoveryStrategy::SimpleRetry,
                RecoveryStrategy::AdvancedRetry,
                RecoveryStrategy::TeamNotification,
            ]
        );

        let comments = tracker.comments(42);
        assert_eq!(comments.len(), 3);
        assert!(comments[0].contains("simple retry (attempt 1)"));
        assert!(comments[1].contains("advanced retry (attempt 2)"));
        assert!(comments[2].contains("escalation"));
        assert!(tracker.labels(42).contains(&"stone-error".to_string()));
        assert!(tracker.labels(42).contains(&"stone-qa".to_string()));
    }

    #[tokio::test]
    async fn test_permanent_failure_escalates_immediately() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["stone-docs"]));
        let orch = orchestrator(&tracker, Stage::Docs, Arc::new(Permanent));

        let outcome = orch.run_workflow_detailed(42, &CancellationToken::new()).await;
        let recovery = outcome.recovery.as_ref().unwrap();
        assert!(!recovery.success);
        assert_eq!(recovery.attempts, 0);
        assert!(!outcome.should_retry());
        assert_eq!(tracker.comments(42).len(), 1);
    }

    #[tokio::test]
    async fn test_success_clears_error_state() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["stone-qa"]));
        let orch = orchestrator(&tracker, Stage::Qa, Arc::new(Flaky::new(1, Stage::Actions)));
        let cancel = CancellationToken::new();
        let workflow_id = "acme-widgets-42-qa";

        assert!(orch.run_workflow(42, &cancel).await.is_err());
        assert!(orch.recovery().get_error_state(workflow_id).await.unwrap().is_some());

        assert_eq!(orch.run_workflow(42, &cancel).await.unwrap(), Some(Stage::Actions));
        assert!(orch.recovery().get_error_state(workflow_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_with_retries_recovers() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["stone-qa"]));
        let orch = orchestrator(&tracker, Stage::Qa, Arc::new(Flaky::new(2, Stage::Actions)));

        let next = orch.run_with_retries(42, &CancellationToken::new()).await.unwrap();
        assert_eq!(next, Some(Stage::Actions));
    }

    #[tokio::test]
    async fn test_run_with_retries_stops_at_escalation() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["stone-qa"]));
        let handler = Arc::new(Flaky::new(10, Stage::Actions));
        let orch = orchestrator(&tracker, Stage::Qa, handler.clone());

        assert!(orch.run_with_retries(42, &CancellationToken::new()).await.is_err());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["stone-qa"]));
        let orch = orchestrator(&tracker, Stage::Qa, Arc::new(Flaky::new(0, Stage::Actions)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch.run_workflow(42, &cancel).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled { .. }));
        assert!(tracker.ops().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_handler() {
        let tracker = Arc::new(FakeTracker::new().with_issue(42, &["stone-qa"]));
        let orch = orchestrator(&tracker, Stage::Qa, Arc::new(Slow));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = orch.run_workflow_detailed(42, &cancel).await;
        assert!(matches!(outcome.result, Err(WorkflowError::Cancelled { .. })));
        assert!(outcome.recovery.is_none());
        assert_eq!(tracker.labels(42), vec!["stone-qa"]);
        assert!(tracker.comments(42).is_empty());
    }

    #[tokio::test]
    async fn test_batch_runs_each_issue_once() {
        let tracker = Arc::new(
            FakeTracker::new()
                .with_issue(1, &["stone-process"])
                .with_issue(2, &["stone-process"]),
        );
        let orch = Arc::new(orchestrator(&tracker, Stage::Process, Arc::new(Flaky::new(0, Stage::Qa))));

        let results = orch.run_batch(&[2, 1, 2], &CancellationToken::new()).await;
        let issues: Vec<u64> = results.iter().map(|(n, _)| *n).collect();
        assert_eq!(issues, vec![1, 2]);
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(Some(Stage::Qa)))));
        assert_eq!(
            tracker.ops().iter().filter(|o| *o == "add:stone-qa").count(),
            2
        );
    }
}
