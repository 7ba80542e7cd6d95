//! The graduated recovery ladder.
//!
//! A workflow id climbs one rung per `attempt_recovery` call:
//!
//! | attempts | strategy           | retry? |
//! |----------|--------------------|--------|
//! | 0        | `SimpleRetry`      | yes    |
//! | 1        | `AdvancedRetry`    | yes    |
//! | 2+       | `TeamNotification` | no     |
//!
//! Permanent failures skip the ladder and go straight to the team.

use chrono::Utc;
use notify::{Notifier, NotifyEvent};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::classify::is_temporary;
use super::locks::KeyedLocks;
use super::state::{ErrorContext, ErrorState, RecoveryResult, RecoveryStrategy};
use super::store::{ErrorStateStore, StoreError};
use crate::error::{error_chain, WorkflowError};
use crate::github::{ActionsRun, IssueTracker, COMMENT_MARKER};
use crate::orchestrator::WorkflowRun;

/// Attempts after which the ladder stops retrying.
pub const MAX_RETRY_ATTEMPTS: u32 = 2;

/// Workflow runs fetched for an advanced retry.
const DIAGNOSTIC_RUNS: usize = 5;

/// Longest error excerpt quoted in an escalation comment.
const MAX_QUOTED_ERROR: usize = 2000;

/// Owns every [`ErrorState`] and decides what happens after a failure.
pub struct ErrorRecovery {
    store: Arc<dyn ErrorStateStore>,
    tracker: Arc<dyn IssueTracker>,
    notifier: Arc<Notifier>,
    escalate_label: Option<String>,
    timeout: Duration,
    locks: KeyedLocks,
}

impl ErrorRecovery {
    pub fn new(
        store: Arc<dyn ErrorStateStore>,
        tracker: Arc<dyn IssueTracker>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            tracker,
            notifier,
            escalate_label: Some("stone-error".to_string()),
            timeout: Duration::from_secs(120),
            locks: KeyedLocks::new(),
        }
    }

    /// Label added to escalated issues; `None` adds nothing.
    #[must_use]
    pub fn with_escalate_label(mut self, label: Option<String>) -> Self {
        self.escalate_label = label;
        self
    }

    /// Bound for the GitHub calls made while escalating.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Record a failure for `run`, keeping the attempt count of an earlier
    /// record for the same workflow id.
    pub async fn capture_error_state(
        &self,
        run: &WorkflowRun,
        err: &WorkflowError,
        step_data: BTreeMap<String, String>,
    ) -> Result<ErrorState, StoreError> {
        let _guard = self.locks.lock(&run.workflow_id).await;

        let previous = self.store.load(&run.workflow_id).await?;
        let state = ErrorState {
            workflow_id: run.workflow_id.clone(),
            error_kind: err.kind().to_string(),
            error_message: error_chain(err),
            context: ErrorContext {
                issue_number: run.issue_number,
                repo_owner: run.repo_owner.clone(),
                repo_name: run.repo_name.clone(),
                current_step: run.stage.slug().to_string(),
                step_data,
            },
            timestamp: Utc::now(),
            recovery_attempts: previous.map_or(0, |p| p.recovery_attempts),
        };
        self.store.save(&state).await?;

        info!(
            workflow_id = %state.workflow_id,
            current_step = %state.context.current_step,
            attempt = state.recovery_attempts,
            error_kind = %state.error_kind,
            "Captured error state"
        );
        Ok(state)
    }

    pub async fn get_error_state(&self, workflow_id: &str) -> Result<Option<ErrorState>, StoreError> {
        self.store.load(workflow_id).await
    }

    pub async fn list_error_states(&self) -> Result<Vec<ErrorState>, StoreError> {
        self.store.list().await
    }

    /// Delete the record once the retried stage has succeeded.
    pub async fn clear_error_state(&self, workflow_id: &str) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(workflow_id).await;
        let existed = self.store.delete(workflow_id).await?;
        if existed {
            info!(workflow_id, "Cleared error state");
        }
        Ok(existed)
    }

    /// Climb one rung for `workflow_id`.
    ///
    /// Calls for the same id are serialized, so concurrent callers each see
    /// the count the previous call persisted.
    pub async fn attempt_recovery(&self, workflow_id: &str) -> Result<RecoveryResult, StoreError> {
        let _guard = self.locks.lock(workflow_id).await;

        let mut state = self
            .store
            .load(workflow_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(workflow_id.to_string()))?;

        if !is_temporary(&state.error_message) {
            warn!(
                workflow_id,
                current_step = %state.context.current_step,
                attempt = state.recovery_attempts,
                "Permanent error, notifying team"
            );
            let escalated = self.escalate(&state, true).await;
            return Ok(RecoveryResult {
                success: false,
                recovery_strategy: RecoveryStrategy::TeamNotification,
                attempts: state.recovery_attempts,
                message: format!("Permanent error, team notified: {}", state.error_message),
                diagnostics: Vec::new(),
                escalated,
            });
        }

        let strategy = match state.recovery_attempts {
            0 => RecoveryStrategy::SimpleRetry,
            1 => RecoveryStrategy::AdvancedRetry,
            _ => RecoveryStrategy::TeamNotification,
        };
        state.recovery_attempts += 1;
        state.timestamp = Utc::now();
        self.store.save(&state).await?;

        info!(
            workflow_id,
            current_step = %state.context.current_step,
            attempt = state.recovery_attempts,
            strategy = %strategy,
            "Recovery rung selected"
        );

        let result = match strategy {
            RecoveryStrategy::SimpleRetry => RecoveryResult {
                success: true,
                recovery_strategy: strategy,
                attempts: state.recovery_attempts,
                message: "Transient failure, retrying".to_string(),
                diagnostics: Vec::new(),
                escalated: false,
            },
            RecoveryStrategy::AdvancedRetry => {
                let diagnostics = self.diagnostics(&state).await;
                let failing = diagnostics.iter().filter(|r| r.is_failure()).count();
                RecoveryResult {
                    success: true,
                    recovery_strategy: strategy,
                    attempts: state.recovery_attempts,
                    message: format!(
                        "Retrying with diagnostics ({failing} of {} recent workflow runs failing)",
                        diagnostics.len()
                    ),
                    diagnostics,
                    escalated: false,
                }
            }
            RecoveryStrategy::TeamNotification => {
                let escalated = self.escalate(&state, false).await;
                RecoveryResult {
                    success: false,
                    recovery_strategy: strategy,
                    attempts: state.recovery_attempts,
                    message: format!(
                        "Recovery exhausted after {} attempts, team notified",
                        state.recovery_attempts
                    ),
                    diagnostics: Vec::new(),
                    escalated,
                }
            }
        };
        Ok(result)
    }

    async fn diagnostics(&self, state: &ErrorState) -> Vec<ActionsRun> {
        let branch = state.context.step_data.get("branch").map(String::as_str);
        match tokio::time::timeout(
            self.timeout,
            self.tracker.latest_workflow_runs(branch, DIAGNOSTIC_RUNS),
        )
        .await
        {
            Ok(Ok(runs)) => runs,
            Ok(Err(e)) => {
                warn!(workflow_id = %state.workflow_id, error = %e, "Could not fetch workflow runs");
                Vec::new()
            }
            Err(_) => {
                warn!(workflow_id = %state.workflow_id, "Timed out fetching workflow runs");
                Vec::new()
            }
        }
    }

    /// Comment, label and alert. Returns whether the comment was posted.
    async fn escalate(&self, state: &ErrorState, permanent: bool) -> bool {
        let issue = state.context.issue_number;
        error!(
            workflow_id = %state.workflow_id,
            issue_number = issue,
            current_step = %state.context.current_step,
            attempt = state.recovery_attempts,
            permanent,
            "Escalating workflow failure"
        );

        let body = escalation_comment(state, permanent);
        let commented = match tokio::time::timeout(
            self.timeout,
            self.tracker.create_comment(issue, &body),
        )
        .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(issue_number = issue, error = %e, "Failed to post escalation comment");
                false
            }
            Err(_) => {
                warn!(issue_number = issue, "Timed out posting escalation comment");
                false
            }
        };

        if let Some(label) = &self.escalate_label {
            let labels = [label.clone()];
            match tokio::time::timeout(self.timeout, self.tracker.add_labels(issue, &labels)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(issue_number = issue, label, error = %e, "Failed to add escalation label"),
                Err(_) => warn!(issue_number = issue, label, "Timed out adding escalation label"),
            }
        }

        self.notifier
            .notify_and_wait(NotifyEvent::WorkflowEscalated {
                workflow_id: state.workflow_id.clone(),
                repository: format!("{}/{}", state.context.repo_owner, state.context.repo_name),
                issue_number: issue,
                stage: state.context.current_step.clone(),
                error: state.error_message.clone(),
                attempts: state.recovery_attempts,
                permanent,
                context: state.context.step_data.clone(),
                timestamp: Utc::now(),
            })
            .await;

        commented
    }
}

fn escalation_comment(state: &ErrorState, permanent: bool) -> String {
    let mut msg = String::new();
    msg.push_str(COMMENT_MARKER);
    msg.push_str("\n## 🚨 Stone workflow escalation\n\n");
    if permanent {
        msg.push_str("The failure below is not transient, so it was not retried.\n\n");
    } else {
        let _ = writeln!(
            msg,
            "Automated recovery gave up after **{} attempts**.\n",
            state.recovery_attempts
        );
    }
    let _ = writeln!(msg, "- **Workflow**: `{}`", state.workflow_id);
    let _ = writeln!(msg, "- **Step**: `{}`", state.context.current_step);
    let _ = writeln!(msg, "- **Error kind**: `{}`", state.error_kind);
    for (key, value) in &state.context.step_data {
        let _ = writeln!(msg, "- **{key}**: `{value}`");
    }

    msg.push_str("\n### Last Error\n\n```\n");
    msg.push_str(&truncate_chars(&state.error_message, MAX_QUOTED_ERROR));
    msg.push_str("\n```\n\n---\n");
    msg.push_str("*This issue requires manual intervention. Once the root cause is fixed, ");
    let _ = writeln!(
        msg,
        "run `stone recovery clear {}` and remove the error label.*",
        state.workflow_id
    );
    msg
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...(truncated)", &text[..idx]),
        None => text.to_string(),
    }
}
