//! Standard role handlers.

use async_trait::async_trait;
use chrono::Utc;
use notify::{Notifier, NotifyEvent};
use regex::Regex;
use std::fmt::Write as _;
use std::path::{Component, Path};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use stone_config::WorkflowConfig;
use tracing::{debug, info, instrument, warn};

use super::prompts::{PromptContext, PromptLibrary};
use super::{LabelTransition, RoleHandler, StageInput, StageOutcome};
use crate::conflict::ConflictManager;
use crate::error::{bounded, WorkflowError};
use crate::github::{FileWrite, IssueTracker, NewPullRequest, PullRequestUpdate, COMMENT_MARKER};
use crate::llm::LanguageModel;
use crate::recovery::ErrorRecovery;
use crate::stage::Stage;

static FILE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^--- FILE:[ \t]*([^\n]*?)[ \t]*\n(.*?)^--- END FILE[ \t]*$").unwrap()
});

static VERDICT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^[\s*_]*VERDICT[*_]*:[\s*_]*(PASS|FAIL)\b").unwrap());

static TESTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^[\s*_]*TESTS[*_]*:[\s*_]*(PASS|FAIL)\b").unwrap());

/// Shared dependencies of every handler.
pub struct HandlerContext {
    pub tracker: Arc<dyn IssueTracker>,
    pub llm: Arc<dyn LanguageModel>,
    pub prompts: PromptLibrary,
    pub notifier: Arc<Notifier>,
    pub recovery: Arc<ErrorRecovery>,
    /// Local clone for the PR stage; `None` skips conflict handling
    pub conflicts: Option<ConflictManager>,
    pub workflow: WorkflowConfig,
    /// Branch feature branches are reconciled against
    pub target_branch: String,
}

impl HandlerContext {
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        llm: Arc<dyn LanguageModel>,
        notifier: Arc<Notifier>,
        recovery: Arc<ErrorRecovery>,
        workflow: WorkflowConfig,
    ) -> Result<Self, WorkflowError> {
        let target_branch = workflow.base_branch.clone();
        Ok(Self {
            tracker,
            llm,
            prompts: PromptLibrary::new()?,
            notifier,
            recovery,
            conflicts: None,
            workflow,
            target_branch,
        })
    }

    #[must_use]
    pub fn with_prompts(mut self, prompts: PromptLibrary) -> Self {
        self.prompts = prompts;
        self
    }

    #[must_use]
    pub fn with_conflicts(mut self, manager: ConflictManager, target_branch: impl Into<String>) -> Self {
        self.conflicts = Some(manager);
        self.target_branch = target_branch.into();
        self
    }

    fn timeout(&self) -> Duration {
        self.workflow.timeout()
    }

    fn prompt_context(&self, stage: Stage, input: &StageInput) -> PromptContext {
        PromptContext {
            repository: self.tracker.repository(),
            issue_number: input.issue.number,
            title: input.issue.title.clone(),
            body: input.issue.body.clone(),
            stage: stage.display_name().to_string(),
            branch: self.workflow.branch_for(input.issue.number),
            labels: input.labels.iter().map(str::to_string).collect(),
        }
    }

    /// Render the stage prompt and ask the model.
    async fn generate(&self, stage: Stage, input: &StageInput) -> Result<String, WorkflowError> {
        let prompt = self.prompts.render(stage, &self.prompt_context(stage, input))?;
        let response = bounded(
            self.timeout(),
            "llm.generate",
            self.llm.generate(&prompt, PromptLibrary::system_prompt(stage)),
        )
        .await?;
        debug!(
            issue_number = input.issue.number,
            stage = %stage,
            response_len = response.len(),
            "Model responded"
        );
        Ok(response)
    }

    async fn comment(&self, issue_number: u64, body: &str) -> Result<(), WorkflowError> {
        let body = format!("{COMMENT_MARKER}\n{body}");
        bounded(
            self.timeout(),
            "github.create_comment",
            self.tracker.create_comment(issue_number, &body),
        )
        .await?;
        Ok(())
    }
}

/// Next stage on the success path, or a handler error for stages without one.
fn forward(stage: Stage) -> Result<LabelTransition, WorkflowError> {
    stage
        .next()
        .map(LabelTransition::to)
        .ok_or_else(|| WorkflowError::handler(stage, "stage has no forward transition"))
}

/// Posts the model's answer as a comment and moves on. Used for planning
/// roles that produce text only.
pub struct PromptedRoleHandler {
    stage: Stage,
    ctx: Arc<HandlerContext>,
}

impl PromptedRoleHandler {
    pub fn new(stage: Stage, ctx: Arc<HandlerContext>) -> Self {
        Self { stage, ctx }
    }
}

#[async_trait]
impl RoleHandler for PromptedRoleHandler {
    fn name(&self) -> &'static str {
        match self.stage {
            Stage::Process => "product-manager",
            Stage::Qa => "qa",
            _ => "prompted-role",
        }
    }

    #[instrument(skip_all, fields(issue_number = input.issue.number, stage = %self.stage))]
    async fn process(&self, input: &StageInput) -> Result<StageOutcome, WorkflowError> {
        let transition = forward(self.stage)?;
        let response = self.ctx.generate(self.stage, input).await?;
        if response.trim().is_empty() {
            return Err(WorkflowError::handler(self.stage, "model returned only whitespace"));
        }
        self.ctx
            .comment(
                input.issue.number,
                &format!("## {}\n\n{}", self.stage.display_name(), response.trim()),
            )
            .await?;
        Ok(StageOutcome::Advance(transition))
    }
}

/// A file the model asked to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// Extract `--- FILE:` blocks from a model response.
pub(crate) fn parse_file_blocks(response: &str) -> Vec<GeneratedFile> {
    FILE_BLOCK
        .captures_iter(response)
        .map(|caps| GeneratedFile {
            path: caps[1].trim().trim_matches('`').to_string(),
            content: strip_code_fence(&caps[2]),
        })
        .collect()
}

/// Drop a Markdown fence wrapped around a whole file body.
fn strip_code_fence(content: &str) -> String {
    let trimmed = content.trim_end_matches(['\n', '\r']);
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let (Some(newline), true) = (rest.find('\n'), rest.ends_with("```")) {
            let inner = &rest[newline + 1..rest.len() - 3];
            return inner.to_string();
        }
    }
    content.to_string()
}

/// Relative path that stays inside the repository.
fn is_safe_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Writes the model's files to the issue branch through the contents API.
pub struct CodeWritingHandler {
    stage: Stage,
    ctx: Arc<HandlerContext>,
}

impl CodeWritingHandler {
    pub fn new(stage: Stage, ctx: Arc<HandlerContext>) -> Self {
        Self { stage, ctx }
    }

    fn transition(&self) -> Result<LabelTransition, WorkflowError> {
        let transition = forward(self.stage)?;
        Ok(match self.stage {
            Stage::FeatureFix => transition
                .clearing(Stage::AuditFail)
                .clearing(Stage::TestFailure),
            _ => transition,
        })
    }
}

#[async_trait]
impl RoleHandler for CodeWritingHandler {
    fn name(&self) -> &'static str {
        match self.stage {
            Stage::Actions => "actions",
            Stage::FeatureImplement => "implementer",
            Stage::FeatureFix => "fixer",
            Stage::Docs => "docs",
            _ => "code-writer",
        }
    }

    #[instrument(skip_all, fields(issue_number = input.issue.number, stage = %self.stage))]
    async fn process(&self, input: &StageInput) -> Result<StageOutcome, WorkflowError> {
        let transition = self.transition()?;
        let issue_number = input.issue.number;
        let branch = self.ctx.workflow.branch_for(issue_number);
        let timeout = self.ctx.timeout();

        bounded(
            timeout,
            "github.ensure_branch",
            self.ctx.tracker.ensure_branch(&branch, &self.ctx.workflow.base_branch),
        )
        .await?;

        let response = self.ctx.generate(self.stage, input).await?;
        let files = parse_file_blocks(&response);
        if files.is_empty() {
            return Err(WorkflowError::handler(
                self.stage,
                "model response contained no FILE blocks",
            ));
        }
        if let Some(bad) = files.iter().find(|f| !is_safe_path(&f.path)) {
            return Err(WorkflowError::handler(
                self.stage,
                format!("refusing to write outside the repository: {}", bad.path),
            ));
        }

        for file in &files {
            let existing = bounded(
                timeout,
                "github.get_file_content",
                self.ctx.tracker.get_file_content(&file.path, &branch),
            )
            .await?;
            let write = FileWrite {
                path: file.path.clone(),
                content: file.content.clone(),
                message: format!(
                    "{}: update {} for #{issue_number}",
                    self.stage.slug(),
                    file.path
                ),
                branch: branch.clone(),
                sha: existing.map(|f| f.sha),
            };
            bounded(
                timeout,
                "github.create_or_update_file",
                self.ctx.tracker.create_or_update_file(&write),
            )
            .await?;
            debug!(issue_number, path = %file.path, branch = %branch, "Wrote file");
        }

        info!(issue_number, files = files.len(), branch = %branch, "Committed generated files");

        let mut body = format!(
            "## {}\n\nCommitted {} file(s) to `{branch}`:\n\n",
            self.stage.display_name(),
            files.len()
        );
        for file in &files {
            let _ = writeln!(body, "- `{}`", file.path);
        }
        self.ctx.comment(issue_number, &body).await?;

        Ok(StageOutcome::Advance(transition))
    }
}

/// Review roles that end in a PASS/FAIL line.
pub struct GateHandler {
    stage: Stage,
    verdict: &'static LazyLock<Regex>,
    pass: LabelTransition,
    fail: LabelTransition,
    ctx: Arc<HandlerContext>,
}

impl GateHandler {
    /// Audit: pass moves on to testing, fail sends the issue back for a fix.
    pub fn audit(ctx: Arc<HandlerContext>) -> Self {
        Self {
            stage: Stage::Audit,
            verdict: &VERDICT,
            pass: LabelTransition::to(Stage::ReadyForTests)
                .with_marker(Stage::AuditPass)
                .clearing(Stage::AuditFail),
            fail: LabelTransition::to(Stage::FeatureFix)
                .with_marker(Stage::AuditFail)
                .clearing(Stage::AuditPass),
            ctx,
        }
    }

    /// Test run: pass moves on to docs, fail sends the issue back for a fix.
    pub fn tests(ctx: Arc<HandlerContext>) -> Self {
        Self {
            stage: Stage::ReadyForTests,
            verdict: &TESTS,
            pass: LabelTransition::to(Stage::Docs).clearing(Stage::TestFailure),
            fail: LabelTransition::to(Stage::FeatureFix).with_marker(Stage::TestFailure),
            ctx,
        }
    }

    /// Last verdict line wins; `None` when the model gave none.
    fn verdict(&self, response: &str) -> Option<bool> {
        self.verdict
            .captures_iter(response)
            .last()
            .map(|caps| caps[1].eq_ignore_ascii_case("PASS"))
    }
}

#[async_trait]
impl RoleHandler for GateHandler {
    fn name(&self) -> &'static str {
        match self.stage {
            Stage::Audit => "auditor",
            _ => "test-gate",
        }
    }

    #[instrument(skip_all, fields(issue_number = input.issue.number, stage = %self.stage))]
    async fn process(&self, input: &StageInput) -> Result<StageOutcome, WorkflowError> {
        let response = self.ctx.generate(self.stage, input).await?;
        let passed = self
            .verdict(&response)
            .ok_or_else(|| WorkflowError::handler(self.stage, "model response carried no verdict"))?;

        info!(issue_number = input.issue.number, passed, "Gate decided");
        let heading = if passed { "✅ passed" } else { "❌ failed" };
        self.ctx
            .comment(
                input.issue.number,
                &format!(
                    "## {} {heading}\n\n{}",
                    self.stage.display_name(),
                    response.trim()
                ),
            )
            .await?;

        let transition = if passed { &self.pass } else { &self.fail };
        Ok(StageOutcome::Advance(transition.clone()))
    }
}

/// Reconciles the branch with its target and opens or refreshes the PR.
pub struct PullRequestHandler {
    ctx: Arc<HandlerContext>,
}

impl PullRequestHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    async fn reconcile(&self, issue_number: u64, branch: &str) -> Result<(), WorkflowError> {
        let Some(conflicts) = &self.ctx.conflicts else {
            return Ok(());
        };
        let target = self.ctx.target_branch.as_str();
        let timeout = self.ctx.timeout();

        conflicts.fetch().await?;
        let detection = bounded(
            timeout,
            "git.detect_conflicts",
            conflicts.detect_conflicts(branch, target),
        )
        .await?;
        if !detection.has_conflicts {
            debug!(issue_number, branch, target, "No conflicts");
            return Ok(());
        }

        warn!(
            issue_number,
            branch,
            target,
            files = ?detection.conflicting_files,
            "Branch conflicts with target, resolving"
        );
        // Each git call inside is bounded by the runner timeout
        let resolution = conflicts.resolve_conflicts(branch, target).await?;

        if !resolution.success {
            self.ctx.notifier.notify(NotifyEvent::ConflictsUnresolved {
                repository: self.ctx.tracker.repository(),
                branch: branch.to_string(),
                target_branch: target.to_string(),
                files: detection.conflicting_files.clone(),
                timestamp: Utc::now(),
            });
            let mut body = format!(
                "## ⚠️ Merge conflicts\n\n`{branch}` conflicts with `{target}` and could not be resolved automatically.\n\n"
            );
            for file in &detection.conflicting_files {
                let _ = writeln!(body, "- `{file}`");
            }
            if let Some(error) = &resolution.error {
                let _ = write!(body, "\nLast attempt: {error}\n");
            }
            self.ctx.comment(issue_number, &body).await?;
            return Err(WorkflowError::handler(
                Stage::Pr,
                format!(
                    "unresolved conflicts with {target} in {} file(s)",
                    detection.conflicting_files.len()
                ),
            ));
        }

        if resolution.needs_review {
            let mut body = format!(
                "## 🔍 Conflicts resolved mechanically\n\nThe `{branch}` side was kept for these files. Please review them before merging:\n\n"
            );
            for file in &resolution.resolved_files {
                let _ = writeln!(body, "- `{file}`");
            }
            self.ctx.comment(issue_number, &body).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RoleHandler for PullRequestHandler {
    fn name(&self) -> &'static str {
        "pull-request"
    }

    #[instrument(skip_all, fields(issue_number = input.issue.number))]
    async fn process(&self, input: &StageInput) -> Result<StageOutcome, WorkflowError> {
        let issue = &input.issue;
        let branch = self.ctx.workflow.branch_for(issue.number);
        let timeout = self.ctx.timeout();

        self.reconcile(issue.number, &branch).await?;

        let title = format!("Resolve #{}: {}", issue.number, issue.title);
        let body = format!("Closes #{}\n\n{}", issue.number, issue.body);

        let existing = bounded(
            timeout,
            "github.find_open_pull_request",
            self.ctx.tracker.find_open_pull_request(&branch),
        )
        .await?;
        let pr = match existing {
            Some(pr) => {
                let update = PullRequestUpdate {
                    title: Some(title),
                    body: Some(body),
                    state: None,
                };
                bounded(
                    timeout,
                    "github.update_pull_request",
                    self.ctx.tracker.update_pull_request(pr.number, &update),
                )
                .await?
            }
            None => {
                let new = NewPullRequest {
                    title,
                    body,
                    head: branch.clone(),
                    base: self.ctx.workflow.base_branch.clone(),
                };
                bounded(
                    timeout,
                    "github.create_pull_request",
                    self.ctx.tracker.create_pull_request(&new),
                )
                .await?
            }
        };

        info!(issue_number = issue.number, pr_number = pr.number, "Pull request ready");
        self.ctx
            .comment(
                issue.number,
                &format!("## 🚀 Pull request\n\n{} is ready for review.", pr.html_url),
            )
            .await?;

        Ok(StageOutcome::Advance(LabelTransition::to(Stage::Complete)))
    }
}

/// Parked issues. Holds while any error state for the issue remains, and
/// releases the `stone-error` label once a human has cleared them all.
pub struct ErrorTriageHandler {
    ctx: Arc<HandlerContext>,
}

impl ErrorTriageHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RoleHandler for ErrorTriageHandler {
    fn name(&self) -> &'static str {
        "error-triage"
    }

    #[instrument(skip_all, fields(issue_number = input.issue.number))]
    async fn process(&self, input: &StageInput) -> Result<StageOutcome, WorkflowError> {
        let run = &input.run;
        let outstanding: Vec<_> = self
            .ctx
            .recovery
            .list_error_states()
            .await?
            .into_iter()
            .filter(|state| {
                state.context.issue_number == run.issue_number
                    && state.context.repo_owner == run.repo_owner
                    && state.context.repo_name == run.repo_name
            })
            .collect();

        if outstanding.is_empty() {
            info!(issue_number = run.issue_number, "No outstanding error state, releasing hold");
            return Ok(StageOutcome::Advance(LabelTransition::default()));
        }

        let steps: Vec<&str> = outstanding
            .iter()
            .map(|s| s.context.current_step.as_str())
            .collect();
        debug!(issue_number = run.issue_number, steps = ?steps, "Issue still parked");
        Ok(StageOutcome::Hold {
            reason: format!(
                "{} unresolved error state(s): {}",
                outstanding.len(),
                steps.join(", ")
            ),
        })
    }
}
