//! PR comments in, tracking issues out.

use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use stone_config::FeedbackConfig;
use tracing::{debug, info};

use super::{
    prioritize_feedback, FeedbackClassifier, FeedbackItem, KeywordClassifier, Priority,
    TeamRouting,
};
use crate::error::{bounded, WorkflowError};
use crate::github::{IssueTracker, NewIssue, COMMENT_MARKER};
use crate::stage::Stage;

/// Longest title excerpt taken from a comment.
const TITLE_EXCERPT_CHARS: usize = 60;

/// One triaged comment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    pub item: FeedbackItem,
    pub priority: Priority,
    pub team: String,
    /// Tracking issue; `None` on a dry run
    pub issue_number: Option<u64>,
}

/// Result of processing one pull request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackReport {
    pub pull_request: u64,
    pub comments_seen: usize,
    pub entries: Vec<FeedbackEntry>,
}

/// Classifies, ranks and routes PR comments and opens tracking issues.
pub struct FeedbackProcessor {
    tracker: Arc<dyn IssueTracker>,
    classifier: Box<dyn FeedbackClassifier>,
    routing: TeamRouting,
    issue_labels: Vec<String>,
    enter_workflow: bool,
    timeout: Duration,
}

impl FeedbackProcessor {
    pub fn new(tracker: Arc<dyn IssueTracker>, config: &FeedbackConfig) -> Self {
        Self {
            tracker,
            classifier: Box::new(KeywordClassifier::new()),
            routing: TeamRouting::from_config(config),
            issue_labels: config.issue_labels.clone(),
            enter_workflow: config.enter_workflow,
            timeout: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Box<dyn FeedbackClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn process_pull_request(
        &self,
        pr_number: u64,
        dry_run: bool,
    ) -> Result<FeedbackReport, WorkflowError> {
        let comments = bounded(
            self.timeout,
            "github.get_pull_request_comments",
            self.tracker.get_pull_request_comments(pr_number),
        )
        .await?;

        let items: Vec<FeedbackItem> = comments
            .iter()
            .filter(|c| !c.body.contains(COMMENT_MARKER))
            .filter_map(|c| self.classifier.classify(c))
            .collect();
        info!(
            pr_number,
            comments = comments.len(),
            actionable = items.len(),
            "Classified pull request feedback"
        );

        let mut entries = Vec::with_capacity(items.len());
        for prioritized in prioritize_feedback(&items) {
            let team = self.routing.team_for(&prioritized.item).to_string();
            let issue_number = if dry_run {
                debug!(item = %prioritized.item.id, "Dry run, not opening issue");
                None
            } else {
                let issue = self.tracking_issue(pr_number, &prioritized.item, prioritized.priority, &team);
                let created = bounded(
                    self.timeout,
                    "github.create_issue",
                    self.tracker.create_issue(&issue),
                )
                .await?;
                info!(
                    issue_number = created.number,
                    priority = %prioritized.priority,
                    team = %team,
                    "Opened feedback issue"
                );
                Some(created.number)
            };

            entries.push(FeedbackEntry {
                item: prioritized.item,
                priority: prioritized.priority,
                team,
                issue_number,
            });
        }

        Ok(FeedbackReport {
            pull_request: pr_number,
            comments_seen: comments.len(),
            entries,
        })
    }

    fn tracking_issue(
        &self,
        pr_number: u64,
        item: &FeedbackItem,
        priority: Priority,
        team: &str,
    ) -> NewIssue {
        let first_line = item.description.lines().next().unwrap_or_default().trim();
        let excerpt: String = first_line.chars().take(TITLE_EXCERPT_CHARS).collect();
        let ellipsis = if first_line.chars().count() > TITLE_EXCERPT_CHARS { "…" } else { "" };

        let mut body = String::new();
        body.push_str(COMMENT_MARKER);
        let _ = writeln!(body, "\nFeedback from @{} on #{pr_number}\n", item.author);
        for line in item.description.lines() {
            let _ = writeln!(body, "> {line}");
        }
        let _ = writeln!(body, "\n| Field | Value |\n|---|---|");
        let _ = writeln!(body, "| Severity | {} |", item.severity.as_str());
        let _ = writeln!(body, "| Priority | {priority} |");
        let _ = writeln!(body, "| Area | {} |", item.affected_area);
        let _ = writeln!(body, "| Team | {team} |");
        let _ = writeln!(body, "| Source comment | {} |", item.source_comment_id);

        let mut labels = self.issue_labels.clone();
        labels.push(priority.label().to_string());
        labels.push(format!("team:{team}"));
        if self.enter_workflow {
            labels.push(Stage::Process.label());
        }

        NewIssue {
            title: format!("[{priority}] PR #{pr_number}: {excerpt}{ellipsis}"),
            body,
            labels,
        }
    }
}
