//! Issue tracker boundary.
//!
//! The control plane only talks to GitHub through [`IssueTracker`]; the REST
//! implementation lives in [`client`].

pub mod client;
#[cfg(test)]
pub mod fake;
pub mod types;

pub use client::GitHubClient;
pub use types::{
    ActionsRun, Comment, FileContent, FileWrite, Issue, NewIssue, NewPullRequest, PullRequest,
    PullRequestUpdate,
};

use async_trait::async_trait;
use thiserror::Error;

/// Hidden marker on every comment Stone posts, so its own comments are never
/// read back as feedback.
pub const COMMENT_MARKER: &str = "<!-- stone -->";

/// Errors from the GitHub REST API.
///
/// Display strings are what recovery classifies on, so transport problems
/// and throttling read as transient while auth and validation do not.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("GitHub rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("GitHub authentication failed: {0}")]
    Unauthorized(String),

    #[error("GitHub permission denied: {0}")]
    Forbidden(String),

    #[error("GitHub resource not found: {0}")]
    NotFound(String),

    #[error("GitHub validation failed: {0}")]
    Validation(String),

    #[error("failed to decode GitHub response: {0}")]
    Serialization(String),
}

impl GitHubError {
    /// Map a non-2xx status and its body to a typed error.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = extract_message(body);
        match status {
            401 => Self::Unauthorized(message),
            403 if message.to_lowercase().contains("rate limit") => Self::RateLimited(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            422 => Self::Validation(message),
            429 => Self::RateLimited(message),
            _ => Self::Api { status, message },
        }
    }
}

fn extract_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Issue, pull request and repository operations the workflow needs.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// `owner/repo` this tracker is bound to.
    fn repository(&self) -> String;

    async fn get_issue(&self, number: u64) -> Result<Issue, GitHubError>;

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<(), GitHubError>;

    /// Removing a label the issue does not carry is not an error.
    async fn remove_label(&self, number: u64, label: &str) -> Result<(), GitHubError>;

    async fn create_comment(&self, number: u64, body: &str) -> Result<Comment, GitHubError>;

    async fn create_issue(&self, issue: &NewIssue) -> Result<Issue, GitHubError>;

    async fn create_pull_request(&self, pr: &NewPullRequest) -> Result<PullRequest, GitHubError>;

    /// Conversation comments followed by review comments.
    async fn get_pull_request_comments(&self, number: u64) -> Result<Vec<Comment>, GitHubError>;

    async fn update_pull_request(
        &self,
        number: u64,
        update: &PullRequestUpdate,
    ) -> Result<PullRequest, GitHubError>;

    async fn find_open_pull_request(&self, head: &str) -> Result<Option<PullRequest>, GitHubError>;

    async fn get_file_content(
        &self,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<FileContent>, GitHubError>;

    async fn create_or_update_file(&self, write: &FileWrite) -> Result<(), GitHubError>;

    /// Create `branch` from the head of `from` unless it already exists.
    async fn ensure_branch(&self, branch: &str, from: &str) -> Result<(), GitHubError>;

    async fn latest_workflow_runs(
        &self,
        branch: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActionsRun>, GitHubError>;
}
