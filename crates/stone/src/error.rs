//! Workflow error taxonomy.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::conflict::GitError;
use crate::github::GitHubError;
use crate::llm::LlmError;
use crate::recovery::StoreError;
use crate::stage::Stage;

/// Errors surfaced by a workflow run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("issue #{issue_number} carries no active stone stage label")]
    NoActiveStage { issue_number: u64 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    GitHub(#[from] GitHubError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("{stage} handler failed: {message}")]
    Handler { stage: Stage, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workflow run cancelled before {step}")]
    Cancelled { step: String },
}

impl WorkflowError {
    /// Short machine-readable kind, persisted as `errorKind`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoActiveStage { .. } => "no_active_stage",
            Self::Configuration(_) => "configuration",
            Self::GitHub(_) => "github",
            Self::Llm(_) => "llm",
            Self::Git(_) => "git",
            Self::Timeout { .. } => "timeout",
            Self::Handler { .. } => "handler",
            Self::Store(_) => "store",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Fatal errors bypass recovery and go straight back to the caller.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoActiveStage { .. } | Self::Configuration(_) | Self::Cancelled { .. }
        )
    }

    pub fn handler(stage: Stage, message: impl Into<String>) -> Self {
        Self::Handler {
            stage,
            message: message.into(),
        }
    }
}

/// Render an error with its full source chain.
///
/// Transport errors often carry the useful part ("connection reset",
/// "operation timed out") only in their sources, and recovery classifies on
/// this text.
#[must_use]
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Bound an external call by `limit`.
///
/// Elapsed calls become [`WorkflowError::Timeout`], which recovery treats as
/// transient.
pub async fn bounded<T, E, F>(limit: Duration, operation: &str, fut: F) -> Result<T, WorkflowError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<WorkflowError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(WorkflowError::Timeout {
            operation: operation.to_string(),
            secs: limit.as_secs(),
        }),
    }
}
