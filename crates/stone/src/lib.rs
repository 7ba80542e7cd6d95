//! Stone: a label-driven workflow that walks GitHub issues through product,
//! QA, implementation, audit, test, docs and PR stages.
//!
//! The issue's `stone-*` labels are the workflow state. Each run resolves
//! the active stage, dispatches it to a role handler and relabels the issue.
//! Failures climb a graduated recovery ladder that ends with a human being
//! notified. Merge conflicts on the feature branch are detected and resolved
//! before the pull request is opened, and review comments on that PR can be
//! triaged into prioritized follow-up issues.

pub mod conflict;
pub mod error;
pub mod feedback;
pub mod github;
pub mod handlers;
pub mod llm;
pub mod orchestrator;
pub mod recovery;
pub mod stage;

pub use conflict::{
    ConflictDetectionResult, ConflictManager, ConflictResolutionResult, GitRunner, MergeStatus,
    ResolutionStrategy,
};
pub use error::WorkflowError;
pub use feedback::{FeedbackItem, FeedbackProcessor, KeywordClassifier, Priority, TeamRouting};
pub use github::{GitHubClient, IssueTracker};
pub use handlers::{HandlerContext, HandlerRegistry, RoleHandler, StageOutcome};
pub use llm::{ClaudeClient, LanguageModel};
pub use orchestrator::{Orchestrator, RunOutcome, WorkflowRun};
pub use recovery::{ErrorRecovery, ErrorState, FileErrorStore, RecoveryResult, RecoveryStrategy};
pub use stage::{resolve_active_stage, LabelSet, Stage};
