//! Persisted failure records and recovery outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::github::ActionsRun;

/// Where a workflow run failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub issue_number: u64,
    pub repo_owner: String,
    pub repo_name: String,
    /// Stage slug or named step that failed
    pub current_step: String,
    #[serde(default)]
    pub step_data: BTreeMap<String, String>,
}

/// Failure record for one workflow id.
///
/// Created on first failure, bumped by each recovery rung, deleted once the
/// retried stage succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorState {
    pub workflow_id: String,
    pub error_kind: String,
    pub error_message: String,
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub recovery_attempts: u32,
}

/// Rung of the recovery ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    SimpleRetry,
    AdvancedRetry,
    TeamNotification,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SimpleRetry => "simple retry",
            Self::AdvancedRetry => "advanced retry",
            Self::TeamNotification => "team notification",
        };
        f.write_str(name)
    }
}

/// Outcome of one `attempt_recovery` call.
///
/// `success` means "retry is worthwhile", not that anything was fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub success: bool,
    pub recovery_strategy: RecoveryStrategy,
    pub attempts: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<ActionsRun>,
    /// An escalation comment was already posted on the issue
    #[serde(default)]
    pub escalated: bool,
}
