//! What gets announced, and how loudly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Alert severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Embed/attachment colour.
    #[must_use]
    pub const fn color(&self) -> u32 {
        match self {
            Self::Info => 0x0034_98db,
            Self::Warning => 0x00f3_9c12,
            Self::Critical => 0x00e7_4c3c,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }

    /// Case-insensitive parse of `info`, `warning`/`warn` or `critical`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Workflow events worth telling a human about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A stage handler failed and entered the recovery ladder
    StageFailed {
        workflow_id: String,
        repository: String,
        issue_number: u64,
        stage: String,
        error: String,
        attempt: u32,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Automated recovery gave up and a human must take over
    WorkflowEscalated {
        workflow_id: String,
        repository: String,
        issue_number: u64,
        stage: String,
        error: String,
        attempts: u32,
        permanent: bool,
        #[serde(default)]
        context: BTreeMap<String, String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Every automatic conflict strategy failed for a branch
    ConflictsUnresolved {
        repository: String,
        branch: String,
        target_branch: String,
        files: Vec<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// One-line headline.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::StageFailed {
                stage,
                issue_number,
                ..
            } => format!("Stage {stage} Failed: Issue #{issue_number}"),
            Self::WorkflowEscalated {
                stage,
                issue_number,
                ..
            } => format!("Escalation: {stage} on Issue #{issue_number}"),
            Self::ConflictsUnresolved { branch, .. } => {
                format!("Unresolved Merge Conflicts: {branch}")
            }
        }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::StageFailed { .. } => Severity::Warning,
            Self::WorkflowEscalated { .. } | Self::ConflictsUnresolved { .. } => {
                Severity::Critical
            }
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StageFailed { timestamp, .. }
            | Self::WorkflowEscalated { timestamp, .. }
            | Self::ConflictsUnresolved { timestamp, .. } => *timestamp,
        }
    }

    /// Human-readable body shared by all channels.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::StageFailed {
                repository,
                error,
                attempt,
                ..
            } => format!("Retry {attempt} scheduled on `{repository}`\n*Error:* {error}"),
            Self::WorkflowEscalated {
                repository,
                error,
                attempts,
                permanent,
                ..
            } => {
                let reason = if *permanent {
                    "permanent error, not retried".to_string()
                } else {
                    format!("recovery exhausted after {attempts} attempts")
                };
                format!("Manual intervention required on `{repository}` ({reason})\n*Error:* {error}")
            }
            Self::ConflictsUnresolved {
                repository,
                target_branch,
                files,
                ..
            } => format!(
                "Could not merge `{target_branch}` automatically on `{repository}`; {} file(s) need manual resolution",
                files.len()
            ),
        }
    }

    /// Structured key/value fields shared by all channels.
    #[must_use]
    pub fn fields(&self) -> Vec<(String, String)> {
        match self {
            Self::StageFailed {
                workflow_id,
                issue_number,
                stage,
                ..
            } => vec![
                ("Workflow".to_string(), workflow_id.clone()),
                ("Issue".to_string(), format!("#{issue_number}")),
                ("Stage".to_string(), stage.clone()),
            ],
            Self::WorkflowEscalated {
                workflow_id,
                issue_number,
                stage,
                attempts,
                context,
                ..
            } => {
                let mut fields = vec![
                    ("Workflow".to_string(), workflow_id.clone()),
                    ("Issue".to_string(), format!("#{issue_number}")),
                    ("Stage".to_string(), stage.clone()),
                    ("Attempts".to_string(), attempts.to_string()),
                ];
                for (key, value) in context {
                    fields.push((key.clone(), value.clone()));
                }
                fields
            }
            Self::ConflictsUnresolved {
                branch,
                target_branch,
                files,
                ..
            } => vec![
                ("Branch".to_string(), branch.clone()),
                ("Target".to_string(), target_branch.clone()),
                ("Files".to_string(), files.join(", ")),
            ],
        }
    }
}
