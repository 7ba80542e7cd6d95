//! Shared configuration types for the Stone issue workflow.
//!
//! Configuration lives in a single JSON document (`stone-config.json` by
//! default). Every section is optional and falls back to its defaults, so a
//! minimal file only needs the repository coordinates:
//!
//! ```json
//! { "github": { "owner": "acme", "repo": "widgets" } }
//! ```
//!
//! A handful of values can be overridden from the environment; see
//! [`StoneConfig::apply_env_overrides`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "stone-config.json";

const ENV_GITHUB_OWNER: &str = "STONE_GITHUB_OWNER";
const ENV_GITHUB_REPO: &str = "STONE_GITHUB_REPO";
const ENV_STATE_DIR: &str = "STONE_STATE_DIR";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoneConfig {
    pub github: GitHubConfig,
    pub claude: ClaudeConfig,
    pub workflow: WorkflowConfig,
    pub recovery: RecoveryConfig,
    pub conflicts: ConflictConfig,
    pub feedback: FeedbackConfig,
}

/// GitHub repository and API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    pub api_url: String,
    /// Name of the environment variable holding the token
    pub token_env: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            api_url: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

/// Claude completion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClaudeConfig {
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 4096,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
        }
    }
}

/// Control-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowConfig {
    /// Stage labels with a registered handler. Empty means every stage.
    pub enabled_stages: Vec<String>,
    /// Upper bound for any single external call, in seconds
    pub timeout_secs: u64,
    /// Prefix of the per-issue feature branch (`{prefix}{issue}`)
    pub branch_prefix: String,
    pub base_branch: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            enabled_stages: Vec::new(),
            timeout_secs: 120,
            branch_prefix: "stone/issue-".to_string(),
            base_branch: "main".to_string(),
        }
    }
}

impl WorkflowConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Feature branch name for an issue.
    #[must_use]
    pub fn branch_for(&self, issue_number: u64) -> String {
        format!("{}{issue_number}", self.branch_prefix)
    }
}

/// Error-recovery persistence and escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoveryConfig {
    /// Directory holding one JSON record per workflow id
    pub state_dir: PathBuf,
    /// Label added to the issue when a failure is escalated
    pub escalate_label: Option<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".stone/errors"),
            escalate_label: Some("stone-error".to_string()),
        }
    }
}

/// Local clone used for conflict detection and resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConflictConfig {
    pub repo_path: PathBuf,
    pub target_branch: String,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            target_branch: "main".to_string(),
        }
    }
}

/// PR feedback routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeedbackConfig {
    /// Affected area -> owning team
    pub teams: HashMap<String, String>,
    pub default_team: String,
    /// Labels added to every tracking issue
    pub issue_labels: Vec<String>,
    /// Add the first workflow stage label to tracking issues
    pub enter_workflow: bool,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            teams: HashMap::new(),
            default_team: "core".to_string(),
            issue_labels: vec!["stone-feedback".to_string()],
            enter_workflow: true,
        }
    }
}

impl StoneConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns `ConfigError::Read` or `ConfigError::Parse`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise start from defaults.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Apply `STONE_GITHUB_OWNER`, `STONE_GITHUB_REPO` and `STONE_STATE_DIR`.
    #[must_use]
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(owner) = std::env::var(ENV_GITHUB_OWNER) {
            self.github.owner = owner;
        }
        if let Ok(repo) = std::env::var(ENV_GITHUB_REPO) {
            self.github.repo = repo;
        }
        if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
            self.recovery.state_dir = PathBuf::from(dir);
        }
        self
    }

    /// Check the values the control plane cannot run without.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.github.owner.trim().is_empty() || self.github.repo.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "github.owner and github.repo are required".to_string(),
            ));
        }
        if self.workflow.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "workflow.timeoutSecs must be greater than zero".to_string(),
            ));
        }
        if self.feedback.default_team.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "feedback.defaultTeam must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
