//! Git plumbing via `tokio::process`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from running git.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("{command} exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

/// Captured result of one git invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when git was killed by a signal
    pub exit_code: i32,
}

impl GitOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non-empty trimmed stdout lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Runs git in one working tree.
#[derive(Debug, Clone)]
pub struct GitRunner {
    repo: PathBuf,
    timeout: Duration,
}

impl GitRunner {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            timeout: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Run git. A non-zero exit is returned as data.
    pub async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let command = format!("git {}", args.join(" "));
        debug!(repo = %self.repo.display(), command = %command, "Running git");

        let child = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(GitError::Spawn { command, source }),
            Err(_) => {
                return Err(GitError::Timeout {
                    command,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        Ok(GitOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run git and treat a non-zero exit as an error.
    pub async fn run_checked(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let output = self.run(args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(GitError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}
