//! Error-state persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::state::ErrorState;

/// Errors from an error-state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("error-state I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode error state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no error state recorded for {0}")]
    NotFound(String),
}

/// Keyed storage for [`ErrorState`] records.
#[async_trait]
pub trait ErrorStateStore: Send + Sync {
    async fn load(&self, workflow_id: &str) -> Result<Option<ErrorState>, StoreError>;

    /// Insert or replace the record for `state.workflow_id`.
    async fn save(&self, state: &ErrorState) -> Result<(), StoreError>;

    /// Returns whether a record existed.
    async fn delete(&self, workflow_id: &str) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<ErrorState>, StoreError>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryErrorStore {
    states: RwLock<HashMap<String, ErrorState>>,
}

impl MemoryErrorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ErrorStateStore for MemoryErrorStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<ErrorState>, StoreError> {
        Ok(self.states.read().await.get(workflow_id).cloned())
    }

    async fn save(&self, state: &ErrorState) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .insert(state.workflow_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool, StoreError> {
        Ok(self.states.write().await.remove(workflow_id).is_some())
    }

    async fn list(&self) -> Result<Vec<ErrorState>, StoreError> {
        let mut states: Vec<_> = self.states.read().await.values().cloned().collect();
        states.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Ok(states)
    }
}

/// One JSON file per workflow id under a state directory.
///
/// Writes go to a uniquely named temp file and are renamed into place, so a
/// reader never sees a half-written record.
#[derive(Debug, Clone)]
pub struct FileErrorStore {
    dir: PathBuf,
}

impl FileErrorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_id(workflow_id)))
    }

    async fn read_record(path: &Path) -> Result<Option<ErrorState>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// File stem for a workflow id.
///
/// Ids made only of `[A-Za-z0-9_-]` are used as is. Anything else has those
/// characters replaced with `_` plus `~` and a hash of the raw id, so two ids
/// never share a file.
fn sanitize_id(workflow_id: &str) -> String {
    let is_plain = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !workflow_id.is_empty() && workflow_id.chars().all(is_plain) {
        return workflow_id.to_string();
    }
    let stem: String = workflow_id
        .chars()
        .map(|c| if is_plain(c) { c } else { '_' })
        .collect();
    let digest = Sha1::digest(workflow_id.as_bytes());
    format!("{stem}~{}", &hex::encode(digest)[..12])
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl ErrorStateStore for FileErrorStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<ErrorState>, StoreError> {
        let record = Self::read_record(&self.path_for(workflow_id)).await?;
        Ok(record.filter(|state| state.workflow_id == workflow_id))
    }

    async fn save(&self, state: &ErrorState) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;

        let path = self.path_for(&state.workflow_id);
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            sanitize_id(&state.workflow_id),
            uuid::Uuid::new_v4()
        ));
        let bytes = serde_json::to_vec_pretty(state)?;

        tokio::fs::write(&tmp, &bytes).await.map_err(io_err(&tmp))?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Io { path, source });
        }
        debug!(workflow_id = %state.workflow_id, path = %path.display(), "Persisted error state");
        Ok(())
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool, StoreError> {
        if self.load(workflow_id).await?.is_none() {
            return Ok(false);
        }
        let path = self.path_for(workflow_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn list(&self) -> Result<Vec<ErrorState>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable error state"),
            }
        }
        states.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::state::ErrorContext;
    use chrono::Utc;

    fn state(id: &str, attempts: u32) -> ErrorState {
        ErrorState {
            workflow_id: id.to_string(),
            error_kind: "github".to_string(),
            error_message: "GitHub rate limit exceeded".to_string(),
            context: ErrorContext {
                issue_number: 42,
                repo_owner: "acme".to_string(),
                repo_name: "widgets".to_string(),
                current_step: "qa".to_string(),
                step_data: [("stage".to_string(), "QA".to_string())].into(),
            },
            timestamp: Utc::now(),
            recovery_attempts: attempts,
        }
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileErrorStore::new(dir.path().join("errors"));

        assert!(store.load("acme-widgets-42-qa").await.unwrap().is_none());
        store.save(&state("acme-widgets-42-qa", 1)).await.unwrap();

        let loaded = store.load("acme-widgets-42-qa").await.unwrap().unwrap();
        assert_eq!(loaded.recovery_attempts, 1);
        assert_eq!(loaded.context.step_data["stage"], "QA");

        assert!(store.delete("acme-widgets-42-qa").await.unwrap());
        assert!(!store.delete("acme-widgets-42-qa").await.unwrap());
        assert!(store.load("acme-widgets-42-qa").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_writes_camel_case_without_temp_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileErrorStore::new(dir.path());

        for attempts in 0..3 {
            store.save(&state("acme-widgets-7-audit", attempts)).await.unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["acme-widgets-7-audit.json"]);

        let raw = std::fs::read_to_string(dir.path().join("acme-widgets-7-audit.json")).unwrap();
        assert!(raw.contains("\"workflowId\""));
        assert!(raw.contains("\"recoveryAttempts\": 2"));
        assert!(raw.contains("\"issueNumber\": 42"));
    }

    #[tokio::test]
    async fn test_sanitized_collisions_do_not_alias() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileErrorStore::new(dir.path());

        store.save(&state("acme.web-widgets-1-qa", 1)).await.unwrap();
        store.save(&state("acme_web-widgets-1-qa", 2)).await.unwrap();
        store.save(&state("acme/web-widgets-1-qa", 3)).await.unwrap();

        for (id, attempts) in [
            ("acme.web-widgets-1-qa", 1),
            ("acme_web-widgets-1-qa", 2),
            ("acme/web-widgets-1-qa", 3),
        ] {
            let loaded = store.load(id).await.unwrap().unwrap();
            assert_eq!(loaded.recovery_attempts, attempts);
        }
        assert_eq!(store.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileErrorStore::new(dir.path());
        store.save(&state("b-id", 0)).await.unwrap();
        store.save(&state("a-id", 0)).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore").unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.workflow_id)
            .collect();
        assert_eq!(ids, vec!["a-id", "b-id"]);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileErrorStore::new(dir.path().join("never-created"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryErrorStore::new();
        store.save(&state("x", 2)).await.unwrap();
        assert_eq!(store.load("x").await.unwrap().unwrap().recovery_attempts, 2);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.delete("x").await.unwrap());
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("acme-widgets-42-qa"), "acme-widgets-42-qa");
        let hashed = sanitize_id("../etc/passwd");
        assert!(hashed.starts_with("___etc_passwd~"));
        assert_eq!(hashed.len(), "___etc_passwd~".len() + 12);
        assert!(!hashed.contains('/'));
        assert_ne!(sanitize_id("a.b"), sanitize_id("a/b"));
    }
}
