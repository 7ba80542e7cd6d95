//! In-memory tracker for tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use super::types::{
    ActionsRun, Comment, FileContent, FileWrite, Issue, NewIssue, NewPullRequest, PullRequest,
    PullRequestUpdate,
};
use super::{GitHubError, IssueTracker};

#[derive(Default)]
struct State {
    issues: BTreeMap<u64, Issue>,
    comments: Vec<(u64, String)>,
    pr_comments: HashMap<u64, Vec<Comment>>,
    pulls: Vec<PullRequest>,
    files: HashMap<(String, String), FileContent>,
    branches: Vec<String>,
    runs: Vec<ActionsRun>,
    ops: Vec<String>,
    failures: HashMap<String, (u16, String)>,
    delays: HashMap<String, Duration>,
    next_id: u64,
}

/// Records every call and keeps issues, comments, pulls and files in memory.
#[derive(Default)]
pub struct FakeTracker {
    state: Mutex<State>,
}

impl FakeTracker {
    pub fn new() -> Self {
        let tracker = Self::default();
        tracker.state.lock().unwrap().next_id = 1000;
        tracker
    }

    pub fn with_issue(self, number: u64, labels: &[&str]) -> Self {
        self.state.lock().unwrap().issues.insert(
            number,
            Issue {
                number,
                title: format!("Issue {number}"),
                body: "Widgets should export to CSV".to_string(),
                labels: labels.iter().map(ToString::to_string).collect(),
                state: "open".to_string(),
                html_url: format!("https://github.com/acme/widgets/issues/{number}"),
            },
        );
        self
    }

    pub fn with_pr_comments(self, number: u64, comments: Vec<Comment>) -> Self {
        self.state.lock().unwrap().pr_comments.insert(number, comments);
        self
    }

    pub fn with_pull(self, pr: PullRequest) -> Self {
        self.state.lock().unwrap().pulls.push(pr);
        self
    }

    pub fn with_file(self, git_ref: &str, path: &str, sha: &str, content: &str) -> Self {
        self.state.lock().unwrap().files.insert(
            (git_ref.to_string(), path.to_string()),
            FileContent {
                path: path.to_string(),
                sha: sha.to_string(),
                content: content.to_string(),
            },
        );
        self
    }

    pub fn with_runs(self, runs: Vec<ActionsRun>) -> Self {
        self.state.lock().unwrap().runs = runs;
        self
    }

    /// Make every call to `op` fail with the given status until cleared.
    pub fn fail(&self, op: &str, status: u16, body: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(op.to_string(), (status, body.to_string()));
    }

    pub fn labels(&self, number: u64) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .issues
            .get(&number)
            .map(|i| i.labels.clone())
            .unwrap_or_default()
    }

    pub fn comments(&self, number: u64) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .comments
            .iter()
            .filter(|(n, _)| *n == number)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn created_issues(&self) -> Vec<Issue> {
        let state = self.state.lock().unwrap();
        state
            .issues
            .values()
            .filter(|i| i.number >= 1000)
            .cloned()
            .collect()
    }

    pub fn pulls(&self) -> Vec<PullRequest> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn file(&self, git_ref: &str, path: &str) -> Option<FileContent> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(git_ref.to_string(), path.to_string()))
            .cloned()
    }

    pub fn branches(&self) -> Vec<String> {
        self.state.lock().unwrap().branches.clone()
    }

    /// Call log, e.g. `add:stone-qa`, `remove:stone-process`, `comment:42`.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Make `op` sleep for `delay` before answering.
    pub fn with_delay(self, op: &str, delay: Duration) -> Self {
        self.state.lock().unwrap().delays.insert(op.to_string(), delay);
        self
    }

    async fn stall(&self, op: &str) {
        let delay = self.state.lock().unwrap().delays.get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, op: &str, entry: String) -> Result<(), GitHubError> {
        let mut state = self.state.lock().unwrap();
        if let Some((status, body)) = state.failures.get(op) {
            return Err(GitHubError::from_status(*status, body));
        }
        state.ops.push(entry);
        Ok(())
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    fn repository(&self) -> String {
        "acme/widgets".to_string()
    }

    async fn get_issue(&self, number: u64) -> Result<Issue, GitHubError> {
        self.record("get_issue", format!("get:{number}"))?;
        self.state
            .lock()
            .unwrap()
            .issues
            .get(&number)
            .cloned()
            .ok_or_else(|| GitHubError::NotFound(format!("issue {number}")))
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<(), GitHubError> {
        for label in labels {
            self.record("add_labels", format!("add:{label}"))?;
        }
        let mut state = self.state.lock().unwrap();
        let issue = state
            .issues
            .get_mut(&number)
            .ok_or_else(|| GitHubError::NotFound(format!("issue {number}")))?;
        for label in labels {
            if !issue.labels.contains(label) {
                issue.labels.push(label.clone());
            }
        }
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<(), GitHubError> {
        self.record("remove_label", format!("remove:{label}"))?;
        if let Some(issue) = self.state.lock().unwrap().issues.get_mut(&number) {
            issue.labels.retain(|l| l != label);
        }
        Ok(())
    }

    async fn create_comment(&self, number: u64, body: &str) -> Result<Comment, GitHubError> {
        self.record("create_comment", format!("comment:{number}"))?;
        let mut state = self.state.lock().unwrap();
        state.comments.push((number, body.to_string()));
        state.next_id += 1;
        Ok(Comment::new(state.next_id, "stone-bot", body))
    }

    async fn create_issue(&self, issue: &NewIssue) -> Result<Issue, GitHubError> {
        self.record("create_issue", format!("issue:{}", issue.title))?;
        let mut state = self.state.lock().unwrap();
        let number = state.next_id;
        state.next_id += 1;
        let created = Issue {
            number,
            title: issue.title.clone(),
            body: issue.body.clone(),
            labels: issue.labels.clone(),
            state: "open".to_string(),
            html_url: format!("https://github.com/acme/widgets/issues/{number}"),
        };
        state.issues.insert(number, created.clone());
        Ok(created)
    }

    async fn create_pull_request(&self, pr: &NewPullRequest) -> Result<PullRequest, GitHubError> {
        self.record("create_pull_request", format!("pr:{}", pr.head))?;
        let mut state = self.state.lock().unwrap();
        let number = state.pulls.len() as u64 + 1;
        let created = PullRequest {
            number,
            title: pr.title.clone(),
            html_url: format!("https://github.com/acme/widgets/pull/{number}"),
            state: "open".to_string(),
            head: pr.head.clone(),
            base: pr.base.clone(),
            mergeable: Some(true),
            mergeable_state: Some("clean".to_string()),
        };
        state.pulls.push(created.clone());
        Ok(created)
    }

    async fn get_pull_request_comments(&self, number: u64) -> Result<Vec<Comment>, GitHubError> {
        self.record("get_pull_request_comments", format!("pr-comments:{number}"))?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .pr_comments
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_pull_request(
        &self,
        number: u64,
        update: &PullRequestUpdate,
    ) -> Result<PullRequest, GitHubError> {
        self.record("update_pull_request", format!("update-pr:{number}"))?;
        let mut state = self.state.lock().unwrap();
        let pr = state
            .pulls
            .iter_mut()
            .find(|p| p.number == number)
            .ok_or_else(|| GitHubError::NotFound(format!("pull {number}")))?;
        if let Some(title) = &update.title {
            pr.title.clone_from(title);
        }
        if let Some(pr_state) = &update.state {
            pr.state.clone_from(pr_state);
        }
        Ok(pr.clone())
    }

    async fn find_open_pull_request(&self, head: &str) -> Result<Option<PullRequest>, GitHubError> {
        self.stall("find_open_pull_request").await;
        self.record("find_open_pull_request", format!("find-pr:{head}"))?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .pulls
            .iter()
            .find(|p| p.head == head && p.state == "open")
            .cloned())
    }

    async fn get_file_content(
        &self,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<FileContent>, GitHubError> {
        self.record("get_file_content", format!("read:{path}"))?;
        Ok(self.file(git_ref, path))
    }

    async fn create_or_update_file(&self, write: &FileWrite) -> Result<(), GitHubError> {
        self.record("create_or_update_file", format!("write:{}", write.path))?;
        let mut state = self.state.lock().unwrap();
        let key = (write.branch.clone(), write.path.clone());
        let current = state.files.get(&key).map(|f| f.sha.clone());
        if current != write.sha {
            return Err(GitHubError::from_status(409, "sha does not match"));
        }
        let sha = format!("sha-{}", state.next_id);
        state.next_id += 1;
        state.files.insert(
            key,
            FileContent {
                path: write.path.clone(),
                sha,
                content: write.content.clone(),
            },
        );
        Ok(())
    }

    async fn ensure_branch(&self, branch: &str, _from: &str) -> Result<(), GitHubError> {
        self.record("ensure_branch", format!("branch:{branch}"))?;
        let mut state = self.state.lock().unwrap();
        if !state.branches.iter().any(|b| b == branch) {
            state.branches.push(branch.to_string());
        }
        Ok(())
    }

    async fn latest_workflow_runs(
        &self,
        _branch: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActionsRun>, GitHubError> {
        self.record("latest_workflow_runs", "runs".to_string())?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .runs
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}
