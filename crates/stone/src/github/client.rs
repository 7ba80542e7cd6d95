//! GitHub REST client.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use stone_config::GitHubConfig;
use tracing::{debug, info, instrument};

use super::types::{
    ActionsRun, Comment, FileContent, FileWrite, Issue, NewIssue, NewPullRequest, PullRequest,
    PullRequestUpdate,
};
use super::{GitHubError, IssueTracker};

const API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: usize = 100;

/// GitHub API client bound to one repository.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<RawLabel>,
    state: String,
    html_url: String,
}

impl From<RawIssue> for Issue {
    fn from(raw: RawIssue) -> Self {
        Self {
            number: raw.number,
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            labels: raw.labels.into_iter().map(|l| l.name).collect(),
            state: raw.state,
            html_url: raw.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawComment {
    id: u64,
    #[serde(default)]
    user: Option<RawUser>,
    #[serde(default)]
    body: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<RawComment> for Comment {
    fn from(raw: RawComment) -> Self {
        Self {
            id: raw.id,
            author: raw.user.map(|u| u.login).unwrap_or_default(),
            body: raw.body.unwrap_or_default(),
            created_at: raw.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawPull {
    number: u64,
    title: String,
    html_url: String,
    state: String,
    head: RawRef,
    base: RawRef,
    #[serde(default)]
    mergeable: Option<bool>,
    #[serde(default)]
    mergeable_state: Option<String>,
}

impl From<RawPull> for PullRequest {
    fn from(raw: RawPull) -> Self {
        Self {
            number: raw.number,
            title: raw.title,
            html_url: raw.html_url,
            state: raw.state,
            head: raw.head.name,
            base: raw.base.name,
            mergeable: raw.mergeable,
            mergeable_state: raw.mergeable_state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawContent {
    path: String,
    sha: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct RawGitRef {
    object: RawGitObject,
}

#[derive(Debug, Deserialize)]
struct RawGitObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RawWorkflowRuns {
    #[serde(default)]
    workflow_runs: Vec<RawWorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflowRun {
    #[serde(default)]
    name: Option<String>,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    head_branch: Option<String>,
    html_url: String,
}

impl GitHubClient {
    /// Create a client for `owner/repo`.
    pub fn new(
        api_url: &str,
        owner: &str,
        repo: &str,
        token: &str,
    ) -> Result<Self, GitHubError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("stone/", env!("CARGO_PKG_VERSION"))),
        );

        let client = reqwest::Client::builder().default_headers(headers).build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
        })
    }

    /// Create a client from configuration, reading the token from the
    /// environment variable it names.
    pub fn from_config(config: &GitHubConfig) -> Result<Self, GitHubError> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            GitHubError::Unauthorized(format!("{} is not set", config.token_env))
        })?;
        Self::new(&config.api_url, &config.owner, &config.repo, &token)
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{path}", self.api_url, self.owner, self.repo)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.repo_url(path))
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GitHubError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GitHubError::from_status(status.as_u16(), &body));
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| GitHubError::Serialization(e.to_string()))
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<StatusCode, GitHubError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GitHubError::from_status(status.as_u16(), &body));
        }
        Ok(status)
    }

    async fn get_pull_request(&self, number: u64) -> Result<PullRequest, GitHubError> {
        let raw: RawPull = self
            .send(self.request(Method::GET, &format!("/pulls/{number}")))
            .await?;
        Ok(raw.into())
    }

    async fn branch_sha(&self, branch: &str) -> Result<Option<String>, GitHubError> {
        match self
            .send::<RawGitRef>(self.request(Method::GET, &format!("/git/ref/heads/{branch}")))
            .await
        {
            Ok(raw) => Ok(Some(raw.object.sha)),
            Err(GitHubError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Percent-encode each segment of a repository path, keeping separators.
fn encode_path(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl IssueTracker for GitHubClient {
    fn repository(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    #[instrument(skip(self))]
    async fn get_issue(&self, number: u64) -> Result<Issue, GitHubError> {
        let raw: RawIssue = self
            .send(self.request(Method::GET, &format!("/issues/{number}")))
            .await?;
        debug!(labels = raw.labels.len(), "Fetched issue");
        Ok(raw.into())
    }

    #[instrument(skip(self))]
    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<(), GitHubError> {
        if labels.is_empty() {
            return Ok(());
        }
        self.send_empty(
            self.request(Method::POST, &format!("/issues/{number}/labels"))
                .json(&json!({ "labels": labels })),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_label(&self, number: u64, label: &str) -> Result<(), GitHubError> {
        let path = format!("/issues/{number}/labels/{}", urlencoding::encode(label));
        match self.send_empty(self.request(Method::DELETE, &path)).await {
            Ok(_) => Ok(()),
            Err(GitHubError::NotFound(_)) => {
                debug!(label, "Label was not present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, body))]
    async fn create_comment(&self, number: u64, body: &str) -> Result<Comment, GitHubError> {
        let raw: RawComment = self
            .send(
                self.request(Method::POST, &format!("/issues/{number}/comments"))
                    .json(&json!({ "body": body })),
            )
            .await?;
        Ok(raw.into())
    }

    #[instrument(skip(self, issue), fields(title = %issue.title))]
    async fn create_issue(&self, issue: &NewIssue) -> Result<Issue, GitHubError> {
        let raw: RawIssue = self
            .send(self.request(Method::POST, "/issues").json(issue))
            .await?;
        info!(number = raw.number, "Created issue");
        Ok(raw.into())
    }

    #[instrument(skip(self, pr), fields(head = %pr.head, base = %pr.base))]
    async fn create_pull_request(&self, pr: &NewPullRequest) -> Result<PullRequest, GitHubError> {
        let raw: RawPull = self.send(self.request(Method::POST, "/pulls").json(pr)).await?;
        info!(number = raw.number, "Created pull request");
        Ok(raw.into())
    }

    #[instrument(skip(self))]
    async fn get_pull_request_comments(&self, number: u64) -> Result<Vec<Comment>, GitHubError> {
        let conversation: Vec<RawComment> = self
            .send(
                self.request(Method::GET, &format!("/issues/{number}/comments"))
                    .query(&[("per_page", PAGE_SIZE)]),
            )
            .await?;
        let review: Vec<RawComment> = self
            .send(
                self.request(Method::GET, &format!("/pulls/{number}/comments"))
                    .query(&[("per_page", PAGE_SIZE)]),
            )
            .await?;

        Ok(conversation
            .into_iter()
            .chain(review)
            .map(Comment::from)
            .collect())
    }

    #[instrument(skip(self, update))]
    async fn update_pull_request(
        &self,
        number: u64,
        update: &PullRequestUpdate,
    ) -> Result<PullRequest, GitHubError> {
        let raw: RawPull = self
            .send(
                self.request(Method::PATCH, &format!("/pulls/{number}"))
                    .json(update),
            )
            .await?;
        Ok(raw.into())
    }

    #[instrument(skip(self))]
    async fn find_open_pull_request(&self, head: &str) -> Result<Option<PullRequest>, GitHubError> {
        let head_filter = format!("{}:{head}", self.owner);
        let open: Vec<RawPull> = self
            .send(
                self.request(Method::GET, "/pulls")
                    .query(&[("state", "open"), ("head", head_filter.as_str())]),
            )
            .await?;

        let Some(first) = open.into_iter().next() else {
            return Ok(None);
        };
        // The list endpoint never reports mergeability
        self.get_pull_request(first.number).await.map(Some)
    }

    #[instrument(skip(self))]
    async fn get_file_content(
        &self,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<FileContent>, GitHubError> {
        let request = self
            .request(Method::GET, &format!("/contents/{}", encode_path(path)))
            .query(&[("ref", git_ref)]);
        let raw: RawContent = match self.send(request).await {
            Ok(raw) => raw,
            Err(GitHubError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let packed: String = raw.content.split_whitespace().collect();
        let bytes = BASE64
            .decode(packed)
            .map_err(|e| GitHubError::Serialization(format!("invalid base64 in {path}: {e}")))?;

        Ok(Some(FileContent {
            path: raw.path,
            sha: raw.sha,
            content: String::from_utf8_lossy(&bytes).into_owned(),
        }))
    }

    #[instrument(skip(self, write), fields(path = %write.path, branch = %write.branch))]
    async fn create_or_update_file(&self, write: &FileWrite) -> Result<(), GitHubError> {
        let mut body = json!({
            "message": write.message,
            "content": BASE64.encode(write.content.as_bytes()),
            "branch": write.branch,
        });
        if let Some(sha) = &write.sha {
            body["sha"] = json!(sha);
        }
        self.send_empty(
            self.request(Method::PUT, &format!("/contents/{}", encode_path(&write.path)))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn ensure_branch(&self, branch: &str, from: &str) -> Result<(), GitHubError> {
        if self.branch_sha(branch).await?.is_some() {
            return Ok(());
        }
        let sha = self
            .branch_sha(from)
            .await?
            .ok_or_else(|| GitHubError::NotFound(format!("base branch {from}")))?;

        let result = self
            .send_empty(self.request(Method::POST, "/git/refs").json(&json!({
                "ref": format!("refs/heads/{branch}"),
                "sha": sha,
            })))
            .await;
        match result {
            Ok(_) => {
                info!(branch, from, "Created branch");
                Ok(())
            }
            // Lost a race with another writer
            Err(GitHubError::Validation(msg)) if msg.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn latest_workflow_runs(
        &self,
        branch: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActionsRun>, GitHubError> {
        let mut request = self
            .request(Method::GET, "/actions/runs")
            .query(&[("per_page", limit.clamp(1, PAGE_SIZE))]);
        if let Some(branch) = branch {
            request = request.query(&[("branch", branch)]);
        }
        let raw: RawWorkflowRuns = self.send(request).await?;

        Ok(raw
            .workflow_runs
            .into_iter()
            .take(limit)
            .map(|run| ActionsRun {
                name: run.name.unwrap_or_default(),
                status: run.status,
                conclusion: run.conclusion,
                head_branch: run.head_branch,
                html_url: run.html_url,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GitHubClient {
        GitHubClient::new(&server.uri(), "acme", "widgets", "test-token").unwrap()
    }

    fn issue_json(number: u64, labels: &[&str]) -> serde_json::Value {
        json!({
            "number": number,
            "title": "Add widget export",
            "body": null,
            "labels": labels.iter().map(|l| json!({"name": l})).collect::<Vec<_>>(),
            "state": "open",
            "html_url": format!("https://github.com/acme/widgets/issues/{number}"),
        })
    }

    #[tokio::test]
    async fn test_get_issue_reads_labels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/issues/42"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(issue_json(42, &["stone-qa", "bug"])),
            )
            .mount(&server)
            .await;

        let issue = client(&server).get_issue(42).await.unwrap();
        assert_eq!(issue.number, 42);
        assert_eq!(issue.labels, vec!["stone-qa", "bug"]);
        assert_eq!(issue.body, "");
    }

    #[tokio::test]
    async fn test_non_success_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/issues/7"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/issues/8"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/issues/9"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Bad credentials"})))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(matches!(client.get_issue(7).await, Err(GitHubError::NotFound(_))));
        assert!(matches!(client.get_issue(8).await, Err(GitHubError::RateLimited(_))));
        assert!(matches!(client.get_issue(9).await, Err(GitHubError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_remove_missing_label_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/repos/acme/widgets/issues/42/labels/stone-qa"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).remove_label(42, "stone-qa").await.unwrap();
    }

    #[tokio::test]
    async fn test_add_labels_posts_all() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widgets/issues/42/labels"))
            .and(body_partial_json(json!({"labels": ["stone-actions"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .add_labels(42, &["stone-actions".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_file_content_decodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/contents/src/lib.rs"))
            .and(query_param("ref", "stone/issue-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "path": "src/lib.rs",
                "sha": "abc123",
                "content": "cHViIGZuIG1h\naW4oKSB7fQ==\n",
            })))
            .mount(&server)
            .await;

        let file = client(&server)
            .get_file_content("src/lib.rs", "stone/issue-42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.sha, "abc123");
        assert_eq!(file.content, "pub fn main() {}");
    }

    #[tokio::test]
    async fn test_get_missing_file_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/contents/README.md"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let file = client(&server).get_file_content("README.md", "main").await.unwrap();
        assert!(file.is_none());
    }

    #[tokio::test]
    async fn test_find_open_pull_request_fetches_mergeability() {
        let server = MockServer::start().await;
        let pull = json!({
            "number": 5,
            "title": "Resolve #42",
            "html_url": "https://github.com/acme/widgets/pull/5",
            "state": "open",
            "head": {"ref": "stone/issue-42"},
            "base": {"ref": "main"},
            "mergeable": false,
            "mergeable_state": "dirty",
        });
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/pulls"))
            .and(query_param("head", "acme:stone/issue-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([pull.clone()])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/pulls/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pull))
            .mount(&server)
            .await;

        let pr = client(&server)
            .find_open_pull_request("stone/issue-42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pr.number, 5);
        assert_eq!(pr.mergeable, Some(false));
        assert_eq!(pr.mergeable_state.as_deref(), Some("dirty"));
    }

    #[tokio::test]
    async fn test_ensure_branch_creates_from_base() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/git/ref/heads/stone/issue-42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/git/ref/heads/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": {"sha": "deadbeef"}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widgets/git/refs"))
            .and(body_partial_json(json!({"ref": "refs/heads/stone/issue-42", "sha": "deadbeef"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).ensure_branch("stone/issue-42", "main").await.unwrap();
    }

    #[tokio::test]
    async fn test_latest_workflow_runs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/actions/runs"))
            .and(query_param("branch", "stone/issue-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "workflow_runs": [
                    {"name": "CI", "status": "completed", "conclusion": "failure",
                     "head_branch": "stone/issue-42", "html_url": "https://github.com/acme/widgets/actions/runs/1"},
                    {"name": "Lint", "status": "in_progress", "conclusion": null,
                     "head_branch": "stone/issue-42", "html_url": "https://github.com/acme/widgets/actions/runs/2"}
                ]
            })))
            .mount(&server)
            .await;

        let runs = client(&server)
            .latest_workflow_runs(Some("stone/issue-42"), 5)
            .await
            .unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].is_failure());
        assert!(!runs[1].is_failure());
    }

    #[test]
    fn test_encode_path_keeps_separators() {
        assert_eq!(encode_path("docs/my file.md"), "docs/my%20file.md");
        assert_eq!(encode_path("/src/lib.rs"), "src/lib.rs");
    }
}
