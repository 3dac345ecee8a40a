//! External capability traits the core queue/materializer/worker consume
//! but never implement (spec §6). Production adapters (GitLab HTTP client,
//! `git`/`svn` CLI shell-outs) live outside this workspace; what's here is
//! the trait boundary plus in-memory test doubles.

use async_trait::async_trait;
use scm_errors::SyncError;
use scm_types::repo::Repo;

#[derive(Debug, Clone, Default)]
pub struct PageOpts {
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub external_key: String,
    pub author_raw: Option<String>,
    pub authored_at: Option<chrono::DateTime<chrono::Utc>>,
    pub message: Option<String>,
    pub is_merge: bool,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct MrRecord {
    pub mr_id: String,
    pub status: String,
    pub author: Option<String>,
    pub url: Option<String>,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ReviewEventRecord {
    pub source_event_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Fetches raw content and paginated listings from an upstream SCM host.
/// Implementations classify failures into [`SyncError`] themselves —
/// the core never inspects a raw exception (spec §4.C).
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_commit_diff(&self, repo: &Repo, sha: &str) -> Result<Vec<u8>, SyncError>;

    async fn fetch_svn_diff(&self, repo: &Repo, rev: i64) -> Result<Vec<u8>, SyncError>;

    async fn list_commits_since(
        &self,
        repo: &Repo,
        cursor: Option<&str>,
        page: PageOpts,
    ) -> Result<Vec<CommitRecord>, SyncError>;

    async fn list_merge_requests(
        &self,
        repo: &Repo,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<MrRecord>, SyncError>;

    async fn list_review_events(
        &self,
        repo: &Repo,
        mr_iid: &str,
    ) -> Result<Vec<ReviewEventRecord>, SyncError>;
}

/// `get() -> token`, `invalidate()`. On an `auth_error`, callers invalidate
/// and retry exactly once (spec §4.I "Worker authentication").
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get(&self) -> Result<String, SyncError>;
    async fn invalidate(&self);
}

/// Fixed-token provider for tests and for deployments where rotation isn't
/// needed; `invalidate` is a no-op since there's nowhere else to fetch a
/// replacement from.
pub struct StaticCredentialProvider {
    token: String,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get(&self) -> Result<String, SyncError> {
        Ok(self.token.clone())
    }

    async fn invalidate(&self) {}
}

/// In-memory `SourceFetcher` double for integration tests: commits, MRs,
/// and review events are preloaded; diffs are keyed by `sha`/`rev`.
#[derive(Default)]
pub struct InMemorySourceFetcher {
    pub commit_diffs: std::collections::HashMap<String, Vec<u8>>,
    pub svn_diffs: std::collections::HashMap<i64, Vec<u8>>,
    pub commits: Vec<CommitRecord>,
    pub merge_requests: Vec<MrRecord>,
    pub review_events: std::collections::HashMap<String, Vec<ReviewEventRecord>>,
}

impl InMemorySourceFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceFetcher for InMemorySourceFetcher {
    async fn fetch_commit_diff(&self, _repo: &Repo, sha: &str) -> Result<Vec<u8>, SyncError> {
        self.commit_diffs
            .get(sha)
            .cloned()
            .ok_or_else(|| SyncError::new(scm_errors::ErrorCategory::RepoNotFound, format!("no diff for {sha}")))
    }

    async fn fetch_svn_diff(&self, _repo: &Repo, rev: i64) -> Result<Vec<u8>, SyncError> {
        self.svn_diffs
            .get(&rev)
            .cloned()
            .ok_or_else(|| SyncError::new(scm_errors::ErrorCategory::RepoNotFound, format!("no diff for r{rev}")))
    }

    async fn list_commits_since(
        &self,
        _repo: &Repo,
        _cursor: Option<&str>,
        _page: PageOpts,
    ) -> Result<Vec<CommitRecord>, SyncError> {
        Ok(self.commits.clone())
    }

    async fn list_merge_requests(
        &self,
        _repo: &Repo,
        _since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<MrRecord>, SyncError> {
        Ok(self.merge_requests.clone())
    }

    async fn list_review_events(
        &self,
        _repo: &Repo,
        mr_iid: &str,
    ) -> Result<Vec<ReviewEventRecord>, SyncError> {
        Ok(self.review_events.get(mr_iid).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scm_types::repo::{Repo, RepoType};

    fn sample_repo() -> Repo {
        Repo {
            repo_id: 1,
            repo_type: RepoType::Git,
            url: "https://example.com/repo.git".to_string(),
            project_key: "acme/svc".to_string(),
            default_branch: Some("main".to_string()),
        }
    }

    #[tokio::test]
    async fn in_memory_fetcher_returns_preloaded_diff() {
        let mut fetcher = InMemorySourceFetcher::new();
        fetcher.commit_diffs.insert("abc123".to_string(), b"diff bytes".to_vec());
        let repo = sample_repo();
        let bytes = fetcher.fetch_commit_diff(&repo, "abc123").await.unwrap();
        assert_eq!(bytes, b"diff bytes");
    }

    #[tokio::test]
    async fn in_memory_fetcher_errors_on_missing_diff() {
        let fetcher = InMemorySourceFetcher::new();
        let repo = sample_repo();
        let err = fetcher.fetch_commit_diff(&repo, "missing").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn static_credential_provider_returns_fixed_token() {
        let provider = StaticCredentialProvider::new("tok-123");
        assert_eq!(provider.get().await.unwrap(), "tok-123");
        provider.invalidate().await;
        assert_eq!(provider.get().await.unwrap(), "tok-123");
    }
}
