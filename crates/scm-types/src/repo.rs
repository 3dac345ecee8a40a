use serde::{Deserialize, Serialize};

/// The two upstream VCS kinds the core knows how to track. UNIQUE on
/// `(repo_type, url)` at the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    Git,
    Svn,
}

impl RepoType {
    pub fn as_str(self) -> &'static str {
        match self {
            RepoType::Git => "git",
            RepoType::Svn => "svn",
        }
    }
}

impl std::str::FromStr for RepoType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(RepoType::Git),
            "svn" => Ok(RepoType::Svn),
            other => Err(format!("unknown repo_type: {other}")),
        }
    }
}

/// Row in `repos`. Immutable once created except for `project_key` /
/// `default_branch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub repo_id: i64,
    pub repo_type: RepoType,
    pub url: String,
    pub project_key: String,
    pub default_branch: Option<String>,
}

impl Repo {
    /// The leading `tenant/` segment of `project_key`, used for breaker
    /// scope resolution and cross-repo quota aggregation. Absent when the
    /// project key carries no tenant prefix.
    pub fn tenant(&self) -> Option<&str> {
        self.project_key.split_once('/').map(|(tenant, _)| tenant)
    }
}

/// A single observed commit or revision, as stored in `git_commits` /
/// `svn_revisions`. The two tables share this shape; `external_key` holds
/// `commit_sha` or `rev_num` respectively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub repo_id: i64,
    pub repo_type: RepoType,
    pub external_key: String,
    pub author_raw: Option<String>,
    pub authored_at: Option<chrono::DateTime<chrono::Utc>>,
    pub message: Option<String>,
    pub is_bulk: bool,
    pub is_merge: bool,
    pub meta_json: serde_json::Value,
}

impl Revision {
    /// `svn:<repo_id>:<rev>` or `git:<repo_id>:<sha>` — the stable
    /// cross-table key used as `patch_blobs.source_id`.
    pub fn source_id(&self) -> String {
        format!("{}:{}:{}", self.repo_type.as_str(), self.repo_id, self.external_key)
    }
}

/// `mrs.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrStatus {
    Opened,
    Merged,
    Closed,
}

/// Row in `mrs`. Primary key is the composite string `mr_id`
/// (`<platform>:<project>:<iid>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub mr_id: String,
    pub status: MrStatus,
    pub author: Option<String>,
    pub url: Option<String>,
    pub meta_json: serde_json::Value,
}

/// Row in `review_events`, append-only. Dedup key is `(mr_id, source_event_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewEvent {
    pub mr_id: String,
    pub source_event_id: String,
    pub kind: String,
    pub payload_json: serde_json::Value,
}
