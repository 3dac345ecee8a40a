use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `sync_jobs.job_type`. Closed taxonomy — the Runner only ever schedules
/// one of these four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    GitlabCommits,
    GitlabMrs,
    GitlabReviews,
    Svn,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::GitlabCommits => "gitlab_commits",
            JobType::GitlabMrs => "gitlab_mrs",
            JobType::GitlabReviews => "gitlab_reviews",
            JobType::Svn => "svn",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gitlab_commits" => Ok(JobType::GitlabCommits),
            "gitlab_mrs" => Ok(JobType::GitlabMrs),
            "gitlab_reviews" => Ok(JobType::GitlabReviews),
            "svn" => Ok(JobType::Svn),
            other => Err(format!("unknown job_type: {other}")),
        }
    }
}

/// `sync_jobs.mode` / `sync_runs.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    Backfill,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Backfill => "backfill",
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incremental" => Ok(SyncMode::Incremental),
            "backfill" => Ok(SyncMode::Backfill),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// `sync_jobs.status`. Lifecycle: `pending -> running -> (completed | failed
/// | dead)`, with `failed` retryable back to `running` until `attempts >=
/// max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A backfill window descriptor carried in `sync_jobs.payload_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "window_type", rename_all = "snake_case")]
pub enum BackfillWindow {
    Time {
        since: chrono::DateTime<chrono::Utc>,
        until: chrono::DateTime<chrono::Utc>,
    },
    Revision {
        start_rev: i64,
        end_rev: i64,
    },
}

/// `sync_jobs.payload_json`, typed. Extra unrecognized keys round-trip
/// through `extra` so a forward-compatible payload doesn't get truncated
/// by an older worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub window: Option<BackfillWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_total: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_watermark: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark_constraint: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gitlab_instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A full `sync_jobs` row, as returned by `claim`/`get_job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub repo_id: i64,
    pub job_type: JobType,
    pub mode: SyncMode,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub payload: JobPayload,
    pub last_error: Option<String>,
    pub last_run_id: Option<Uuid>,
    pub lease_seconds: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub const DEFAULT_PRIORITY: i32 = 100;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const DEFAULT_LEASE_SECONDS: i32 = 300;
pub const DEFAULT_BACKOFF_BASE_SECONDS: i64 = 60;

/// Exponential backoff per spec.md §4.F: `60 * 2^(attempts-1)`.
pub fn default_backoff_seconds(attempts: i32) -> i64 {
    let exponent = (attempts - 1).max(0);
    DEFAULT_BACKOFF_BASE_SECONDS.saturating_mul(1i64 << exponent.min(32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_from_first_attempt() {
        assert_eq!(default_backoff_seconds(1), 60);
        assert_eq!(default_backoff_seconds(2), 120);
        assert_eq!(default_backoff_seconds(3), 240);
        assert_eq!(default_backoff_seconds(4), 480);
    }

    #[test]
    fn job_type_round_trips_through_str() {
        for jt in [
            JobType::GitlabCommits,
            JobType::GitlabMrs,
            JobType::GitlabReviews,
            JobType::Svn,
        ] {
            let parsed: JobType = jt.as_str().parse().unwrap();
            assert_eq!(parsed, jt);
        }
    }
}
