use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobType, SyncMode};

/// `sync_runs.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    NoData,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::NoData => "no_data",
        }
    }
}

/// Flat map of well-known non-negative counters, plus anything a handler
/// chooses to report. Validated by `scm-run-recorder` before a run-finish
/// write: every value must be representable as a non-negative integer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounts(pub serde_json::Map<String, serde_json::Value>);

impl RunCounts {
    pub fn get(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| v.as_i64())
    }

    pub fn all_non_negative(&self) -> bool {
        self.0.values().all(|v| match v.as_i64() {
            Some(n) => n >= 0,
            None => false,
        })
    }
}

/// `sync_runs.error_summary_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub error_category: String,
    pub message: Option<String>,
    pub endpoint: Option<String>,
    pub status_code: Option<i32>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// `sync_runs.degradation_json` — non-fatal degraded-mode markers (e.g.
/// "used ministat because GitLab refused the real diff").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Degradation(pub serde_json::Map<String, serde_json::Value>);

/// A `sync_runs` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub repo_id: i64,
    pub job_type: JobType,
    pub mode: SyncMode,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub cursor_before: serde_json::Value,
    pub cursor_after: Option<serde_json::Value>,
    pub counts: Option<RunCounts>,
    pub error_summary: Option<ErrorSummary>,
    pub degradation: Option<Degradation>,
    pub status: RunStatus,
}
