//! Opens and closes `scm.sync_runs` rows, enforcing the run-finish payload
//! contract before any write lands (spec §4.G).

use chrono::{DateTime, Utc};
use scm_types::job::{JobType, SyncMode};
use scm_types::run::{Degradation, ErrorSummary, RunCounts, RunStatus};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunRecorderError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// What a handler/executor hands back to close out a run. Validated by
/// [`validate_finish_payload`] before `finish` writes it.
#[derive(Debug, Clone)]
pub struct FinishPayload {
    pub status: RunStatus,
    pub cursor_after: Option<serde_json::Value>,
    pub counts: Option<RunCounts>,
    pub error_summary: Option<ErrorSummary>,
    pub degradation: Option<Degradation>,
}

/// Spec §4.G "Run-finish payload contract". On failure the caller should
/// still write the run — with `status=failed` and
/// `error_category=contract_error` — rather than drop it silently.
pub fn validate_finish_payload(payload: &FinishPayload) -> Result<(), ErrorSummary> {
    let contract_violation = |message: &str| ErrorSummary {
        error_category: "contract_error".to_string(),
        message: Some(message.to_string()),
        endpoint: None,
        status_code: None,
        context: serde_json::Map::new(),
    };

    match payload.status {
        RunStatus::Failed => {
            let Some(summary) = &payload.error_summary else {
                return Err(contract_violation(
                    "status=failed requires error_summary_json",
                ));
            };
            if summary.error_category.trim().is_empty() {
                return Err(contract_violation("error_summary_json.error_category is required"));
            }
        }
        RunStatus::Completed => {
            if let Some(counts) = &payload.counts {
                if !counts.all_non_negative() {
                    return Err(contract_violation("counts must be non-negative integers"));
                }
                if payload.error_summary.is_none() && counts.get("synced_count").unwrap_or(0) < 0 {
                    return Err(contract_violation("synced_count must be >= 0"));
                }
            }
        }
        RunStatus::NoData | RunStatus::Running => {}
    }

    if let Some(counts) = &payload.counts {
        if !counts.all_non_negative() {
            return Err(contract_violation("counts must be non-negative integers"));
        }
    }

    Ok(())
}

pub struct RunRecorder {
    pool: PgPool,
}

impl RunRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn start(
        &self,
        run_id: Uuid,
        repo_id: i64,
        job_type: JobType,
        mode: SyncMode,
        cursor_before: serde_json::Value,
    ) -> Result<(), RunRecorderError> {
        sqlx::query(
            "INSERT INTO scm.sync_runs (run_id, repo_id, job_type, mode, started_at, cursor_before, status)
             VALUES ($1, $2, $3, $4, now(), $5, 'running')",
        )
        .bind(run_id)
        .bind(repo_id)
        .bind(job_type.as_str())
        .bind(mode.as_str())
        .bind(cursor_before)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Validates `payload` first; an invalid payload is still persisted,
    /// but coerced to `status=failed, error_category=contract_error`
    /// rather than rejected (spec §4.G).
    pub async fn finish(&self, run_id: Uuid, payload: FinishPayload) -> Result<(), RunRecorderError> {
        let (status, error_summary) = match validate_finish_payload(&payload) {
            Ok(()) => (payload.status, payload.error_summary),
            Err(contract_error) => {
                tracing::warn!(%run_id, reason = %contract_error.message.as_deref().unwrap_or(""), "run-finish payload failed contract validation");
                (RunStatus::Failed, Some(contract_error))
            }
        };

        let counts_json = payload.counts.map(|c| serde_json::to_value(c.0).unwrap());
        let error_summary_json = error_summary.map(|e| serde_json::to_value(e).unwrap());
        let degradation_json = payload.degradation.map(|d| serde_json::to_value(d.0).unwrap());

        sqlx::query(
            "UPDATE scm.sync_runs
             SET finished_at = now(), status = $2, cursor_after = $3,
                 counts = $4, error_summary_json = $5, degradation_json = $6
             WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(payload.cursor_after)
        .bind(counts_json)
        .bind(error_summary_json)
        .bind(degradation_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, i64)]) -> RunCounts {
        let mut map = serde_json::Map::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), serde_json::json!(v));
        }
        RunCounts(map)
    }

    #[test]
    fn failed_status_requires_error_summary() {
        let payload = FinishPayload {
            status: RunStatus::Failed,
            cursor_after: None,
            counts: None,
            error_summary: None,
            degradation: None,
        };
        assert!(validate_finish_payload(&payload).is_err());
    }

    #[test]
    fn failed_status_with_error_summary_passes() {
        let payload = FinishPayload {
            status: RunStatus::Failed,
            cursor_after: None,
            counts: None,
            error_summary: Some(ErrorSummary {
                error_category: "timeout".to_string(),
                message: None,
                endpoint: None,
                status_code: None,
                context: serde_json::Map::new(),
            }),
            degradation: None,
        };
        assert!(validate_finish_payload(&payload).is_ok());
    }

    #[test]
    fn no_data_may_omit_counts() {
        let payload = FinishPayload {
            status: RunStatus::NoData,
            cursor_after: None,
            counts: None,
            error_summary: None,
            degradation: None,
        };
        assert!(validate_finish_payload(&payload).is_ok());
    }

    #[test]
    fn negative_counts_are_rejected() {
        let payload = FinishPayload {
            status: RunStatus::Completed,
            cursor_after: None,
            counts: Some(counts(&[("synced_count", -1)])),
            error_summary: None,
            degradation: None,
        };
        assert!(validate_finish_payload(&payload).is_err());
    }

    #[test]
    fn completed_with_non_negative_counts_passes() {
        let payload = FinishPayload {
            status: RunStatus::Completed,
            cursor_after: None,
            counts: Some(counts(&[("synced_count", 3), ("skipped_count", 0)])),
            error_summary: None,
            degradation: None,
        };
        assert!(validate_finish_payload(&payload).is_ok());
    }
}
