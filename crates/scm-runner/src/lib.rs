//! Incremental and backfill scheduling (spec §4.K). The runner is the one
//! actor that writes `sync_jobs` rows on purpose rather than in response
//! to one; it shares the `scm.kv` cursor store with the breaker/pause
//! registry, keyed under its own namespace.

use chrono::{DateTime, Duration, Utc};
use scm_types::job::{BackfillWindow, JobPayload, JobType, SyncMode};
use scm_queue::JobQueue;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

const CURSOR_NAMESPACE: &str = "scm.sync";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Queue(#[from] scm_queue::QueueError),
    #[error("watermark regression: before={before}, after={after}")]
    WatermarkConstraint { before: String, after: String },
}

fn cursor_key(repo_id: i64, job_type: JobType) -> String {
    format!("{}_cursor:{repo_id}", job_type.as_str())
}

pub async fn read_cursor(pool: &PgPool, repo_id: i64, job_type: JobType) -> Result<Option<serde_json::Value>, RunnerError> {
    let value = sqlx::query_scalar::<_, serde_json::Value>(
        "SELECT value_json FROM scm.kv WHERE namespace = $1 AND key = $2",
    )
    .bind(CURSOR_NAMESPACE)
    .bind(cursor_key(repo_id, job_type))
    .fetch_optional(pool)
    .await?;
    Ok(value)
}

pub async fn write_cursor(pool: &PgPool, repo_id: i64, job_type: JobType, cursor: &serde_json::Value) -> Result<(), RunnerError> {
    sqlx::query(
        "INSERT INTO scm.kv (namespace, key, value_json, updated_at) VALUES ($1, $2, $3, now())
         ON CONFLICT (namespace, key) DO UPDATE SET value_json = $3, updated_at = now()",
    )
    .bind(CURSOR_NAMESPACE)
    .bind(cursor_key(repo_id, job_type))
    .bind(cursor)
    .execute(pool)
    .await?;
    Ok(())
}

/// Numeric ordering key for a watermark value: timestamps compare as
/// epoch seconds, revisions as themselves. `None` means the two values
/// aren't comparable (mixed types, unparseable string) — monotonicity is
/// then assumed satisfied rather than guessed at.
fn watermark_order(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp() as f64),
        _ => None,
    }
}

/// Spec §4.K: `watermark_after >= watermark_before`, else
/// `WatermarkConstraintError` and the cursor is left untouched.
pub fn check_watermark_monotonic(before: &serde_json::Value, after: &serde_json::Value) -> Result<(), RunnerError> {
    if let (Some(b), Some(a)) = (watermark_order(before), watermark_order(after)) {
        if a < b {
            return Err(RunnerError::WatermarkConstraint {
                before: before.to_string(),
                after: after.to_string(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerDefaults {
    pub priority: i32,
    pub max_attempts: i32,
    pub lease_seconds: i32,
    pub chunk_hours: i64,
    pub chunk_size: i64,
}

impl Default for RunnerDefaults {
    fn default() -> Self {
        Self {
            priority: scm_types::job::DEFAULT_PRIORITY,
            max_attempts: scm_types::job::DEFAULT_MAX_ATTEMPTS,
            lease_seconds: scm_types::job::DEFAULT_LEASE_SECONDS,
            chunk_hours: 4,
            chunk_size: 100,
        }
    }
}

pub struct Runner {
    pool: PgPool,
    queue: JobQueue,
    defaults: RunnerDefaults,
}

impl Runner {
    pub fn new(pool: PgPool, queue: JobQueue, defaults: RunnerDefaults) -> Self {
        Self { pool, queue, defaults }
    }

    /// Enqueues exactly one pending job for `(repo_id, job_type)`. The
    /// partial-unique index on `sync_jobs` makes this a no-op (`Ok(None)`)
    /// if a pending/running row already exists — the runner doesn't need
    /// to pre-check.
    pub async fn enqueue_incremental(&self, repo_id: i64, job_type: JobType) -> Result<Option<Uuid>, RunnerError> {
        let job_id = self
            .queue
            .enqueue(
                repo_id,
                job_type,
                SyncMode::Incremental,
                self.defaults.priority,
                &JobPayload::default(),
                self.defaults.max_attempts,
                Utc::now(),
                self.defaults.lease_seconds,
            )
            .await?;
        Ok(job_id)
    }

    /// Splits a time window into `chunk_hours`-sized chunks and enqueues
    /// one backfill job per chunk.
    pub async fn enqueue_backfill_time(
        &self,
        repo_id: i64,
        job_type: JobType,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        update_watermark: bool,
    ) -> Result<Vec<Uuid>, RunnerError> {
        let chunks = split_time_window(since, until, self.defaults.chunk_hours);
        self.enqueue_chunks(repo_id, job_type, chunks.into_iter().map(|(s, u)| BackfillWindow::Time { since: s, until: u }), update_watermark)
            .await
    }

    /// Splits a revision window into `chunk_size`-sized chunks and
    /// enqueues one backfill job per chunk.
    pub async fn enqueue_backfill_revisions(
        &self,
        repo_id: i64,
        job_type: JobType,
        start_rev: i64,
        end_rev: i64,
        update_watermark: bool,
    ) -> Result<Vec<Uuid>, RunnerError> {
        let chunks = split_revision_window(start_rev, end_rev, self.defaults.chunk_size);
        self.enqueue_chunks(
            repo_id,
            job_type,
            chunks.into_iter().map(|(s, e)| BackfillWindow::Revision { start_rev: s, end_rev: e }),
            update_watermark,
        )
        .await
    }

    async fn enqueue_chunks(
        &self,
        repo_id: i64,
        job_type: JobType,
        windows: impl Iterator<Item = BackfillWindow>,
        update_watermark: bool,
    ) -> Result<Vec<Uuid>, RunnerError> {
        let windows: Vec<BackfillWindow> = windows.collect();
        let chunk_total = windows.len() as u32;
        let mut job_ids = Vec::with_capacity(windows.len());

        for (index, window) in windows.into_iter().enumerate() {
            let payload = JobPayload {
                window: Some(window),
                chunk_index: Some(index as u32),
                chunk_total: Some(chunk_total),
                update_watermark: Some(update_watermark),
                watermark_constraint: None,
                gitlab_instance: None,
                tenant_id: None,
                extra: serde_json::Map::new(),
            };

            if let Some(job_id) = self
                .queue
                .enqueue(
                    repo_id,
                    job_type,
                    SyncMode::Backfill,
                    self.defaults.priority,
                    &payload,
                    self.defaults.max_attempts,
                    Utc::now(),
                    self.defaults.lease_seconds,
                )
                .await?
            {
                job_ids.push(job_id);
            }
        }

        Ok(job_ids)
    }

    /// Verifies `watermark_after >= watermark_before` and, only if it
    /// holds, persists the new cursor (spec §4.K).
    pub async fn advance_watermark(
        &self,
        repo_id: i64,
        job_type: JobType,
        watermark_after: serde_json::Value,
    ) -> Result<(), RunnerError> {
        let before = read_cursor(&self.pool, repo_id, job_type).await?.unwrap_or(serde_json::Value::Null);
        check_watermark_monotonic(&before, &watermark_after)?;
        write_cursor(&self.pool, repo_id, job_type, &watermark_after).await
    }
}

/// `chunk_hours`-wide, half-open `[since, until)` slices covering the
/// whole requested window; the final slice is clipped to `until`.
pub fn split_time_window(since: DateTime<Utc>, until: DateTime<Utc>, chunk_hours: i64) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    if since >= until || chunk_hours <= 0 {
        return Vec::new();
    }
    let step = Duration::hours(chunk_hours);
    let mut chunks = Vec::new();
    let mut cursor = since;
    while cursor < until {
        let end = (cursor + step).min(until);
        chunks.push((cursor, end));
        cursor = end;
    }
    chunks
}

/// `chunk_size`-wide, inclusive `[start_rev, end_rev]` slices.
pub fn split_revision_window(start_rev: i64, end_rev: i64, chunk_size: i64) -> Vec<(i64, i64)> {
    if start_rev > end_rev || chunk_size <= 0 {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut cursor = start_rev;
    while cursor <= end_rev {
        let chunk_end = (cursor + chunk_size - 1).min(end_rev);
        chunks.push((cursor, chunk_end));
        cursor = chunk_end + 1;
    }
    chunks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AggregateReport {
    pub success_chunks: u32,
    pub partial_chunks: u32,
    pub failed_chunks: u32,
}

impl AggregateReport {
    pub fn from_statuses(statuses: &[ChunkStatus]) -> Self {
        let mut report = Self::default();
        for status in statuses {
            match status {
                ChunkStatus::Success => report.success_chunks += 1,
                ChunkStatus::Partial => report.partial_chunks += 1,
                ChunkStatus::Failed => report.failed_chunks += 1,
            }
        }
        report
    }

    /// Any failure (partial or outright) makes the overall run `partial`,
    /// unless every chunk failed, in which case it's `failed` (spec §4.K).
    pub fn overall(&self) -> OverallStatus {
        let total = self.success_chunks + self.partial_chunks + self.failed_chunks;
        if total > 0 && self.failed_chunks == total {
            OverallStatus::Failed
        } else if self.partial_chunks > 0 || self.failed_chunks > 0 {
            OverallStatus::Partial
        } else {
            OverallStatus::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_window_splits_into_default_four_hour_chunks() {
        let since = Utc::now();
        let until = since + Duration::hours(10);
        let chunks = split_time_window(since, until, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].1, since + Duration::hours(4));
        assert_eq!(chunks.last().unwrap().1, until);
    }

    #[test]
    fn revision_window_splits_into_default_hundred_chunks() {
        let chunks = split_revision_window(1, 250, 100);
        assert_eq!(chunks, vec![(1, 100), (101, 200), (201, 250)]);
    }

    #[test]
    fn watermark_regression_is_rejected() {
        let before = serde_json::json!(100);
        let after = serde_json::json!(50);
        assert!(check_watermark_monotonic(&before, &after).is_err());
    }

    #[test]
    fn watermark_advance_is_accepted() {
        let before = serde_json::json!(100);
        let after = serde_json::json!(150);
        assert!(check_watermark_monotonic(&before, &after).is_ok());
    }

    #[test]
    fn aggregate_all_failed_is_failed_not_partial() {
        let report = AggregateReport::from_statuses(&[ChunkStatus::Failed, ChunkStatus::Failed]);
        assert_eq!(report.overall(), OverallStatus::Failed);
    }

    #[test]
    fn aggregate_mixed_results_is_partial() {
        let report = AggregateReport::from_statuses(&[ChunkStatus::Success, ChunkStatus::Failed]);
        assert_eq!(report.overall(), OverallStatus::Partial);
    }

    #[test]
    fn aggregate_all_success_is_success() {
        let report = AggregateReport::from_statuses(&[ChunkStatus::Success, ChunkStatus::Success]);
        assert_eq!(report.overall(), OverallStatus::Success);
    }
}
