//! Periodic orphan recovery (spec §4.J): expired running jobs, runs that
//! overran `max_duration`, and stale `sync_locks` rows. Grounded on the
//! `FOR UPDATE SKIP LOCKED` / conditional-`UPDATE` idiom already used by
//! `scm-queue`; the reaper never holds more than one row lock at a time,
//! so it can't deadlock against a worker.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// What to do with a job whose lease has expired (spec §4.J rule 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiredJobPolicy {
    ToPending,
    FailRetry,
    MarkDead,
}

#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub grace_seconds: i32,
    pub max_run_duration_seconds: i64,
    pub batch_size: i64,
    pub expired_job_policy: ExpiredJobPolicy,
    pub reaper_backoff_base_seconds: i64,
    pub max_reaper_backoff_seconds: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            grace_seconds: 30,
            max_run_duration_seconds: 3600,
            batch_size: 200,
            expired_job_policy: ExpiredJobPolicy::FailRetry,
            reaper_backoff_base_seconds: 60,
            max_reaper_backoff_seconds: 3600,
        }
    }
}

/// `min(base * 2^attempts, max)` — spec §4.J's reaper-specific backoff,
/// distinct from the worker's `default_backoff_seconds` because it's keyed
/// on post-increment `attempts`, not `attempts - 1`.
pub fn reaper_backoff_seconds(attempts: i32, base: i64, max: i64) -> i64 {
    let exponent = attempts.max(0).min(32) as u32;
    let raw = base.saturating_mul(1i64 << exponent);
    raw.min(max)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReapReport {
    pub jobs_recovered: u64,
    pub runs_failed: u64,
    pub locks_cleared: u64,
}

pub struct Reaper {
    pool: PgPool,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(pool: PgPool, config: ReaperConfig) -> Self {
        Self { pool, config }
    }

    /// Runs all three sweeps once, each in its own bounded batch. Safe to
    /// call repeatedly — a second pass over already-recovered rows is a
    /// no-op because the `WHERE` clauses no longer match them.
    pub async fn reap_once(&self) -> Result<ReapReport, ReaperError> {
        let report = ReapReport {
            jobs_recovered: self.reap_expired_jobs().await?,
            runs_failed: self.reap_expired_runs().await?,
            locks_cleared: self.reap_expired_locks().await?,
        };
        if report.jobs_recovered > 0 || report.runs_failed > 0 || report.locks_cleared > 0 {
            tracing::info!(
                jobs_recovered = report.jobs_recovered,
                runs_failed = report.runs_failed,
                locks_cleared = report.locks_cleared,
                "reaper sweep recovered orphans"
            );
        }
        Ok(report)
    }

    /// `status='running' AND locked_at + (lease_seconds + grace_seconds) < now()`.
    pub async fn reap_expired_jobs(&self) -> Result<u64, ReaperError> {
        #[derive(sqlx::FromRow)]
        struct Candidate {
            job_id: uuid::Uuid,
            attempts: i32,
            max_attempts: i32,
        }

        let candidates = sqlx::query_as::<_, Candidate>(
            "SELECT job_id, attempts, max_attempts FROM scm.sync_jobs
             WHERE status = 'running'
               AND locked_at + make_interval(secs => lease_seconds + $1) < now()
             ORDER BY locked_at ASC
             LIMIT $2
             FOR UPDATE SKIP LOCKED",
        )
        .bind(self.config.grace_seconds)
        .bind(self.config.batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0u64;
        for candidate in candidates {
            let affected = match self.config.expired_job_policy {
                ExpiredJobPolicy::ToPending => {
                    sqlx::query(
                        "UPDATE scm.sync_jobs
                         SET status = 'pending', locked_by = NULL, locked_at = NULL, updated_at = now()
                         WHERE job_id = $1 AND status = 'running'",
                    )
                    .bind(candidate.job_id)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
                }
                ExpiredJobPolicy::MarkDead => {
                    sqlx::query(
                        "UPDATE scm.sync_jobs
                         SET status = 'dead', locked_by = NULL, locked_at = NULL,
                             last_error = 'reaped: lease expired', updated_at = now()
                         WHERE job_id = $1 AND status = 'running'",
                    )
                    .bind(candidate.job_id)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
                }
                ExpiredJobPolicy::FailRetry => {
                    let next_attempts = candidate.attempts + 1;
                    if next_attempts >= candidate.max_attempts {
                        sqlx::query(
                            "UPDATE scm.sync_jobs
                             SET status = 'dead', locked_by = NULL, locked_at = NULL,
                                 attempts = $2, last_error = 'reaped: lease expired', updated_at = now()
                             WHERE job_id = $1 AND status = 'running'",
                        )
                        .bind(candidate.job_id)
                        .bind(next_attempts)
                        .execute(&self.pool)
                        .await?
                        .rows_affected()
                    } else {
                        let backoff = reaper_backoff_seconds(
                            next_attempts,
                            self.config.reaper_backoff_base_seconds,
                            self.config.max_reaper_backoff_seconds,
                        );
                        sqlx::query(
                            "UPDATE scm.sync_jobs
                             SET status = 'failed', locked_by = NULL, locked_at = NULL,
                                 attempts = $2, last_error = 'reaped: lease expired',
                                 not_before = now() + make_interval(secs => $3), updated_at = now()
                             WHERE job_id = $1 AND status = 'running'",
                        )
                        .bind(candidate.job_id)
                        .bind(next_attempts)
                        .bind(backoff as i32)
                        .execute(&self.pool)
                        .await?
                        .rows_affected()
                    }
                }
            };
            recovered += affected;
        }

        Ok(recovered)
    }

    /// `started_at + max_duration < now() AND status = 'running'` → mark
    /// `failed` with a synthesized `error_summary_json`.
    pub async fn reap_expired_runs(&self) -> Result<u64, ReaperError> {
        let error_summary = serde_json::json!({
            "error_category": "timeout",
            "message": format!(
                "run exceeded max duration of {}s and was reaped",
                self.config.max_run_duration_seconds
            ),
        });

        let result = sqlx::query(
            "UPDATE scm.sync_runs
             SET status = 'failed', finished_at = now(), error_summary_json = $2
             WHERE run_id IN (
                 SELECT run_id FROM scm.sync_runs
                 WHERE status = 'running'
                   AND started_at + make_interval(secs => $1) < now()
                 ORDER BY started_at ASC
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )",
        )
        .bind(self.config.max_run_duration_seconds as i32)
        .bind(error_summary)
        .bind(self.config.batch_size)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Clears stale `sync_locks` rows — the advisory lock table, distinct
    /// from job leases.
    pub async fn reap_expired_locks(&self) -> Result<u64, ReaperError> {
        let result = sqlx::query(
            "UPDATE scm.sync_locks
             SET locked_by = NULL, locked_at = NULL
             WHERE locked_by IS NOT NULL
               AND locked_at + make_interval(secs => lease_seconds + $1) < now()
               AND lock_id IN (
                   SELECT lock_id FROM scm.sync_locks
                   WHERE locked_by IS NOT NULL
                     AND locked_at + make_interval(secs => lease_seconds + $1) < now()
                   LIMIT $2
                   FOR UPDATE SKIP LOCKED
               )",
        )
        .bind(self.config.grace_seconds)
        .bind(self.config.batch_size)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Whether a run that's still `running` in the DB has actually overrun,
/// used by tests and by callers that want to pre-filter before querying.
pub fn run_has_expired(started_at: DateTime<Utc>, now: DateTime<Utc>, max_duration_seconds: i64) -> bool {
    (now - started_at).num_seconds() > max_duration_seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaper_backoff_caps_at_max() {
        assert_eq!(reaper_backoff_seconds(1, 60, 3600), 120);
        assert_eq!(reaper_backoff_seconds(2, 60, 3600), 240);
        assert_eq!(reaper_backoff_seconds(10, 60, 3600), 3600);
    }

    #[test]
    fn run_expiry_checks_elapsed_duration() {
        let started = Utc::now() - chrono::Duration::seconds(4000);
        assert!(run_has_expired(started, Utc::now(), 3600));
        assert!(!run_has_expired(Utc::now(), Utc::now(), 3600));
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = ReaperConfig::default();
        assert_eq!(cfg.expired_job_policy, ExpiredJobPolicy::FailRetry);
        assert_eq!(cfg.grace_seconds, 30);
    }
}
