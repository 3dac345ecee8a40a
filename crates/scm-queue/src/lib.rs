//! Lease-based job queue over `scm.sync_jobs` (spec §4.F). Grounded on the
//! `FOR UPDATE SKIP LOCKED` claim CTE used by the teacher's job scheduler,
//! generalized to the lease/backoff/allowlist semantics this queue needs.

use chrono::{DateTime, Utc};
use scm_types::job::{Job, JobPayload, JobStatus, JobType, SyncMode};
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {0} is not held by worker {1} in the expected state")]
    LeaseMismatch(Uuid, String),
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    repo_id: i64,
    job_type: String,
    mode: String,
    priority: i32,
    status: String,
    attempts: i32,
    max_attempts: i32,
    payload_json: Value,
    last_error: Option<String>,
    last_run_id: Option<Uuid>,
    lease_seconds: i32,
    created_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            job_id: self.job_id,
            repo_id: self.repo_id,
            job_type: self.job_type.parse().unwrap_or(JobType::Svn),
            mode: self.mode.parse().unwrap_or(SyncMode::Incremental),
            priority: self.priority,
            status: self.status.parse().unwrap_or(JobStatus::Failed),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            payload: serde_json::from_value(self.payload_json).unwrap_or_default(),
            last_error: self.last_error,
            last_run_id: self.last_run_id,
            lease_seconds: self.lease_seconds,
            created_at: self.created_at,
        }
    }
}

const JOB_COLUMNS: &str = "job_id, repo_id, job_type, mode, priority, status, attempts, \
    max_attempts, payload_json, last_error, last_run_id, lease_seconds, created_at";

pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `None` when a pending/running row already exists for `(repo_id,
    /// job_type)` — enforced by the partial unique index, not a
    /// pre-check (spec §4.F).
    pub async fn enqueue(
        &self,
        repo_id: i64,
        job_type: JobType,
        mode: SyncMode,
        priority: i32,
        payload: &JobPayload,
        max_attempts: i32,
        not_before: DateTime<Utc>,
        lease_seconds: i32,
    ) -> Result<Option<Uuid>, QueueError> {
        let payload_json = serde_json::to_value(payload).expect("JobPayload always serializes");

        let job_id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO scm.sync_jobs
                (repo_id, job_type, mode, priority, status, attempts, max_attempts,
                 not_before, lease_seconds, payload_json)
             VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $7, $8)
             ON CONFLICT (repo_id, job_type) WHERE status IN ('pending', 'running') DO NOTHING
             RETURNING job_id",
        )
        .bind(repo_id)
        .bind(job_type.as_str())
        .bind(mode.as_str())
        .bind(priority)
        .bind(max_attempts)
        .bind(not_before)
        .bind(lease_seconds)
        .bind(payload_json)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job_id)
    }

    /// Implements the claim CTE from spec §4.F verbatim, with `job_types`,
    /// `instance_allowlist`, and `tenant_allowlist` as optional filters.
    /// A row whose `payload.gitlab_instance`/`tenant_id` is absent always
    /// passes the allowlist check, so unrelated job types aren't starved.
    pub async fn claim(
        &self,
        worker_id: &str,
        job_types: Option<&[JobType]>,
        lease_seconds: Option<i32>,
        instance_allowlist: Option<&[String]>,
        tenant_allowlist: Option<&[String]>,
    ) -> Result<Option<Job>, QueueError> {
        let job_type_strs: Option<Vec<String>> = job_types
            .map(|types| types.iter().map(|t| t.as_str().to_string()).collect());

        let sql = format!(
            "WITH c AS (
                SELECT job_id FROM scm.sync_jobs
                WHERE (
                    (status = 'pending' AND not_before <= now())
                 OR (status = 'running' AND locked_at + make_interval(secs => lease_seconds) < now())
                 OR (status = 'failed' AND not_before <= now() AND attempts < max_attempts)
                )
                AND ($1::text[] IS NULL OR job_type = ANY($1))
                AND ($2::text[] IS NULL OR payload_json->>'gitlab_instance' IS NULL
                     OR payload_json->>'gitlab_instance' = ANY($2))
                AND ($3::text[] IS NULL OR payload_json->>'tenant_id' IS NULL
                     OR payload_json->>'tenant_id' = ANY($3))
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scm.sync_jobs
            SET status = 'running', locked_by = $4, locked_at = now(),
                attempts = attempts + 1, updated_at = now()
                {lease_clause}
            FROM c WHERE scm.sync_jobs.job_id = c.job_id
            RETURNING {JOB_COLUMNS}",
            lease_clause = if lease_seconds.is_some() {
                ", lease_seconds = $5"
            } else {
                ""
            },
        );

        let mut query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_type_strs)
            .bind(instance_allowlist.map(|v| v.to_vec()))
            .bind(tenant_allowlist.map(|v| v.to_vec()))
            .bind(worker_id);

        if let Some(lease) = lease_seconds {
            query = query.bind(lease);
        }

        let row = query.fetch_optional(&self.pool).await?;
        Ok(row.map(JobRow::into_job))
    }

    /// Conditional on `locked_by = worker_id AND status = 'running'`.
    pub async fn ack(&self, job_id: Uuid, worker_id: &str, run_id: Option<Uuid>) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE scm.sync_jobs
             SET status = 'completed', locked_by = NULL, locked_at = NULL,
                 last_run_id = $3, last_error = NULL, updated_at = now()
             WHERE job_id = $1 AND locked_by = $2 AND status = 'running'",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseMismatch(job_id, worker_id.to_string()));
        }
        Ok(())
    }

    /// Default backoff is exponential `60 * 2^(attempts-1)`; transitions
    /// to `dead` once `attempts >= max_attempts` (spec §4.F). `error` is
    /// redacted before touching the database.
    pub async fn fail_retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        backoff_seconds: Option<i64>,
    ) -> Result<(), QueueError> {
        let redacted = scm_errors::redact(error);

        let row = sqlx::query_as::<_, (i32, i32)>(
            "SELECT attempts, max_attempts FROM scm.sync_jobs
             WHERE job_id = $1 AND locked_by = $2 AND status = 'running'",
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| QueueError::LeaseMismatch(job_id, worker_id.to_string()))?;

        let (attempts, max_attempts) = row;

        if attempts >= max_attempts {
            sqlx::query(
                "UPDATE scm.sync_jobs
                 SET status = 'dead', locked_by = NULL, locked_at = NULL,
                     last_error = $3, updated_at = now()
                 WHERE job_id = $1 AND locked_by = $2 AND status = 'running'",
            )
            .bind(job_id)
            .bind(worker_id)
            .bind(&redacted)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let backoff = backoff_seconds.unwrap_or_else(|| scm_types::job::default_backoff_seconds(attempts));

        sqlx::query(
            "UPDATE scm.sync_jobs
             SET status = 'failed', locked_by = NULL, locked_at = NULL,
                 last_error = $3, not_before = now() + ($4 || ' seconds')::interval,
                 updated_at = now()
             WHERE job_id = $1 AND locked_by = $2 AND status = 'running'",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(&redacted)
        .bind(backoff.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Unconditional transition to `dead` from `running` — used when the
    /// caller already knows retrying cannot help.
    pub async fn mark_dead(&self, job_id: Uuid, worker_id: &str, error: &str) -> Result<(), QueueError> {
        let redacted = scm_errors::redact(error);
        let result = sqlx::query(
            "UPDATE scm.sync_jobs
             SET status = 'dead', locked_by = NULL, locked_at = NULL,
                 last_error = $3, updated_at = now()
             WHERE job_id = $1 AND locked_by = $2 AND status = 'running'",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(redacted)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseMismatch(job_id, worker_id.to_string()));
        }
        Ok(())
    }

    /// Returns the job to `pending` and decrements `attempts` to undo the
    /// claim's increment, with a random `[0, jitter_seconds)` delay —
    /// for "we cleanly yielded" cases, not failures (spec §4.F).
    pub async fn requeue_without_penalty(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason: &str,
        jitter_seconds: f64,
    ) -> Result<(), QueueError> {
        use rand::Rng;
        let jitter = if jitter_seconds > 0.0 {
            rand::thread_rng().gen_range(0.0..jitter_seconds)
        } else {
            0.0
        };
        let redacted = scm_errors::redact(reason);

        let result = sqlx::query(
            "UPDATE scm.sync_jobs
             SET status = 'pending', locked_by = NULL, locked_at = NULL,
                 attempts = GREATEST(0, attempts - 1),
                 not_before = now() + ($4 || ' seconds')::interval,
                 last_error = $3, updated_at = now()
             WHERE job_id = $1 AND locked_by = $2 AND status = 'running'",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(redacted)
        .bind(jitter.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseMismatch(job_id, worker_id.to_string()));
        }
        Ok(())
    }

    /// Bumps `locked_at = now()` and optionally `lease_seconds`,
    /// conditional on `(locked_by, status = 'running')`.
    pub async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_seconds: Option<i32>,
    ) -> Result<(), QueueError> {
        let result = if let Some(lease) = lease_seconds {
            sqlx::query(
                "UPDATE scm.sync_jobs SET locked_at = now(), lease_seconds = $3, updated_at = now()
                 WHERE job_id = $1 AND locked_by = $2 AND status = 'running'",
            )
            .bind(job_id)
            .bind(worker_id)
            .bind(lease)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE scm.sync_jobs SET locked_at = now(), updated_at = now()
                 WHERE job_id = $1 AND locked_by = $2 AND status = 'running'",
            )
            .bind(job_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseMismatch(job_id, worker_id.to_string()));
        }
        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM scm.sync_jobs WHERE job_id = $1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRow::into_job)
            .ok_or(QueueError::NotFound(job_id))
    }

    pub async fn list_jobs_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>, QueueError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scm.sync_jobs WHERE status = $1
             ORDER BY priority ASC, created_at ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    pub async fn list_jobs_by_worker(&self, worker_id: &str) -> Result<Vec<Job>, QueueError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scm.sync_jobs WHERE locked_by = $1 ORDER BY locked_at ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    pub async fn count_jobs_by_status(&self, status: JobStatus) -> Result<i64, QueueError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM scm.sync_jobs WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Deletes `completed` jobs older than `older_than`. Admin/maintenance
    /// helper, not part of the worker hot path.
    pub async fn cleanup_completed_jobs(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM scm.sync_jobs WHERE status = 'completed' AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Resets `dead` jobs back to `pending` with `attempts = 0` — an
    /// explicit operator action, never automatic.
    pub async fn reset_dead_jobs(&self, job_ids: &[Uuid]) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE scm.sync_jobs
             SET status = 'pending', attempts = 0, last_error = NULL, not_before = now(), updated_at = now()
             WHERE job_id = ANY($1) AND status = 'dead'",
        )
        .bind(job_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_columns_cover_job_struct_fields() {
        assert!(JOB_COLUMNS.contains("job_id"));
        assert!(JOB_COLUMNS.contains("payload_json"));
        assert!(JOB_COLUMNS.contains("lease_seconds"));
    }
}
