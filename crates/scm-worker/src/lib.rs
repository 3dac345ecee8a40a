//! Claim/dispatch/close-out loop for one worker process (spec §4.I).
//! Grounded on `original_source/scm_sync_worker.py`'s `process_one_job`:
//! claim a job, wrap the handler call in a heartbeat, and route the result
//! to `ack`/`fail_retry`/`mark_dead`/`requeue_without_penalty` depending on
//! the error category the handler reported.

pub mod executor;
pub mod heartbeat;

use std::sync::Arc;

use executor::{ExecutorOutcome, ExecutorRegistry};
use heartbeat::{HeartbeatConfig, HeartbeatManager};
use scm_errors::ErrorCategory;
use scm_queue::JobQueue;
use scm_run_recorder::{FinishPayload, RunRecorder};
use scm_types::job::Job;
use scm_types::run::{Degradation, ErrorSummary, RunStatus};
use uuid::Uuid;

/// Substrings the Python original treats as evidence that an `auth_error`
/// was actually a mid-flight token rotation rather than a genuinely
/// invalid credential — worth one retry instead of killing the job outright.
/// Not stated in the distilled contract; carried over from
/// `scm_sync_worker.py::process_one_job` because it only narrows when a job
/// dies, never widens it (see DESIGN.md).
const AUTH_ERROR_RETRY_MARKERS: [&str; 3] = ["glpat-", "Bearer ", "Authorization:"];

fn demote_auth_error(category: ErrorCategory, message: &str) -> bool {
    category == ErrorCategory::AuthError
        && AUTH_ERROR_RETRY_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Whether a job that failed with `category` should die outright
/// (`mark_dead`) rather than retry, folding in the auth-error demotion.
fn is_permanent_failure(category: ErrorCategory, message: &str) -> bool {
    category.is_permanent() && !demote_auth_error(category, message)
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub job_types: Option<Vec<scm_types::job::JobType>>,
    pub instance_allowlist: Option<Vec<String>>,
    pub tenant_allowlist: Option<Vec<String>>,
    pub heartbeat: HeartbeatConfig,
}

pub struct WorkerLoop {
    queue: Arc<JobQueue>,
    run_recorder: RunRecorder,
    registry: ExecutorRegistry,
    config: WorkerConfig,
}

/// What happened to a single claimed job, for callers that want to log or
/// count outcomes across a run (the CLI's `worker --once` path, tests, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Acked,
    Retried,
    Dead,
    Requeued,
    LeaseLost,
}

impl WorkerLoop {
    pub fn new(queue: Arc<JobQueue>, run_recorder: RunRecorder, registry: ExecutorRegistry, config: WorkerConfig) -> Self {
        Self { queue, run_recorder, registry, config }
    }

    /// Claims and processes at most one job. `Ok(None)` means the queue had
    /// nothing claimable right now.
    pub async fn process_one(&self) -> Result<Option<JobOutcome>, scm_queue::QueueError> {
        let job = self
            .queue
            .claim(
                &self.config.worker_id,
                self.config.job_types.as_deref(),
                None,
                self.config.instance_allowlist.as_deref(),
                self.config.tenant_allowlist.as_deref(),
            )
            .await?;

        let Some(job) = job else {
            return Ok(None);
        };

        Ok(Some(self.run_claimed_job(job).await))
    }

    async fn run_claimed_job(&self, job: Job) -> JobOutcome {
        let run_id = Uuid::new_v4();
        let cursor_before = serde_json::to_value(&job.payload).unwrap_or(serde_json::Value::Null);

        if let Err(err) = self
            .run_recorder
            .start(run_id, job.repo_id, job.job_type, job.mode, cursor_before)
            .await
        {
            tracing::error!(job_id = %job.job_id, %err, "failed to open sync_runs row, proceeding without a run record");
        }

        let heartbeat = HeartbeatManager::start(
            self.queue.clone(),
            job.job_id,
            self.config.worker_id.clone(),
            self.config.heartbeat,
        );

        let outcome = self
            .registry
            .dispatch(job.job_type, job.repo_id, job.mode, &job.payload)
            .await;

        let heartbeat_outcome = heartbeat.stop().await;

        if heartbeat_outcome.should_abort {
            let abort_error = heartbeat_outcome.abort_error(job.job_id, &self.config.worker_id);
            self.finish_run(run_id, RunStatus::Failed, error_summary(&abort_error), None, None)
                .await;
            if let Err(err) = self
                .queue
                .fail_retry(job.job_id, &self.config.worker_id, &abort_error.message, Some(0))
                .await
            {
                tracing::error!(job_id = %job.job_id, %err, "fail_retry after lease loss failed");
            }
            return JobOutcome::LeaseLost;
        }

        self.close_out(job, run_id, outcome).await
    }

    async fn close_out(&self, job: Job, run_id: Uuid, outcome: ExecutorOutcome) -> JobOutcome {
        if outcome.success {
            self.finish_run(
                run_id,
                RunStatus::Completed,
                None,
                outcome.counts,
                outcome.cursor_after,
            )
            .await;
            if let Err(err) = self.queue.ack(job.job_id, &self.config.worker_id, Some(run_id)).await {
                tracing::error!(job_id = %job.job_id, %err, "ack failed after a successful run");
            }
            return JobOutcome::Acked;
        }

        let error = outcome
            .error
            .unwrap_or_else(|| scm_errors::SyncError::new(ErrorCategory::Unknown, "handler reported failure with no error detail"));

        if error.category.is_lock_held() {
            self.finish_run(run_id, RunStatus::NoData, error_summary(&error), None, None).await;
            if let Err(err) = self
                .queue
                .requeue_without_penalty(job.job_id, &self.config.worker_id, &error.message, 5.0)
                .await
            {
                tracing::error!(job_id = %job.job_id, %err, "requeue_without_penalty failed");
            }
            return JobOutcome::Requeued;
        }

        self.finish_run(run_id, RunStatus::Failed, error_summary(&error), None, None).await;

        if is_permanent_failure(error.category, &error.message) {
            if let Err(err) = self.queue.mark_dead(job.job_id, &self.config.worker_id, &error.message).await {
                tracing::error!(job_id = %job.job_id, %err, "mark_dead failed");
            }
            return JobOutcome::Dead;
        }

        let backoff = error.retry_after;
        if let Err(err) = self
            .queue
            .fail_retry(job.job_id, &self.config.worker_id, &error.message, backoff)
            .await
        {
            tracing::error!(job_id = %job.job_id, %err, "fail_retry failed");
        }
        JobOutcome::Retried
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_summary: Option<ErrorSummary>,
        counts: Option<scm_types::run::RunCounts>,
        cursor_after: Option<serde_json::Value>,
    ) {
        let degradation: Option<Degradation> = None;
        let payload = FinishPayload { status, cursor_after, counts, error_summary, degradation };
        if let Err(err) = self.run_recorder.finish(run_id, payload).await {
            tracing::error!(%run_id, %err, "failed to write run-finish record");
        }
    }
}

fn error_summary(error: &scm_errors::SyncError) -> Option<ErrorSummary> {
    Some(ErrorSummary {
        error_category: error.category.as_str().to_string(),
        message: Some(error.message.clone()),
        endpoint: error.endpoint.clone(),
        status_code: error.status_code,
        context: error.context.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_with_token_marker_is_demoted() {
        assert!(demote_auth_error(ErrorCategory::AuthError, "refused glpat-abc123"));
        assert!(demote_auth_error(ErrorCategory::AuthError, "Authorization: Bearer xyz rejected"));
        assert!(!demote_auth_error(ErrorCategory::AuthError, "invalid credentials"));
    }

    #[test]
    fn demotion_only_applies_to_auth_error() {
        assert!(!demote_auth_error(ErrorCategory::RepoNotFound, "glpat-abc123"));
    }

    #[test]
    fn permanent_failure_folds_in_demotion() {
        assert!(!is_permanent_failure(ErrorCategory::AuthError, "Bearer token expired"));
        assert!(is_permanent_failure(ErrorCategory::AuthError, "invalid credentials"));
        assert!(is_permanent_failure(ErrorCategory::RepoNotFound, "no such repo"));
        assert!(!is_permanent_failure(ErrorCategory::Timeout, "timed out"));
    }
}
