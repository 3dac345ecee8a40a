//! Cooperative lease-renewal task. Translates the thread-based
//! `HeartbeatManager` from `scm_sync_worker.py` into a `tokio::spawn` task
//! signaled over a `watch` channel rather than an OS thread/event pair —
//! the rest of this crate is async, so a dedicated thread would just need
//! its own runtime handle to talk back to the pool.

use std::sync::Arc;
use std::time::Duration;

use scm_errors::{ErrorCategory, SyncError};
use scm_queue::JobQueue;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub renew_interval_seconds: u64,
    pub lease_seconds: i32,
    pub max_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            renew_interval_seconds: 30,
            lease_seconds: 300,
            max_failures: 3,
        }
    }
}

/// What the renewal loop decided by the time it stopped.
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub should_abort: bool,
    pub failure_count: u32,
    pub max_failures: u32,
}

impl HeartbeatOutcome {
    pub fn abort_error(&self, job_id: Uuid, worker_id: &str) -> SyncError {
        SyncError::new(
            ErrorCategory::LeaseLost,
            format!("worker {worker_id} lost its lease on job {job_id} after {} renewal failures", self.failure_count),
        )
        .with_retry_after(0)
    }
}

/// A running renewal loop for one claimed job. Created by [`HeartbeatManager::start`],
/// consumed by [`HeartbeatManager::stop`].
pub struct HeartbeatHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    abort_rx: watch::Receiver<bool>,
    task: JoinHandle<HeartbeatOutcome>,
}

impl HeartbeatHandle {
    /// True once the renewal loop has given up — checked by the caller
    /// after the executor returns, before deciding how to close the job.
    pub fn should_abort(&self) -> bool {
        *self.abort_rx.borrow()
    }

    /// Signals the loop to stop, does one last renewal attempt, and
    /// returns the final failure tally.
    pub async fn stop(mut self) -> HeartbeatOutcome {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap_or(HeartbeatOutcome {
            should_abort: true,
            failure_count: 0,
            max_failures: 0,
        })
    }
}

pub struct HeartbeatManager;

impl HeartbeatManager {
    pub fn start(
        queue: Arc<JobQueue>,
        job_id: Uuid,
        worker_id: String,
        config: HeartbeatConfig,
    ) -> HeartbeatHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut failure_count = 0u32;
            let mut interval = tokio::time::interval(Duration::from_secs(config.renew_interval_seconds));
            interval.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        let _ = queue.renew_lease(job_id, &worker_id, Some(config.lease_seconds)).await;
                        break;
                    }
                    _ = interval.tick() => {
                        match queue.renew_lease(job_id, &worker_id, Some(config.lease_seconds)).await {
                            Ok(()) => failure_count = 0,
                            Err(err) => {
                                failure_count += 1;
                                tracing::warn!(%job_id, %worker_id, failure_count, %err, "lease renewal failed");
                                if failure_count >= config.max_failures {
                                    let _ = abort_tx.send(true);
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            HeartbeatOutcome {
                should_abort: failure_count >= config.max_failures,
                failure_count,
                max_failures: config.max_failures,
            }
        });

        HeartbeatHandle {
            stop_tx: Some(stop_tx),
            abort_rx,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = HeartbeatConfig::default();
        assert_eq!(cfg.renew_interval_seconds, 30);
        assert_eq!(cfg.lease_seconds, 300);
        assert_eq!(cfg.max_failures, 3);
    }

    #[test]
    fn abort_error_is_lease_lost_with_zero_retry() {
        let outcome = HeartbeatOutcome {
            should_abort: true,
            failure_count: 3,
            max_failures: 3,
        };
        let err = outcome.abort_error(Uuid::nil(), "worker-1");
        assert_eq!(err.category, ErrorCategory::LeaseLost);
        assert_eq!(err.retry_after, Some(0));
    }
}
