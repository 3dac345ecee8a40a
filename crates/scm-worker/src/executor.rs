//! Maps a job's `job_type` to a registered handler (spec §4.I). A known
//! type with no handler registered is a `contract_error`, not a panic —
//! workers ship independently of which handlers are wired into a given
//! deployment.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use scm_errors::{ErrorCategory, SyncError};
use scm_types::job::{JobPayload, JobType, SyncMode};
use scm_types::run::{Degradation, RunCounts};

/// What a handler hands back — the Rust analogue of the Python executor's
/// result dict (`success`/`error`/`counts`/...), just with real types.
#[derive(Debug, Clone)]
pub struct ExecutorOutcome {
    pub success: bool,
    pub error: Option<SyncError>,
    pub counts: Option<RunCounts>,
    pub cursor_after: Option<serde_json::Value>,
    pub degradation: Option<Degradation>,
}

impl ExecutorOutcome {
    pub fn success(counts: RunCounts, cursor_after: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            error: None,
            counts: Some(counts),
            cursor_after,
            degradation: None,
        }
    }

    pub fn with_degradation(mut self, degradation: Degradation) -> Self {
        self.degradation = Some(degradation);
        self
    }

    pub fn failure(error: SyncError) -> Self {
        Self {
            success: false,
            error: Some(error),
            counts: None,
            cursor_after: None,
            degradation: None,
        }
    }
}

#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn handle(&self, repo_id: i64, mode: SyncMode, payload: &JobPayload) -> ExecutorOutcome;
}

#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    handlers: HashMap<JobType, Arc<dyn SyncHandler>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn SyncHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub async fn dispatch(
        &self,
        job_type: JobType,
        repo_id: i64,
        mode: SyncMode,
        payload: &JobPayload,
    ) -> ExecutorOutcome {
        match self.handlers.get(&job_type) {
            Some(handler) => handler.handle(repo_id, mode, payload).await,
            None => ExecutorOutcome::failure(SyncError::new(
                ErrorCategory::ContractError,
                format!("no handler registered for job_type {}", job_type.as_str()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl SyncHandler for EchoHandler {
        async fn handle(&self, _repo_id: i64, _mode: SyncMode, _payload: &JobPayload) -> ExecutorOutcome {
            ExecutorOutcome::success(RunCounts::default(), None)
        }
    }

    #[tokio::test]
    async fn unregistered_known_job_type_is_contract_error() {
        let registry = ExecutorRegistry::new();
        let outcome = registry
            .dispatch(JobType::Svn, 1, SyncMode::Incremental, &JobPayload::default())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().category, ErrorCategory::ContractError);
    }

    #[tokio::test]
    async fn registered_handler_runs() {
        let mut registry = ExecutorRegistry::new();
        registry.register(JobType::Svn, Arc::new(EchoHandler));
        let outcome = registry
            .dispatch(JobType::Svn, 1, SyncMode::Incremental, &JobPayload::default())
            .await;
        assert!(outcome.success);
    }
}
