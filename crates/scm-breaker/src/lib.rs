//! Circuit breaker and pause registry, both persisted in `scm.kv`
//! (spec §4.E).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

const BREAKER_NAMESPACE: &str = "breaker";
const PAUSE_NAMESPACE: &str = "sync_pause";

/// `<project_key>:<scope>`; `scope` distinguishes the four granularities
/// a scheduler can reason about (spec §4.E "Breaker scope key").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerScope {
    Global,
    Pool(String),
    Instance(String),
    Tenant(String),
}

impl BreakerScope {
    fn suffix(&self) -> String {
        match self {
            BreakerScope::Global => "global".to_string(),
            BreakerScope::Pool(name) => format!("pool:{name}"),
            BreakerScope::Instance(host) => format!("instance:{host}"),
            BreakerScope::Tenant(id) => format!("tenant:{id}"),
        }
    }

    /// Legacy encodings the same scope was persisted under by older
    /// versions, probed in order on read (spec §4.E "Legacy-key fallback").
    fn legacy_suffixes(&self) -> Vec<String> {
        match self {
            BreakerScope::Global => vec!["global".to_string()],
            BreakerScope::Pool(name) => vec![name.clone(), format!("pool:{name}")],
            BreakerScope::Instance(host) => vec![host.clone()],
            BreakerScope::Tenant(id) => vec![id.clone()],
        }
    }
}

/// Derives the scope the scheduler should use for a job's `(repo,
/// payload)` — `instance:` when known, `tenant:` when `project_key` has a
/// `tenant/...` prefix, `global` as the fallback (spec §4.E).
pub fn derive_scope(
    project_key: &str,
    gitlab_instance: Option<&str>,
    worker_pool: Option<&str>,
) -> BreakerScope {
    if let Some(pool) = worker_pool {
        return BreakerScope::Pool(pool.to_string());
    }
    if let Some(instance) = gitlab_instance {
        return BreakerScope::Instance(instance.to_string());
    }
    if let Some((tenant, _)) = project_key.split_once('/') {
        return BreakerScope::Tenant(tenant.to_string());
    }
    BreakerScope::Global
}

fn breaker_key(project_key: &str, scope: &BreakerScope) -> String {
    format!("{project_key}:{}", scope.suffix())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    pub state: BreakerStateKind,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub failure_rate: f64,
    pub rate_limit_rate: f64,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: BreakerStateKind::Closed,
            opened_at: None,
            last_probe_at: None,
            failure_rate: 0.0,
            rate_limit_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerThresholds {
    pub failed_rate_threshold: f64,
    pub rate_limit_rate_threshold: f64,
    pub cool_down_seconds: i64,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            failed_rate_threshold: 0.5,
            rate_limit_rate_threshold: 0.3,
            cool_down_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HealthStats {
    pub total_runs: i64,
    pub completed_runs: i64,
    pub failed_runs: i64,
    pub no_data_runs: i64,
    pub running_runs: i64,
    pub failed_rate: f64,
    pub rate_limit_rate: f64,
    pub total_429_hits: i64,
    pub avg_duration_seconds: f64,
}

/// Reads `scm.kv` under `namespace`, trying `key` then each legacy
/// encoding in order, returning the first hit's raw JSON.
async fn read_kv_with_fallback(
    pool: &PgPool,
    namespace: &str,
    keys: &[String],
) -> Result<Option<serde_json::Value>, BreakerError> {
    for key in keys {
        let value = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT value_json FROM scm.kv WHERE namespace = $1 AND key = $2",
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(pool)
        .await?;
        if value.is_some() {
            return Ok(value);
        }
    }
    Ok(None)
}

async fn write_kv(pool: &PgPool, namespace: &str, key: &str, value: &serde_json::Value) -> Result<(), BreakerError> {
    sqlx::query(
        "INSERT INTO scm.kv (namespace, key, value_json, updated_at) VALUES ($1, $2, $3, now())
         ON CONFLICT (namespace, key) DO UPDATE SET value_json = $3, updated_at = now()",
    )
    .bind(namespace)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

pub struct Breaker {
    pool: PgPool,
    thresholds: BreakerThresholds,
}

impl Breaker {
    pub fn new(pool: PgPool, thresholds: BreakerThresholds) -> Self {
        Self { pool, thresholds }
    }

    /// Loads state for `project_key`/`scope`, consulting legacy encodings
    /// on miss, defaulting to `closed` if nothing is found at all.
    pub async fn load(
        &self,
        project_key: &str,
        scope: &BreakerScope,
    ) -> Result<BreakerState, BreakerError> {
        let primary = breaker_key(project_key, scope);
        let mut keys = vec![primary];
        keys.extend(scope.legacy_suffixes());

        match read_kv_with_fallback(&self.pool, BREAKER_NAMESPACE, &keys).await? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or_default()),
            None => Ok(BreakerState::default()),
        }
    }

    async fn save(
        &self,
        project_key: &str,
        scope: &BreakerScope,
        state: &BreakerState,
    ) -> Result<(), BreakerError> {
        let key = breaker_key(project_key, scope);
        let value = serde_json::to_value(state).expect("BreakerState always serializes");
        write_kv(&self.pool, BREAKER_NAMESPACE, &key, &value).await
    }

    /// Computes health statistics from `sync_runs` over the last `limit`
    /// runs for the repos matching `scope` (spec §4.E).
    pub async fn health_stats(&self, repo_id: i64, job_type: &str, limit: i64) -> Result<HealthStats, BreakerError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            status: String,
            error_summary_json: Option<serde_json::Value>,
            started_at: DateTime<Utc>,
            finished_at: Option<DateTime<Utc>>,
        }

        let rows = sqlx::query_as::<_, Row>(
            "SELECT status, error_summary_json, started_at, finished_at
             FROM scm.sync_runs
             WHERE repo_id = $1 AND job_type = $2
             ORDER BY started_at DESC
             LIMIT $3",
        )
        .bind(repo_id)
        .bind(job_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let total_runs = rows.len() as i64;
        let mut completed_runs = 0i64;
        let mut failed_runs = 0i64;
        let mut no_data_runs = 0i64;
        let mut running_runs = 0i64;
        let mut rate_limit_hits = 0i64;
        let mut total_duration = 0.0f64;
        let mut duration_samples = 0i64;

        for row in &rows {
            match row.status.as_str() {
                "completed" => completed_runs += 1,
                "failed" => failed_runs += 1,
                "no_data" => no_data_runs += 1,
                "running" => running_runs += 1,
                _ => {}
            }
            if let Some(summary) = &row.error_summary_json {
                if summary.get("error_category").and_then(|v| v.as_str()) == Some("rate_limit") {
                    rate_limit_hits += 1;
                }
            }
            if let Some(finished_at) = row.finished_at {
                total_duration += (finished_at - row.started_at).num_milliseconds().max(0) as f64 / 1000.0;
                duration_samples += 1;
            }
        }

        Ok(HealthStats {
            total_runs,
            completed_runs,
            failed_runs,
            no_data_runs,
            running_runs,
            failed_rate: if total_runs > 0 {
                failed_runs as f64 / total_runs as f64
            } else {
                0.0
            },
            rate_limit_rate: if total_runs > 0 {
                rate_limit_hits as f64 / total_runs as f64
            } else {
                0.0
            },
            total_429_hits: rate_limit_hits,
            avg_duration_seconds: if duration_samples > 0 {
                total_duration / duration_samples as f64
            } else {
                0.0
            },
        })
    }

    /// Applies the `closed -> open -> half_open -> closed` transitions
    /// from spec §4.E given freshly computed health stats.
    pub async fn evaluate(
        &self,
        project_key: &str,
        scope: &BreakerScope,
        stats: &HealthStats,
    ) -> Result<BreakerState, BreakerError> {
        let mut state = self.load(project_key, scope).await?;
        let now = Utc::now();

        state.failure_rate = stats.failed_rate;
        state.rate_limit_rate = stats.rate_limit_rate;

        match state.state {
            BreakerStateKind::Closed => {
                if stats.failed_rate > self.thresholds.failed_rate_threshold
                    || stats.rate_limit_rate > self.thresholds.rate_limit_rate_threshold
                {
                    state.state = BreakerStateKind::Open;
                    state.opened_at = Some(now);
                }
            }
            BreakerStateKind::Open => {
                if let Some(opened_at) = state.opened_at {
                    let elapsed = (now - opened_at).num_seconds();
                    if elapsed >= self.thresholds.cool_down_seconds {
                        state.state = BreakerStateKind::HalfOpen;
                        state.last_probe_at = Some(now);
                    }
                }
            }
            BreakerStateKind::HalfOpen => {
                state.last_probe_at = Some(now);
                if stats.failed_rate > self.thresholds.failed_rate_threshold
                    || stats.rate_limit_rate > self.thresholds.rate_limit_rate_threshold
                {
                    state.state = BreakerStateKind::Open;
                    state.opened_at = Some(now);
                } else {
                    state.state = BreakerStateKind::Closed;
                    state.opened_at = None;
                }
            }
        }

        self.save(project_key, scope, &state).await?;
        Ok(state)
    }

    /// Records a probe's outcome while in `half_open`: success closes the
    /// breaker, any failure reopens it.
    pub async fn record_probe(
        &self,
        project_key: &str,
        scope: &BreakerScope,
        succeeded: bool,
    ) -> Result<BreakerState, BreakerError> {
        let mut state = self.load(project_key, scope).await?;
        if state.state == BreakerStateKind::HalfOpen {
            if succeeded {
                state.state = BreakerStateKind::Closed;
                state.opened_at = None;
            } else {
                state.state = BreakerStateKind::Open;
                state.opened_at = Some(Utc::now());
            }
            self.save(project_key, scope, &state).await?;
        }
        Ok(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReasonCode {
    ErrorBudget,
    RateLimitBucket,
    CircuitOpen,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseRecord {
    pub paused_until: DateTime<Utc>,
    pub reason: String,
    pub reason_code: PauseReasonCode,
    pub paused_at: DateTime<Utc>,
    pub failure_rate: f64,
}

pub struct PauseRegistry {
    pool: PgPool,
}

impl PauseRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn key(repo_id: i64, job_type: &str) -> String {
        format!("repo:{repo_id}:{job_type}")
    }

    pub async fn set(
        &self,
        repo_id: i64,
        job_type: &str,
        paused_until: DateTime<Utc>,
        reason: &str,
        reason_code: PauseReasonCode,
        failure_rate: f64,
    ) -> Result<(), BreakerError> {
        let record = PauseRecord {
            paused_until,
            reason: reason.to_string(),
            reason_code,
            paused_at: Utc::now(),
            failure_rate,
        };
        let value = serde_json::to_value(&record).expect("PauseRecord always serializes");
        write_kv(&self.pool, PAUSE_NAMESPACE, &Self::key(repo_id, job_type), &value).await
    }

    /// An expired record is treated as absent without being deleted
    /// (spec §4.E).
    pub async fn get(&self, repo_id: i64, job_type: &str) -> Result<Option<PauseRecord>, BreakerError> {
        let key = Self::key(repo_id, job_type);
        let value = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT value_json FROM scm.kv WHERE namespace = $1 AND key = $2",
        )
        .bind(PAUSE_NAMESPACE)
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(value) = value else { return Ok(None) };
        let record: PauseRecord = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(_) => return Ok(None),
        };
        if record.paused_until <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub async fn clear(&self, repo_id: i64, job_type: &str) -> Result<(), BreakerError> {
        sqlx::query("DELETE FROM scm.kv WHERE namespace = $1 AND key = $2")
            .bind(PAUSE_NAMESPACE)
            .bind(Self::key(repo_id, job_type))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Before scheduling: drop expired pauses; for the rest, re-read
    /// health and clear when `failed_rate` has recovered below
    /// `unpause_threshold` (spec §4.E "Auto-unpause").
    pub async fn auto_unpause(
        &self,
        repo_id: i64,
        job_type: &str,
        current_failed_rate: f64,
        unpause_threshold: f64,
    ) -> Result<bool, BreakerError> {
        let Some(record) = self.get(repo_id, job_type).await? else {
            return Ok(true);
        };
        if current_failed_rate < unpause_threshold {
            self.clear(repo_id, job_type).await?;
            let _ = record;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_keys_match_spec_shapes() {
        assert_eq!(breaker_key("acme/svc", &BreakerScope::Global), "acme/svc:global");
        assert_eq!(
            breaker_key("acme/svc", &BreakerScope::Instance("gitlab.example.com".into())),
            "acme/svc:instance:gitlab.example.com"
        );
        assert_eq!(
            breaker_key("acme/svc", &BreakerScope::Tenant("acme".into())),
            "acme/svc:tenant:acme"
        );
    }

    #[test]
    fn derive_scope_prefers_pool_then_instance_then_tenant_then_global() {
        assert_eq!(
            derive_scope("acme/svc", Some("gitlab.example.com"), Some("crawlers")),
            BreakerScope::Pool("crawlers".into())
        );
        assert_eq!(
            derive_scope("acme/svc", Some("gitlab.example.com"), None),
            BreakerScope::Instance("gitlab.example.com".into())
        );
        assert_eq!(derive_scope("acme/svc", None, None), BreakerScope::Tenant("acme".into()));
        assert_eq!(derive_scope("svc", None, None), BreakerScope::Global);
    }

    #[test]
    fn legacy_suffixes_cover_bare_and_prefixed_pool_forms() {
        let scope = BreakerScope::Pool("crawlers".into());
        let legacy = scope.legacy_suffixes();
        assert!(legacy.contains(&"crawlers".to_string()));
        assert!(legacy.contains(&"pool:crawlers".to_string()));
    }
}
