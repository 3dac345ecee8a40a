//! Per-upstream-instance token bucket backed by `scm.sync_rate_limits`
//! (spec §4.D). Grounded on the `FOR UPDATE`/CTE transaction style used by
//! the job queue's claim path.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub tokens_remaining: f64,
    pub wait_seconds: f64,
    pub paused_until: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct BucketRow {
    tokens: f64,
    rate: f64,
    burst: i32,
    paused_until: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    meta_json: serde_json::Value,
}

/// Distributed (cross-process) half of the bucket; the single source of
/// truth. Callers typically wrap this in [`ComposedLimiter`] alongside a
/// local fast-path bucket.
pub struct DistributedLimiter {
    pool: PgPool,
}

impl DistributedLimiter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Implements the six-step algorithm from spec §4.D verbatim.
    pub async fn consume(
        &self,
        instance_key: &str,
        tokens_needed: f64,
        default_rate: f64,
        default_burst: i32,
    ) -> Result<ConsumeOutcome, RateLimitError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, BucketRow>(
            "SELECT tokens, rate, burst, paused_until, updated_at, meta_json
             FROM scm.sync_rate_limits WHERE instance_key = $1 FOR UPDATE",
        )
        .bind(instance_key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = existing else {
            let initial_tokens = (default_burst as f64) - tokens_needed;
            sqlx::query(
                "INSERT INTO scm.sync_rate_limits (instance_key, tokens, rate, burst, updated_at)
                 VALUES ($1, $2, $3, $4, now())",
            )
            .bind(instance_key)
            .bind(initial_tokens)
            .bind(default_rate)
            .bind(default_burst)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(ConsumeOutcome {
                allowed: true,
                tokens_remaining: initial_tokens,
                wait_seconds: 0.0,
                paused_until: None,
            });
        };

        let now = Utc::now();

        if let Some(paused_until) = row.paused_until {
            if paused_until > now {
                tx.commit().await?;
                let wait_seconds = (paused_until - now).num_milliseconds().max(0) as f64 / 1000.0;
                return Ok(ConsumeOutcome {
                    allowed: false,
                    tokens_remaining: row.tokens,
                    wait_seconds,
                    paused_until: Some(paused_until),
                });
            }
        }

        let elapsed_seconds = (now - row.updated_at).num_milliseconds().max(0) as f64 / 1000.0;
        let refilled = (row.burst as f64).min(row.tokens + elapsed_seconds * row.rate);

        if refilled >= tokens_needed {
            let remaining = refilled - tokens_needed;
            sqlx::query(
                "UPDATE scm.sync_rate_limits
                 SET tokens = $2, paused_until = NULL, updated_at = now()
                 WHERE instance_key = $1",
            )
            .bind(instance_key)
            .bind(remaining)
            .execute(&mut *tx)
            .await?;
            self.commit(tx).await?;
            Ok(ConsumeOutcome {
                allowed: true,
                tokens_remaining: remaining,
                wait_seconds: 0.0,
                paused_until: None,
            })
        } else {
            sqlx::query(
                "UPDATE scm.sync_rate_limits SET tokens = $2, updated_at = now() WHERE instance_key = $1",
            )
            .bind(instance_key)
            .bind(refilled)
            .execute(&mut *tx)
            .await?;
            self.commit(tx).await?;
            let wait_seconds = if row.rate > 0.0 {
                (tokens_needed - refilled) / row.rate
            } else {
                f64::INFINITY
            };
            Ok(ConsumeOutcome {
                allowed: false,
                tokens_remaining: refilled,
                wait_seconds,
                paused_until: None,
            })
        }
    }

    async fn commit(&self, tx: Transaction<'_, Postgres>) -> Result<(), RateLimitError> {
        tx.commit().await?;
        Ok(())
    }

    /// Sets `paused_until`, zeroes `tokens`, and bumps the 429 counters in
    /// `meta_json` (spec §4.D "Pause on 429").
    pub async fn pause(
        &self,
        instance_key: &str,
        retry_after_seconds: f64,
    ) -> Result<(), RateLimitError> {
        let meta = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT meta_json FROM scm.sync_rate_limits WHERE instance_key = $1",
        )
        .bind(instance_key)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or_else(|| serde_json::json!({}));

        let consecutive = meta
            .get("consecutive_429_count")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            + 1;

        let updated_meta = serde_json::json!({
            "consecutive_429_count": consecutive,
            "last_429_at": Utc::now().to_rfc3339(),
            "last_retry_after": retry_after_seconds,
        });

        sqlx::query(
            "INSERT INTO scm.sync_rate_limits (instance_key, tokens, rate, burst, paused_until, meta_json, updated_at)
             VALUES ($1, 0, 1, 1, now() + ($2 || ' seconds')::interval, $3, now())
             ON CONFLICT (instance_key) DO UPDATE SET
                tokens = 0,
                paused_until = now() + ($2 || ' seconds')::interval,
                meta_json = $3,
                updated_at = now()",
        )
        .bind(instance_key)
        .bind(retry_after_seconds.to_string())
        .bind(updated_meta)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Resets `consecutive_429_count` to zero; called after a successful
    /// consume per spec §4.D.
    pub async fn clear_pause(&self, instance_key: &str) -> Result<(), RateLimitError> {
        sqlx::query(
            "UPDATE scm.sync_rate_limits
             SET meta_json = jsonb_set(meta_json, '{consecutive_429_count}', '0')
             WHERE instance_key = $1",
        )
        .bind(instance_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-process bucket consulted before the distributed limiter, so a hot
/// worker doesn't round-trip to Postgres on every call (spec §4.D
/// "Composed limiters").
pub struct LocalBucket {
    state: tokio::sync::Mutex<LocalState>,
}

struct LocalState {
    tokens: f64,
    rate: f64,
    burst: f64,
    last_refill: DateTime<Utc>,
}

impl LocalBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            state: tokio::sync::Mutex::new(LocalState {
                tokens: burst,
                rate,
                burst,
                last_refill: Utc::now(),
            }),
        }
    }

    pub async fn try_acquire(&self, tokens_needed: f64) -> bool {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let elapsed = (now - state.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        state.tokens = (state.tokens + elapsed * state.rate).min(state.burst);
        state.last_refill = now;

        if state.tokens >= tokens_needed {
            state.tokens -= tokens_needed;
            true
        } else {
            false
        }
    }

    pub async fn notify_paused(&self) {
        let mut state = self.state.lock().await;
        state.tokens = 0.0;
    }
}

/// Combines a [`LocalBucket`] fast path with a [`DistributedLimiter`]
/// authority, local-then-distributed per spec §4.D acquire order.
pub struct ComposedLimiter {
    local: LocalBucket,
    distributed: DistributedLimiter,
}

impl ComposedLimiter {
    pub fn new(local: LocalBucket, distributed: DistributedLimiter) -> Self {
        Self { local, distributed }
    }

    pub async fn acquire(
        &self,
        instance_key: &str,
        tokens_needed: f64,
        default_rate: f64,
        default_burst: i32,
    ) -> Result<ConsumeOutcome, RateLimitError> {
        if !self.local.try_acquire(tokens_needed).await {
            return Ok(ConsumeOutcome {
                allowed: false,
                tokens_remaining: 0.0,
                wait_seconds: 1.0 / default_rate.max(0.001),
                paused_until: None,
            });
        }

        let outcome = self
            .distributed
            .consume(instance_key, tokens_needed, default_rate, default_burst)
            .await?;

        if !outcome.allowed {
            self.local.notify_paused().await;
        }

        Ok(outcome)
    }

    pub async fn pause(&self, instance_key: &str, retry_after_seconds: f64) -> Result<(), RateLimitError> {
        self.local.notify_paused().await;
        self.distributed.pause(instance_key, retry_after_seconds).await
    }

    pub async fn clear_pause(&self, instance_key: &str) -> Result<(), RateLimitError> {
        self.distributed.clear_pause(instance_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bucket_refills_over_time() {
        let bucket = LocalBucket::new(1000.0, 5.0);
        for _ in 0..5 {
            assert!(bucket.try_acquire(1.0).await);
        }
        assert!(!LocalBucket::new(0.0, 0.0).try_acquire(1.0).await);
    }

    #[tokio::test]
    async fn notify_paused_drains_local_tokens() {
        let bucket = LocalBucket::new(1.0, 5.0);
        bucket.notify_paused().await;
        assert!(!bucket.try_acquire(1.0).await);
    }
}
