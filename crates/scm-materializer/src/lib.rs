//! Transitions `patch_blobs` rows from `pending`/`failed` to `done`
//! (spec §4.H).

pub mod path;

use chrono::Utc;
use scm_artifact_store::{OverwritePolicy, Store};
use scm_errors::ErrorCategory;
use scm_types::patch_blob::{MaterializeStatus, PatchBlobMeta, PatchFormat, SourceType};
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaterializerError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] scm_artifact_store::StoreError),
}

/// What happens when `expected_sha256` is known and doesn't match the
/// transformed bytes' hash (spec §4.H "SHA-mismatch policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaMismatchPolicy {
    Strict,
    Mirror,
}

#[derive(sqlx::FromRow)]
struct BlobCandidate {
    blob_id: i64,
    source_type: String,
    source_id: String,
    sha256: String,
    format: String,
    meta_json: Value,
}

pub struct Materializer {
    pool: PgPool,
    store: std::sync::Arc<dyn Store>,
    max_attempts: i32,
}

impl Materializer {
    pub fn new(pool: PgPool, store: std::sync::Arc<dyn Store>, max_attempts: i32) -> Self {
        Self {
            pool,
            store,
            max_attempts,
        }
    }

    /// The batch-selection query from spec §4.H, `FOR UPDATE SKIP LOCKED`
    /// so concurrent materializer workers partition the backlog instead of
    /// blocking each other.
    pub async fn select_batch(
        &self,
        source_type: Option<SourceType>,
        include_failed: bool,
        batch_size: i64,
    ) -> Result<Vec<i64>, MaterializerError> {
        let statuses: Vec<String> = if include_failed {
            vec!["pending".to_string(), "failed".to_string()]
        } else {
            vec!["pending".to_string()]
        };

        let sql = "SELECT blob_id FROM scm.patch_blobs
             WHERE ((uri IS NULL OR uri = '')
                    OR meta_json->>'materialize_status' = ANY($1))
               AND ($2::text IS NULL OR source_type = $2)
               AND COALESCE((meta_json->>'attempts')::int, 0) < $3
             ORDER BY blob_id LIMIT $4 FOR UPDATE SKIP LOCKED";

        let rows: Vec<(i64,)> = sqlx::query_as(sql)
            .bind(&statuses)
            .bind(source_type.map(|s| s.as_str().to_string()))
            .bind(self.max_attempts)
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn load(&self, blob_id: i64) -> Result<BlobCandidate, MaterializerError> {
        let row = sqlx::query_as::<_, BlobCandidate>(
            "SELECT blob_id, source_type, source_id, sha256, format, meta_json
             FROM scm.patch_blobs WHERE blob_id = $1",
        )
        .bind(blob_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Step 1 of the per-blob pipeline: marks `in_progress`, records
    /// `last_attempt_at`, bumps `attempts`.
    async fn mark_in_progress(&self, blob_id: i64) -> Result<(), MaterializerError> {
        sqlx::query(
            "UPDATE scm.patch_blobs
             SET meta_json = meta_json
                 || jsonb_build_object('materialize_status', 'in_progress')
                 || jsonb_build_object('last_attempt_at', now())
                 || jsonb_build_object('attempts', COALESCE((meta_json->>'attempts')::int, 0) + 1)
             WHERE blob_id = $1",
        )
        .bind(blob_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        blob_id: i64,
        category: ErrorCategory,
        endpoint: Option<&str>,
        status_code: Option<i32>,
        error: &str,
        extra: Value,
    ) -> Result<(), MaterializerError> {
        let redacted = scm_errors::redact(error);
        let mut patch = serde_json::json!({
            "materialize_status": "failed",
            "last_error": redacted,
            "error_category": category.as_str(),
            "last_endpoint": endpoint,
            "last_status_code": status_code,
        });
        if let Value::Object(extra_map) = extra {
            if let Value::Object(map) = &mut patch {
                map.extend(extra_map);
            }
        }

        sqlx::query("UPDATE scm.patch_blobs SET meta_json = meta_json || $2 WHERE blob_id = $1")
            .bind(blob_id)
            .bind(patch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Step 7: optimistic-lock write, conditional on `sha256 = expected`
    /// so two concurrent winners of the same content-address can't
    /// cross-write each other's URI (spec §4.H, §5 ordering guarantees).
    async fn mark_done(
        &self,
        blob_id: i64,
        expected_sha256: &str,
        uri: &str,
        size: u64,
        evidence_uri: &str,
    ) -> Result<bool, MaterializerError> {
        let result = sqlx::query(
            "UPDATE scm.patch_blobs
             SET uri = $3, size_bytes = $4, evidence_uri = $5,
                 meta_json = meta_json || jsonb_build_object(
                     'materialize_status', 'done',
                     'materialized_at', now()
                 ),
                 updated_at = now()
             WHERE blob_id = $1 AND sha256 = $2",
        )
        .bind(blob_id)
        .bind(expected_sha256)
        .bind(uri)
        .bind(size as i64)
        .bind(evidence_uri)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Runs the full per-blob pipeline (spec §4.H steps 1-7) for an
    /// already-fetched, already-transformed payload. Fetching and
    /// format-transformation are handler-specific and live above this
    /// layer (the worker's executor); this is the part that's identical
    /// across Git/SVN/GitLab.
    pub async fn materialize(
        &self,
        blob_id: i64,
        project_key: &str,
        repo_id: i64,
        rev_or_sha: &str,
        format: PatchFormat,
        transformed_bytes: &[u8],
        sha_mismatch_policy: ShaMismatchPolicy,
    ) -> Result<bool, MaterializerError> {
        self.mark_in_progress(blob_id).await?;
        let candidate = self.load(blob_id).await?;
        let source_type: SourceType = candidate.source_type.parse().unwrap_or(SourceType::Git);

        let actual_sha256 = sha256_hex(transformed_bytes);
        let expected = &candidate.sha256;

        if expected != &actual_sha256 {
            match sha_mismatch_policy {
                ShaMismatchPolicy::Strict => {
                    self.mark_failed(
                        blob_id,
                        ErrorCategory::ValidationError,
                        None,
                        None,
                        "sha256 mismatch",
                        serde_json::json!({ "actual_sha256": actual_sha256 }),
                    )
                    .await?;
                    return Ok(false);
                }
                ShaMismatchPolicy::Mirror => {
                    let mirror_path = path::build_canonical_path(
                        project_key,
                        repo_id,
                        source_type,
                        rev_or_sha,
                        &actual_sha256,
                        format,
                    )
                    .map_err(|e| {
                        MaterializerError::Store(scm_artifact_store::StoreError::Backend(e.to_string()))
                    })?;
                    let info = self
                        .store
                        .put(&mirror_path, transformed_bytes, OverwritePolicy::AllowSameHash)
                        .await?;
                    self.mark_failed(
                        blob_id,
                        ErrorCategory::ValidationError,
                        None,
                        None,
                        "sha256 mismatch, mirrored",
                        serde_json::json!({
                            "mirror_uri": info.uri,
                            "actual_sha256": actual_sha256,
                            "mirrored_at": Utc::now().to_rfc3339(),
                        }),
                    )
                    .await?;
                    return Ok(false);
                }
            }
        }

        let canonical_path = path::build_canonical_path(
            project_key,
            repo_id,
            source_type,
            rev_or_sha,
            &actual_sha256,
            format,
        )
        .map_err(|e| MaterializerError::Store(scm_artifact_store::StoreError::Backend(e.to_string())))?;

        let info = self
            .store
            .put(&canonical_path, transformed_bytes, OverwritePolicy::AllowSameHash)
            .await?;

        let evidence_uri =
            scm_evidence::build_canonical_uri(source_type.as_str(), &candidate.source_id, &actual_sha256);

        let written = self
            .mark_done(blob_id, expected, &info.uri, info.size, &evidence_uri)
            .await?;
        Ok(written)
    }

    pub async fn mark_fetch_failed(
        &self,
        blob_id: i64,
        category: ErrorCategory,
        endpoint: Option<&str>,
        status_code: Option<i32>,
        error: &str,
    ) -> Result<(), MaterializerError> {
        self.mark_failed(blob_id, category, endpoint, status_code, error, Value::Null)
            .await
    }
}

/// Derives a "N file(s) changed, X insertion(s), Y deletion(s)" summary
/// from raw diff text (spec §4.H "diffstat").
pub fn derive_diffstat(diff_text: &str) -> String {
    let mut files_changed = 0usize;
    let mut insertions = 0usize;
    let mut deletions = 0usize;

    for line in diff_text.lines() {
        if line.starts_with("diff --git ") || line.starts_with("Index: ") {
            files_changed += 1;
        } else if line.starts_with('+') && !line.starts_with("+++") {
            insertions += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            deletions += 1;
        }
    }

    format!(
        "{files_changed} file{fp} changed, {insertions} insertion{ip}(+), {deletions} deletion{dp}(-)",
        fp = plural(files_changed),
        ip = plural(insertions),
        dp = plural(deletions),
    )
}

/// Derives a ministat summary without a real diff: from `meta_json.stats`
/// for Git, from `changed_paths` counts for SVN (spec §4.H "ministat").
pub fn derive_ministat(source_type: SourceType, meta: &PatchBlobMeta) -> String {
    match source_type {
        SourceType::Git => {
            let stats = meta.stats.as_ref();
            let additions = stats.and_then(|s| s.get("additions")).and_then(|v| v.as_u64()).unwrap_or(0);
            let deletions = stats.and_then(|s| s.get("deletions")).and_then(|v| v.as_u64()).unwrap_or(0);
            let files = stats.and_then(|s| s.get("files_changed")).and_then(|v| v.as_u64()).unwrap_or(0);
            format!(
                "{files} file{fp} changed, {additions} insertion{ip}(+), {deletions} deletion{dp}(-)",
                fp = plural(files as usize),
                ip = plural(additions as usize),
                dp = plural(deletions as usize),
            )
        }
        SourceType::Svn => {
            let paths = meta.changed_paths.as_ref().and_then(|v| v.as_array());
            let mut added = 0usize;
            let mut modified = 0usize;
            let mut deleted = 0usize;
            let mut replaced = 0usize;
            if let Some(paths) = paths {
                for entry in paths {
                    match entry.get("action").and_then(|v| v.as_str()) {
                        Some("A") => added += 1,
                        Some("M") => modified += 1,
                        Some("D") => deleted += 1,
                        Some("R") => replaced += 1,
                        _ => {}
                    }
                }
            }
            format!(
                "{added} added, {modified} modified, {deleted} deleted, {replaced} replaced"
            )
        }
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diffstat_counts_files_and_line_changes() {
        let diff = "diff --git a/x.rs b/x.rs\n--- a/x.rs\n+++ b/x.rs\n+added line\n-removed line\n";
        let summary = derive_diffstat(diff);
        assert_eq!(summary, "1 file changed, 1 insertion(+), 1 deletion(-)");
    }

    #[test]
    fn ministat_for_git_reads_meta_stats() {
        let meta = PatchBlobMeta {
            stats: Some(serde_json::json!({"additions": 3, "deletions": 1, "files_changed": 2})),
            ..Default::default()
        };
        let summary = derive_ministat(SourceType::Git, &meta);
        assert_eq!(summary, "2 files changed, 3 insertions(+), 1 deletion(-)");
    }

    #[test]
    fn ministat_for_svn_counts_changed_path_actions() {
        let meta = PatchBlobMeta {
            changed_paths: Some(serde_json::json!([
                {"path": "a", "action": "A"},
                {"path": "b", "action": "M"},
                {"path": "c", "action": "D"},
            ])),
            ..Default::default()
        };
        let summary = derive_ministat(SourceType::Svn, &meta);
        assert_eq!(summary, "1 added, 1 modified, 1 deleted, 0 replaced");
    }
}
