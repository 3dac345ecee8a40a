//! `memory://` evidence URIs: parsing, classification, and resolution
//! against `scm.patch_blobs` plus the underlying [`scm_artifact_store::Store`]
//! (spec §4.B).

use scm_artifact_store::Store;
use sqlx::PgPool;
use thiserror::Error;

const MEMORY_SCHEME: &str = "memory://";

/// What kind of thing a URI points at, before any I/O is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
    /// Relative path into an artifact store.
    Artifact,
    File,
    Memory,
    Http,
    S3,
    Unknown,
}

pub fn classify_uri(uri: &str) -> UriKind {
    if uri.starts_with(MEMORY_SCHEME) {
        UriKind::Memory
    } else if uri.starts_with("file://") {
        UriKind::File
    } else if uri.starts_with("http://") || uri.starts_with("https://") {
        UriKind::Http
    } else if uri.starts_with("s3://") {
        UriKind::S3
    } else if !uri.contains("://") && !uri.trim().is_empty() {
        UriKind::Artifact
    } else {
        UriKind::Unknown
    }
}

/// Parsed form of a `memory://` URI (spec §4.B).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryUri {
    Canonical {
        source_type: String,
        source_id: String,
        sha256: String,
    },
    Legacy {
        source_type: String,
        source_id: String,
    },
    BySha256 {
        sha256: String,
    },
    ById {
        blob_id: i64,
    },
    Attachment {
        id: String,
    },
}

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("not a valid memory:// uri: {0}")]
    MemoryUriInvalid(String),
    #[error("evidence not found for uri: {0}")]
    NotFound(String),
    #[error("sha256 mismatch: uri_source={uri_source:?}, db_source={db_source:?}")]
    UriSourceMismatch {
        uri_source: (String, String),
        db_source: (String, String),
    },
    #[error("sha256 mismatch: expected {expected}, actual {actual}")]
    Sha256Mismatch { expected: String, actual: String },
    #[error(transparent)]
    Store(#[from] scm_artifact_store::StoreError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub fn parse_memory_uri(uri: &str) -> Result<MemoryUri, EvidenceError> {
    let rest = uri
        .strip_prefix(MEMORY_SCHEME)
        .ok_or_else(|| EvidenceError::MemoryUriInvalid(uri.to_string()))?;
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["patch_blobs", source_type, source_id, sha256] => Ok(MemoryUri::Canonical {
            source_type: source_type.to_string(),
            source_id: source_id.to_string(),
            sha256: sha256.to_string(),
        }),
        ["patch_blobs", source_type, source_id] => Ok(MemoryUri::Legacy {
            source_type: source_type.to_string(),
            source_id: source_id.to_string(),
        }),
        ["patch_blobs", "sha256", hex] => Ok(MemoryUri::BySha256 {
            sha256: hex.to_string(),
        }),
        ["patch_blobs", "blob_id", id] => {
            let blob_id = id
                .parse::<i64>()
                .map_err(|_| EvidenceError::MemoryUriInvalid(uri.to_string()))?;
            Ok(MemoryUri::ById { blob_id })
        }
        ["attachments", id] => Ok(MemoryUri::Attachment { id: id.to_string() }),
        _ => Err(EvidenceError::MemoryUriInvalid(uri.to_string())),
    }
}

pub fn build_canonical_uri(source_type: &str, source_id: &str, sha256: &str) -> String {
    format!("{MEMORY_SCHEME}patch_blobs/{source_type}/{source_id}/{sha256}")
}

pub fn build_legacy_uri(source_type: &str, source_id: &str) -> String {
    format!("{MEMORY_SCHEME}patch_blobs/{source_type}/{source_id}")
}

/// Row-shaped projection of `scm.patch_blobs` that resolution needs;
/// deliberately narrower than `scm_types::PatchBlob`.
#[derive(sqlx::FromRow)]
struct BlobRow {
    source_type: String,
    source_id: String,
    sha256: String,
    uri: Option<String>,
}

async fn find_by_hash(pool: &PgPool, sha256: &str) -> Result<Option<BlobRow>, sqlx::Error> {
    sqlx::query_as::<_, BlobRow>(
        "SELECT source_type, source_id, sha256, uri FROM scm.patch_blobs WHERE sha256 = $1 LIMIT 1",
    )
    .bind(sha256)
    .fetch_optional(pool)
    .await
}

async fn find_by_source(
    pool: &PgPool,
    source_type: &str,
    source_id: &str,
) -> Result<Option<BlobRow>, sqlx::Error> {
    sqlx::query_as::<_, BlobRow>(
        "SELECT source_type, source_id, sha256, uri FROM scm.patch_blobs
         WHERE source_type = $1 AND source_id = $2 LIMIT 1",
    )
    .bind(source_type)
    .bind(source_id)
    .fetch_optional(pool)
    .await
}

async fn find_by_blob_id(pool: &PgPool, blob_id: i64) -> Result<Option<BlobRow>, sqlx::Error> {
    sqlx::query_as::<_, BlobRow>(
        "SELECT source_type, source_id, sha256, uri FROM scm.patch_blobs WHERE blob_id = $1",
    )
    .bind(blob_id)
    .fetch_optional(pool)
    .await
}

#[derive(Debug, Clone)]
pub struct Evidence {
    pub content: Vec<u8>,
    pub sha256: String,
    pub size: u64,
    pub resource_type: String,
    pub resource_id: String,
    pub uri: String,
    pub artifact_uri: Option<String>,
}

/// Implements the lookup/verification sequence from spec §4.B step 3-5.
pub async fn resolve_memory_uri(
    pool: &PgPool,
    store: &dyn Store,
    uri: &str,
    verify_sha256: bool,
) -> Result<Evidence, EvidenceError> {
    let parsed = parse_memory_uri(uri)?;

    let row = match &parsed {
        MemoryUri::Canonical {
            source_type,
            source_id,
            sha256,
        } => {
            if let Some(row) = find_by_hash(pool, sha256).await? {
                if &row.source_type != source_type || &row.source_id != source_id {
                    return Err(EvidenceError::UriSourceMismatch {
                        uri_source: (source_type.clone(), source_id.clone()),
                        db_source: (row.source_type, row.source_id),
                    });
                }
                row
            } else {
                let row = find_by_source(pool, source_type, source_id)
                    .await?
                    .ok_or_else(|| EvidenceError::NotFound(uri.to_string()))?;
                if &row.sha256 != sha256 {
                    return Err(EvidenceError::Sha256Mismatch {
                        expected: sha256.clone(),
                        actual: row.sha256.clone(),
                    });
                }
                row
            }
        }
        MemoryUri::Legacy {
            source_type,
            source_id,
        } => find_by_source(pool, source_type, source_id)
            .await?
            .ok_or_else(|| EvidenceError::NotFound(uri.to_string()))?,
        MemoryUri::BySha256 { sha256 } => find_by_hash(pool, sha256)
            .await?
            .ok_or_else(|| EvidenceError::NotFound(uri.to_string()))?,
        MemoryUri::ById { blob_id } => find_by_blob_id(pool, blob_id)
            .await?
            .ok_or_else(|| EvidenceError::NotFound(uri.to_string()))?,
        MemoryUri::Attachment { .. } => {
            return Err(EvidenceError::NotFound(uri.to_string()));
        }
    };

    let artifact_uri = row
        .uri
        .clone()
        .ok_or_else(|| EvidenceError::NotFound(uri.to_string()))?;
    let content = store.get(&artifact_uri).await?;

    if verify_sha256 {
        let actual = sha256_of(&content);
        if actual != row.sha256 {
            return Err(EvidenceError::Sha256Mismatch {
                expected: row.sha256,
                actual,
            });
        }
    }

    Ok(Evidence {
        size: content.len() as u64,
        sha256: row.sha256,
        content,
        resource_type: row.source_type,
        resource_id: row.source_id,
        uri: uri.to_string(),
        artifact_uri: Some(artifact_uri),
    })
}

fn sha256_of(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct EvidenceInfo {
    pub sha256: String,
    pub resource_type: String,
    pub resource_id: String,
    pub artifact_uri: Option<String>,
}

/// Metadata-only counterpart to [`resolve_memory_uri`] that never raises —
/// any parse/lookup failure collapses to `None` (spec §4.B).
pub async fn get_evidence_info(pool: &PgPool, uri: &str) -> Option<EvidenceInfo> {
    let parsed = parse_memory_uri(uri).ok()?;
    let row = match parsed {
        MemoryUri::Canonical {
            source_type,
            source_id,
            sha256,
        } => {
            let row = find_by_hash(pool, &sha256).await.ok()??;
            if row.source_type != source_type || row.source_id != source_id {
                return None;
            }
            row
        }
        MemoryUri::Legacy {
            source_type,
            source_id,
        } => find_by_source(pool, &source_type, &source_id).await.ok()??,
        MemoryUri::BySha256 { sha256 } => find_by_hash(pool, &sha256).await.ok()??,
        MemoryUri::ById { blob_id } => find_by_blob_id(pool, blob_id).await.ok()??,
        MemoryUri::Attachment { .. } => return None,
    };

    Some(EvidenceInfo {
        sha256: row.sha256,
        resource_type: row.source_type,
        resource_id: row.source_id,
        artifact_uri: row.uri,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_schemes() {
        assert_eq!(classify_uri("git/abcd"), UriKind::Artifact);
        assert_eq!(classify_uri("file:///tmp/x"), UriKind::File);
        assert_eq!(
            classify_uri("memory://patch_blobs/git/1/abcd"),
            UriKind::Memory
        );
        assert_eq!(classify_uri("https://example.com/x"), UriKind::Http);
        assert_eq!(classify_uri("s3://bucket/key"), UriKind::S3);
        assert_eq!(classify_uri(""), UriKind::Unknown);
    }

    #[test]
    fn parses_canonical_and_legacy_forms() {
        assert_eq!(
            parse_memory_uri("memory://patch_blobs/git/1:2:abcd/deadbeef").unwrap(),
            MemoryUri::Canonical {
                source_type: "git".to_string(),
                source_id: "1:2:abcd".to_string(),
                sha256: "deadbeef".to_string(),
            }
        );
        assert_eq!(
            parse_memory_uri("memory://patch_blobs/git/1:2:abcd").unwrap(),
            MemoryUri::Legacy {
                source_type: "git".to_string(),
                source_id: "1:2:abcd".to_string(),
            }
        );
    }

    #[test]
    fn parses_sha256_and_blob_id_and_attachment_forms() {
        assert_eq!(
            parse_memory_uri("memory://patch_blobs/sha256/deadbeef").unwrap(),
            MemoryUri::BySha256 {
                sha256: "deadbeef".to_string()
            }
        );
        assert_eq!(
            parse_memory_uri("memory://patch_blobs/blob_id/42").unwrap(),
            MemoryUri::ById { blob_id: 42 }
        );
        assert_eq!(
            parse_memory_uri("memory://attachments/xyz").unwrap(),
            MemoryUri::Attachment {
                id: "xyz".to_string()
            }
        );
    }

    #[test]
    fn rejects_non_memory_scheme() {
        assert!(matches!(
            parse_memory_uri("file:///tmp/x"),
            Err(EvidenceError::MemoryUriInvalid(_))
        ));
    }

    #[test]
    fn canonical_uri_round_trips() {
        let uri = build_canonical_uri("git", "1:2:abcd", "deadbeef");
        assert_eq!(
            parse_memory_uri(&uri).unwrap(),
            MemoryUri::Canonical {
                source_type: "git".to_string(),
                source_id: "1:2:abcd".to_string(),
                sha256: "deadbeef".to_string(),
            }
        );
    }
}
