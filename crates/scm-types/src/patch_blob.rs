use serde::{Deserialize, Serialize};

/// `patch_blobs.format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchFormat {
    Diff,
    Diffstat,
    Ministat,
}

impl PatchFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchFormat::Diff => "diff",
            PatchFormat::Diffstat => "diffstat",
            PatchFormat::Ministat => "ministat",
        }
    }

    pub fn ext(self) -> &'static str {
        self.as_str()
    }
}

impl std::str::FromStr for PatchFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "diff" => Ok(PatchFormat::Diff),
            "diffstat" => Ok(PatchFormat::Diffstat),
            "ministat" => Ok(PatchFormat::Ministat),
            other => Err(format!("unknown patch format: {other}")),
        }
    }
}

/// `patch_blobs.meta_json.materialize_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl MaterializeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MaterializeStatus::Pending => "pending",
            MaterializeStatus::InProgress => "in_progress",
            MaterializeStatus::Done => "done",
            MaterializeStatus::Failed => "failed",
        }
    }
}

/// The source discriminator used throughout `patch_blobs.source_type` and
/// the evidence URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Git,
    Svn,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Git => "git",
            SourceType::Svn => "svn",
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(SourceType::Git),
            "svn" => Ok(SourceType::Svn),
            other => Err(format!("unknown source_type: {other}")),
        }
    }
}

/// Structured view of `patch_blobs.meta_json`. Unknown keys are dropped on
/// round-trip deliberately: this is the typed shape the materializer reads
/// and writes, not a raw passthrough bag (contrast with `JobPayload`, which
/// preserves `extra` because the Runner writes forward-looking fields the
/// core doesn't know about yet).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchBlobMeta {
    pub materialize_status: Option<MaterializeStatus>,
    #[serde(default)]
    pub attempts: i32,
    pub last_error: Option<String>,
    pub error_category: Option<String>,
    pub last_endpoint: Option<String>,
    pub last_status_code: Option<i32>,
    pub materialized_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    pub evidence_uri: Option<String>,
    pub mirror_uri: Option<String>,
    pub actual_sha256: Option<String>,
    pub mirrored_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Raw stats payload used by ministat derivation (`meta_json.stats` for
    /// git commits).
    pub stats: Option<serde_json::Value>,
    /// SVN changed-path list used by ministat derivation when a real diff
    /// is unavailable.
    pub changed_paths: Option<serde_json::Value>,
}

/// A `patch_blobs` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchBlob {
    pub blob_id: i64,
    pub source_type: SourceType,
    pub source_id: String,
    pub sha256: String,
    pub size_bytes: Option<i64>,
    pub format: PatchFormat,
    pub uri: Option<String>,
    pub evidence_uri: Option<String>,
    pub meta: PatchBlobMeta,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}
