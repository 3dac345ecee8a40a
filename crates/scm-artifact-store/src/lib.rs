//! Content-addressed artifact storage (spec §4.A). Three backends —
//! [`local::LocalArtifactsStore`], [`file_uri::FileUriStore`], and
//! (behind the `object-store` feature) [`object::ObjectStore`] — share one
//! [`Store`] trait and one overwrite contract.

mod file_uri;
mod local;
#[cfg(feature = "object-store")]
mod object;
mod path;

pub use file_uri::FileUriStore;
pub use local::LocalArtifactsStore;
#[cfg(feature = "object-store")]
pub use object::ObjectStore;
pub use path::{normalize_path, validate_path, PathError};

use async_trait::async_trait;
use thiserror::Error;

/// How a `put` should behave when the target artifact path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// The rename always succeeds, replacing whatever was there.
    Allow,
    /// Fail with [`StoreError::OverwriteDenied`] if the target exists.
    Deny,
    /// If the target exists and hashes the same, the write is a no-op; if
    /// it hashes differently, fail with [`StoreError::HashMismatch`].
    AllowSameHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub uri: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid artifact path: {0}")]
    InvalidPath(#[from] PathError),
    #[error("artifact already exists at this path")]
    OverwriteDenied,
    #[error("content hash mismatch: expected {expected}, found {actual} at existing path")]
    HashMismatch { expected: String, actual: String },
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("artifact exceeds configured max size ({limit} bytes)")]
    SizeExceeded { limit: u64 },
    #[error("object store operation timed out")]
    ObjectStoreTimeout,
    #[error("object store throttled the request")]
    ObjectStoreThrottling,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

/// The single abstraction the patch materializer and evidence resolver
/// depend on. Each implementation owns its own notion of "uri" — relative
/// paths for the local store, `file://...` for the file-uri store, `s3://
/// bucket/key` for the object store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put(
        &self,
        uri: &str,
        bytes: &[u8],
        policy: OverwritePolicy,
    ) -> Result<ArtifactInfo, StoreError>;

    async fn get(&self, uri: &str) -> Result<Vec<u8>, StoreError>;

    async fn get_info(&self, uri: &str) -> Result<ArtifactInfo, StoreError>;

    async fn exists(&self, uri: &str) -> Result<bool, StoreError>;

    /// Normalizes a caller-supplied URI/path into this backend's canonical
    /// form, applying the same validation `put` would.
    fn resolve(&self, uri: &str) -> Result<String, StoreError>;
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Generates the same `.{basename}.{pid}.{16-hex}.tmp` temp filename shape
/// specified for the atomic write protocol, colocated in the target's
/// directory so the final `rename` is same-filesystem.
pub(crate) fn temp_file_name(basename: &str) -> String {
    use rand::RngCore;
    let mut buf = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut buf);
    let suffix = hex::encode(buf);
    format!(".{basename}.{}.{suffix}.tmp", std::process::id())
}
