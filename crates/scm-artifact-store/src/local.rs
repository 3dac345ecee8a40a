use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::path::{assert_within_root, validate_path};
use crate::{sha256_hex, temp_file_name, ArtifactInfo, OverwritePolicy, Store, StoreError};

/// Store rooted at a configured directory; `uri` is a path relative to
/// that root (spec §4.A, "LocalArtifactsStore").
pub struct LocalArtifactsStore {
    root: PathBuf,
    allowed_prefixes: Vec<String>,
    max_size_bytes: Option<u64>,
    file_mode: u32,
}

impl LocalArtifactsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allowed_prefixes: Vec::new(),
            max_size_bytes: None,
            file_mode: 0o600,
        }
    }

    pub fn with_allowed_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.allowed_prefixes = prefixes;
        self
    }

    pub fn with_max_size_bytes(mut self, max: u64) -> Self {
        self.max_size_bytes = Some(max);
        self
    }

    pub fn with_file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    fn target_path(&self, normalized: &str) -> PathBuf {
        self.root.join(normalized)
    }

    async fn existing_info(&self, target: &Path, uri: &str) -> Result<Option<ArtifactInfo>, StoreError> {
        match tokio::fs::read(target).await {
            Ok(bytes) => Ok(Some(ArtifactInfo {
                uri: uri.to_string(),
                sha256: sha256_hex(&bytes),
                size: bytes.len() as u64,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[async_trait]
impl Store for LocalArtifactsStore {
    async fn put(
        &self,
        uri: &str,
        bytes: &[u8],
        policy: OverwritePolicy,
    ) -> Result<ArtifactInfo, StoreError> {
        let normalized = validate_path(uri, &self.allowed_prefixes)?;
        if let Some(limit) = self.max_size_bytes {
            if bytes.len() as u64 > limit {
                return Err(StoreError::SizeExceeded { limit });
            }
        }

        let target = self.target_path(&normalized);
        assert_within_root(&self.root, &target)
            .map_err(StoreError::InvalidPath)?;

        let new_hash = sha256_hex(bytes);

        match policy {
            OverwritePolicy::Deny => {
                if self.existing_info(&target, &normalized).await?.is_some() {
                    return Err(StoreError::OverwriteDenied);
                }
            }
            OverwritePolicy::AllowSameHash => {
                if let Some(existing) = self.existing_info(&target, &normalized).await? {
                    if existing.sha256 == new_hash {
                        return Ok(existing);
                    }
                    return Err(StoreError::HashMismatch {
                        expected: new_hash,
                        actual: existing.sha256,
                    });
                }
            }
            OverwritePolicy::Allow => {}
        }

        let basename = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;
        let temp_path = parent.join(temp_file_name(basename));

        let write_result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StoreError::Io(e));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = tokio::fs::set_permissions(
                &temp_path,
                std::fs::Permissions::from_mode(self.file_mode),
            )
            .await
            {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(StoreError::Io(e));
            }
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &target).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StoreError::Io(e));
        }

        Ok(ArtifactInfo {
            uri: normalized,
            sha256: new_hash,
            size: bytes.len() as u64,
        })
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, StoreError> {
        let normalized = validate_path(uri, &self.allowed_prefixes)?;
        let target = self.target_path(&normalized);
        tokio::fs::read(&target)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StoreError::NotFound(normalized.clone()),
                _ => StoreError::Io(e),
            })
    }

    async fn get_info(&self, uri: &str) -> Result<ArtifactInfo, StoreError> {
        let normalized = validate_path(uri, &self.allowed_prefixes)?;
        let target = self.target_path(&normalized);
        self.existing_info(&target, &normalized)
            .await?
            .ok_or(StoreError::NotFound(normalized))
    }

    async fn exists(&self, uri: &str) -> Result<bool, StoreError> {
        let normalized = validate_path(uri, &self.allowed_prefixes)?;
        let target = self.target_path(&normalized);
        Ok(tokio::fs::metadata(&target).await.is_ok())
    }

    fn resolve(&self, uri: &str) -> Result<String, StoreError> {
        validate_path(uri, &self.allowed_prefixes).map_err(StoreError::InvalidPath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactsStore::new(dir.path());
        let info = store
            .put("git/abcd1234", b"diff content", OverwritePolicy::Deny)
            .await
            .unwrap();
        assert_eq!(info.size, 12);
        let bytes = store.get("git/abcd1234").await.unwrap();
        assert_eq!(bytes, b"diff content");
    }

    #[tokio::test]
    async fn deny_rejects_second_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactsStore::new(dir.path());
        store
            .put("x", b"one", OverwritePolicy::Deny)
            .await
            .unwrap();
        let err = store.put("x", b"two", OverwritePolicy::Deny).await;
        assert!(matches!(err, Err(StoreError::OverwriteDenied)));
    }

    #[tokio::test]
    async fn allow_same_hash_is_noop_for_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactsStore::new(dir.path());
        store
            .put("x", b"same", OverwritePolicy::AllowSameHash)
            .await
            .unwrap();
        let info = store
            .put("x", b"same", OverwritePolicy::AllowSameHash)
            .await
            .unwrap();
        assert_eq!(info.sha256, sha256_hex(b"same"));
    }

    #[tokio::test]
    async fn allow_same_hash_rejects_differing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactsStore::new(dir.path());
        store
            .put("x", b"one", OverwritePolicy::AllowSameHash)
            .await
            .unwrap();
        let err = store.put("x", b"two", OverwritePolicy::AllowSameHash).await;
        assert!(matches!(err, Err(StoreError::HashMismatch { .. })));
    }

    #[tokio::test]
    async fn no_temp_files_survive_a_successful_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactsStore::new(dir.path());
        store
            .put("x", b"content", OverwritePolicy::Allow)
            .await
            .unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }

    #[tokio::test]
    async fn rejects_path_outside_allowed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactsStore::new(dir.path())
            .with_allowed_prefixes(vec!["git".to_string()]);
        let err = store.put("svn/r1", b"x", OverwritePolicy::Allow).await;
        assert!(matches!(err, Err(StoreError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn get_missing_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactsStore::new(dir.path());
        let err = store.get("missing").await;
        assert!(matches!(err, Err(StoreError::NotFound(_))));
    }
}
