use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::path::PathError;
use crate::{sha256_hex, temp_file_name, ArtifactInfo, OverwritePolicy, Store, StoreError};

const FILE_SCHEME: &str = "file://";

/// Accepts absolute `file://` URIs, optionally restricted to one of
/// `allowed_roots` (spec §4.A, "FileUriStore").
pub struct FileUriStore {
    allowed_roots: Vec<PathBuf>,
    max_size_bytes: Option<u64>,
    file_mode: u32,
}

impl FileUriStore {
    pub fn new() -> Self {
        Self {
            allowed_roots: Vec::new(),
            max_size_bytes: None,
            file_mode: 0o600,
        }
    }

    pub fn with_allowed_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.allowed_roots = roots;
        self
    }

    pub fn with_max_size_bytes(mut self, max: u64) -> Self {
        self.max_size_bytes = Some(max);
        self
    }

    fn parse(&self, uri: &str) -> Result<PathBuf, StoreError> {
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(StoreError::InvalidPath(PathError::Empty));
        }
        let raw_path = trimmed
            .strip_prefix(FILE_SCHEME)
            .ok_or(StoreError::InvalidPath(PathError::Empty))?;
        let path = PathBuf::from(raw_path);
        if !path.is_absolute() {
            return Err(StoreError::InvalidPath(PathError::Empty));
        }
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StoreError::InvalidPath(PathError::ParentTraversal));
        }
        if !self.allowed_roots.is_empty()
            && !self.allowed_roots.iter().any(|root| path.starts_with(root))
        {
            return Err(StoreError::InvalidPath(PathError::PrefixNotAllowed));
        }
        Ok(path)
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

impl Default for FileUriStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for FileUriStore {
    async fn put(
        &self,
        uri: &str,
        bytes: &[u8],
        policy: OverwritePolicy,
    ) -> Result<ArtifactInfo, StoreError> {
        let target = self.parse(uri)?;
        if let Some(limit) = self.max_size_bytes {
            if bytes.len() as u64 > limit {
                return Err(StoreError::SizeExceeded { limit });
            }
        }

        let new_hash = sha256_hex(bytes);
        let canonical_uri = format!("{FILE_SCHEME}{}", target.display());

        match policy {
            OverwritePolicy::Deny => {
                if self.existing_info(&target, &canonical_uri).await?.is_some() {
                    return Err(StoreError::OverwriteDenied);
                }
            }
            OverwritePolicy::AllowSameHash => {
                if let Some(existing) = self.existing_info(&target, &canonical_uri).await? {
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
        let parent = target.parent().unwrap_or_else(|| Path::new("/"));
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
            uri: canonical_uri,
            sha256: new_hash,
            size: bytes.len() as u64,
        })
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, StoreError> {
        let target = self.parse(uri)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StoreError::NotFound(uri.to_string()),
                _ => StoreError::Io(e),
            })
    }

    async fn get_info(&self, uri: &str) -> Result<ArtifactInfo, StoreError> {
        let target = self.parse(uri)?;
        self.existing_info(&target, uri)
            .await?
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))
    }

    async fn exists(&self, uri: &str) -> Result<bool, StoreError> {
        let target = self.parse(uri)?;
        Ok(tokio::fs::metadata(&target).await.is_ok())
    }

    fn resolve(&self, uri: &str) -> Result<String, StoreError> {
        let target = self.parse(uri)?;
        Ok(format!("{FILE_SCHEME}{}", target.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileUriStore::new();
        let uri = format!("file://{}/blob.diff", dir.path().display());
        store.put(&uri, b"hello", OverwritePolicy::Allow).await.unwrap();
        let bytes = store.get(&uri).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn rejects_relative_uri() {
        let store = FileUriStore::new();
        let err = store.put("file://rel/path", b"x", OverwritePolicy::Allow).await;
        assert!(matches!(err, Err(StoreError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn enforces_allowed_roots() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let store = FileUriStore::new().with_allowed_roots(vec![dir.path().to_path_buf()]);
        let uri = format!("file://{}/blob.diff", other.path().display());
        let err = store.put(&uri, b"x", OverwritePolicy::Allow).await;
        assert!(matches!(err, Err(StoreError::InvalidPath(_))));
    }
}
