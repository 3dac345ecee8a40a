//! S3-compatible backend (spec §4.A, "ObjectStore specifics"). Gated behind
//! the `object-store` feature since `aws-sdk-s3` pulls in a sizeable async
//! runtime surface that most deployments (local dev, single-node workers)
//! don't need.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::{sha256_hex, ArtifactInfo, OverwritePolicy, Store, StoreError};

const SHA256_METADATA_KEY: &str = "sha256";

pub struct ObjectStore {
    client: Client,
    bucket: String,
    multipart_threshold: u64,
    multipart_chunk_size: u64,
    storage_class: Option<aws_sdk_s3::types::StorageClass>,
    sse: Option<aws_sdk_s3::types::ServerSideEncryption>,
}

impl ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            multipart_threshold: 8 * 1024 * 1024,
            multipart_chunk_size: 8 * 1024 * 1024,
            storage_class: None,
            sse: None,
        }
    }

    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), bucket)
    }

    pub fn with_multipart_threshold(mut self, bytes: u64) -> Self {
        self.multipart_threshold = bytes;
        self
    }

    pub fn with_multipart_chunk_size(mut self, bytes: u64) -> Self {
        self.multipart_chunk_size = bytes;
        self
    }

    pub fn with_storage_class(mut self, class: aws_sdk_s3::types::StorageClass) -> Self {
        self.storage_class = Some(class);
        self
    }

    pub fn with_sse(mut self, sse: aws_sdk_s3::types::ServerSideEncryption) -> Self {
        self.sse = Some(sse);
        self
    }

    fn key_for(&self, uri: &str) -> String {
        uri.strip_prefix("s3://")
            .and_then(|rest| rest.split_once('/'))
            .map(|(_, key)| key.to_string())
            .unwrap_or_else(|| uri.to_string())
    }

    async fn single_put(&self, key: &str, bytes: &[u8], sha256: &str) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .metadata(SHA256_METADATA_KEY, sha256);
        if let Some(class) = self.storage_class.clone() {
            request = request.storage_class(class);
        }
        if let Some(sse) = self.sse.clone() {
            request = request.server_side_encryption(sse);
        }
        request.send().await.map_err(classify_sdk_error).map(|_| ())
    }

    async fn multipart_put(&self, key: &str, bytes: &[u8], sha256: &str) -> Result<(), StoreError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .metadata(SHA256_METADATA_KEY, sha256)
            .send()
            .await
            .map_err(classify_sdk_error)?;
        let upload_id = create.upload_id().ok_or_else(|| {
            StoreError::Backend("multipart upload did not return an upload id".into())
        })?;

        let mut completed_parts = Vec::new();
        let chunk_size = self.multipart_chunk_size.max(1) as usize;
        for (index, chunk) in bytes.chunks(chunk_size).enumerate() {
            let part_number = (index + 1) as i32;
            let upload_result = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await;

            match upload_result {
                Ok(output) => {
                    let part = aws_sdk_s3::types::CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(output.e_tag().map(str::to_string))
                        .build();
                    completed_parts.push(part);
                }
                Err(e) => {
                    let _ = self
                        .client
                        .abort_multipart_upload()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .send()
                        .await;
                    return Err(classify_sdk_error(e));
                }
            }
        }

        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        if let Err(e) = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
        {
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await;
            return Err(classify_sdk_error(e));
        }

        Ok(())
    }
}

#[async_trait]
impl Store for ObjectStore {
    async fn put(
        &self,
        uri: &str,
        bytes: &[u8],
        policy: OverwritePolicy,
    ) -> Result<ArtifactInfo, StoreError> {
        let key = self.key_for(uri);
        let sha256 = sha256_hex(bytes);

        if !matches!(policy, OverwritePolicy::Allow) {
            if let Ok(existing) = self.get_info(uri).await {
                match policy {
                    OverwritePolicy::Deny => return Err(StoreError::OverwriteDenied),
                    OverwritePolicy::AllowSameHash => {
                        if existing.sha256 == sha256 {
                            return Ok(existing);
                        }
                        return Err(StoreError::HashMismatch {
                            expected: sha256,
                            actual: existing.sha256,
                        });
                    }
                    OverwritePolicy::Allow => unreachable!(),
                }
            }
        }

        if bytes.len() as u64 > self.multipart_threshold {
            self.multipart_put(&key, bytes, &sha256).await?;
        } else {
            self.single_put(&key, bytes, &sha256).await?;
        }

        Ok(ArtifactInfo {
            uri: format!("s3://{}/{key}", self.bucket),
            sha256,
            size: bytes.len() as u64,
        })
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, StoreError> {
        let key = self.key_for(uri);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(classify_sdk_error)?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    async fn get_info(&self, uri: &str) -> Result<ArtifactInfo, StoreError> {
        let key = self.key_for(uri);
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let size = head.content_length().unwrap_or(0).max(0) as u64;
        let sha256 = match head.metadata().and_then(|m| m.get(SHA256_METADATA_KEY)).cloned() {
            Some(hash) => hash,
            None => sha256_hex(&self.get(uri).await?),
        };

        Ok(ArtifactInfo {
            uri: format!("s3://{}/{key}", self.bucket),
            sha256,
            size,
        })
    }

    async fn exists(&self, uri: &str) -> Result<bool, StoreError> {
        match self.get_info(uri).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn resolve(&self, uri: &str) -> Result<String, StoreError> {
        Ok(format!("s3://{}/{}", self.bucket, self.key_for(uri)))
    }
}

fn classify_sdk_error<E, R>(error: aws_sdk_s3::error::SdkError<E, R>) -> StoreError
where
    E: std::error::Error + aws_sdk_s3::error::ProvideErrorMetadata + 'static,
{
    use aws_sdk_s3::error::SdkError;

    match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => StoreError::ObjectStoreTimeout,
        _ => {
            let code = error.code().unwrap_or_default();
            match code {
                "SlowDown" | "TooManyRequests" | "429" | "RequestLimitExceeded" => {
                    StoreError::ObjectStoreThrottling
                }
                "NoSuchKey" | "NotFound" | "404" => StoreError::NotFound(code.to_string()),
                _ => StoreError::Backend(error.to_string()),
            }
        }
    }
}
