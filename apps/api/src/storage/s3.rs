use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, info};

use super::{validate_key, ObjectStorage, StorageError, StoredObject, UploadOptions};

/// S3-compatible object store (AWS, MinIO, R2). The client is expected to be
/// built with path-style addressing for non-AWS endpoints.
pub struct S3Storage {
    client: Client,
    bucket: String,
    endpoint: String,
}

impl S3Storage {
    pub fn new(client: Client, bucket: &str, endpoint: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// Unsigned location of an object, for logs and upload results.
    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

fn remote(key: &str, error: impl std::error::Error) -> StorageError {
    StorageError::Remote {
        key: key.to_string(),
        message: DisplayErrorContext(error).to_string(),
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn upload_buffer(
        &self,
        bytes: Bytes,
        key: &str,
        options: UploadOptions,
    ) -> Result<StoredObject, StorageError> {
        validate_key(key)?;
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(options.content_type)
            .set_content_disposition(options.content_disposition)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| remote(key, e))?;

        info!(bucket = %self.bucket, key, size, "Uploaded object");
        Ok(StoredObject {
            key: key.to_string(),
            url: self.object_url(key),
        })
    }

    async fn signed_download_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError> {
        validate_key(key)?;
        let presigning = PresigningConfig::expires_in(Duration::from_secs(ttl_secs))
            .map_err(|e| StorageError::Config(format!("invalid download TTL: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| remote(key, e))?;
        Ok(request.uri().to_string())
    }

    async fn read_object(&self, key: &str) -> Result<Bytes, StorageError> {
        validate_key(key)?;
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(remote(key, e)),
        };
        let body = output.body.collect().await.map_err(|e| remote(key, e))?;
        Ok(body.into_bytes())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        // S3 reports success for keys that do not exist.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| remote(key, e))?;
        debug!(bucket = %self.bucket, key, "Deleted object");
        Ok(())
    }
}
