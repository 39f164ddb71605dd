//! Object storage for rendered exports. Only the upload / sign / read /
//! delete contract matters to the pipeline; backends are local disk or an
//! S3-compatible store.

pub mod local;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use local::LocalDiskStorage;
pub use s3::S3Storage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store request for {key} failed: {message}")]
    Remote { key: String, message: String },

    #[error("object {0} not found")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("storage misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub content_type: String,
    pub content_disposition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub url: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload_buffer(
        &self,
        bytes: Bytes,
        key: &str,
        options: UploadOptions,
    ) -> Result<StoredObject, StorageError>;

    /// A time-boxed URL the holder can GET without credentials.
    async fn signed_download_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError>;

    async fn read_object(&self, key: &str) -> Result<Bytes, StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;
}

/// Rejects keys that could escape the bucket or root directory.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_accepts_export_keys() {
        assert!(validate_key("b7e1/2024-03-09/exports/9f2c.pdf").is_ok());
    }

    #[test]
    fn test_validate_key_rejects_traversal() {
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("user/../../secret").is_err());
        assert!(validate_key("/absolute/key").is_err());
        assert!(validate_key("double//slash").is_err());
        assert!(validate_key("").is_err());
    }
}
