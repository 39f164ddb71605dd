use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info};

use super::{validate_key, ObjectStorage, StorageError, StoredObject, UploadOptions};

type HmacSha256 = Hmac<Sha256>;

/// Stores objects under a root directory and serves them through the
/// `/files/*key` route with HMAC-signed, expiring links.
pub struct LocalDiskStorage {
    root: PathBuf,
    public_base_url: String,
    signing_secret: String,
}

impl LocalDiskStorage {
    pub fn new(
        root: impl Into<PathBuf>,
        public_base_url: &str,
        signing_secret: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_secret: signing_secret.into(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(Path::new(key)))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/files/{key}", self.public_base_url)
    }

    fn mac(&self, key: &str, expires: i64) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .expect("HMAC can use any key length");
        mac.update(format!("{key}\n{expires}").as_bytes());
        mac
    }

    /// Checks a link produced by `signed_download_url`. Comparison is constant-time.
    pub fn verify_download(&self, key: &str, expires: i64, signature: &str, now_unix: i64) -> bool {
        if expires < now_unix || validate_key(key).is_err() {
            return false;
        }
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        self.mac(key, expires).verify_slice(&provided).is_ok()
    }
}

#[async_trait]
impl ObjectStorage for LocalDiskStorage {
    async fn upload_buffer(
        &self,
        bytes: Bytes,
        key: &str,
        _options: UploadOptions,
    ) -> Result<StoredObject, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        info!(key, size = bytes.len(), "Stored object on local disk");
        Ok(StoredObject {
            key: key.to_string(),
            url: self.public_url(key),
        })
    }

    async fn signed_download_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError> {
        validate_key(key)?;
        let expires = Utc::now().timestamp() + ttl_secs as i64;
        let signature = hex::encode(self.mac(key, expires).finalize().into_bytes());
        Ok(format!(
            "{}?expires={expires}&signature={signature}",
            self.public_url(key)
        ))
    }

    async fn read_object(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "Deleted local object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
