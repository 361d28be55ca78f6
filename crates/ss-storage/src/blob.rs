//! Blob store seam and its OpenDAL implementation

use async_trait::async_trait;
use opendal::Operator;
use tracing::{debug, info};

use ss_core::config::StorageConfig;
use ss_core::{SsError, SsResult};

use crate::operator::{fallback_operator, BucketCredentials};

/// Upload/download of opaque (already encrypted) bundles.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `name`, returning the locator a peer downloads from.
    async fn upload(&self, name: &str, data: Vec<u8>) -> SsResult<String>;

    async fn download(&self, locator: &str) -> SsResult<Vec<u8>>;

    /// Best-effort removal once the receiver has the bundle.
    async fn delete(&self, locator: &str) -> SsResult<()>;
}

/// [`BlobStore`] over any OpenDAL operator, rooted at a key prefix.
#[derive(Clone)]
pub struct OperatorBlobStore {
    op: Operator,
    prefix: String,
}

impl OperatorBlobStore {
    pub fn new(op: Operator, prefix: impl Into<String>) -> Self {
        Self {
            op,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn from_config(storage: &StorageConfig, credentials: &BucketCredentials) -> SsResult<Self> {
        let op = fallback_operator(storage, credentials)
            .map_err(|e| SsError::Storage(format!("{e:#}")))?;
        Ok(Self::new(op, storage.prefix.clone()))
    }

    fn key(&self, name: &str) -> String {
        let name = name.trim_start_matches('/');
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.prefix)
        }
    }

    /// Reject locators outside this store's prefix.
    fn check_locator<'a>(&self, locator: &'a str) -> SsResult<&'a str> {
        if locator.contains("..") || (!self.prefix.is_empty() && !locator.starts_with(&format!("{}/", self.prefix))) {
            return Err(SsError::Storage(format!("locator '{locator}' is outside the store")));
        }
        Ok(locator)
    }
}

#[async_trait]
impl BlobStore for OperatorBlobStore {
    async fn upload(&self, name: &str, data: Vec<u8>) -> SsResult<String> {
        let key = self.key(name);
        let len = data.len();
        self.op
            .write(&key, data)
            .await
            .map_err(|e| SsError::Storage(format!("uploading {key}: {e}")))?;
        info!(key = %key, bytes = len, "fallback bundle uploaded");
        Ok(key)
    }

    async fn download(&self, locator: &str) -> SsResult<Vec<u8>> {
        let key = self.check_locator(locator)?;
        let data = self
            .op
            .read(key)
            .await
            .map_err(|e| SsError::Storage(format!("downloading {key}: {e}")))?
            .to_vec();
        debug!(key = %key, bytes = data.len(), "fallback bundle downloaded");
        Ok(data)
    }

    async fn delete(&self, locator: &str) -> SsResult<()> {
        let key = self.check_locator(locator)?;
        self.op
            .delete(key)
            .await
            .map_err(|e| SsError::Storage(format!("deleting {key}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store(prefix: &str) -> OperatorBlobStore {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        OperatorBlobStore::new(op, prefix)
    }

    #[tokio::test]
    async fn test_upload_download_delete() {
        let store = memory_store("/fallback/");
        let locator = store.upload("abc.bin", b"ciphertext".to_vec()).await.unwrap();
        assert_eq!(locator, "fallback/abc.bin");
        assert_eq!(store.download(&locator).await.unwrap(), b"ciphertext");

        store.delete(&locator).await.unwrap();
        assert!(matches!(
            store.download(&locator).await,
            Err(SsError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_locator_outside_prefix_rejected() {
        let store = memory_store("fallback");
        assert!(store.download("other/abc.bin").await.is_err());
        assert!(store.download("fallback/../secret").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_prefix() {
        let store = memory_store("");
        let locator = store.upload("/x.bin", vec![1, 2, 3]).await.unwrap();
        assert_eq!(locator, "x.bin");
        assert_eq!(store.download(&locator).await.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_from_config_respects_enforce_tls() {
        let storage = StorageConfig {
            enforce_tls: true,
            ..Default::default()
        };
        assert!(matches!(
            OperatorBlobStore::from_config(&storage, &BucketCredentials::new("k", "s")),
            Err(SsError::Storage(_))
        ));
    }
}
