use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::services::{Azblob, Fs, S3};
use opendal::Operator;
use thiserror::Error;
use tracing::debug;

use crate::config::{AppConfig, StorageBackend};
use crate::error::{AppError, Result};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Backend(#[from] opendal::Error),

    #[error("Storage operation on {0} timed out")]
    Timeout(String),
}

/// Addressable blob storage with put-by-name overwrite semantics.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Write `content` under `name`, replacing whatever was there.
    async fn put(&self, name: &str, content: Bytes, content_type: &str) -> std::result::Result<(), StoreError>;

    async fn get(&self, name: &str) -> std::result::Result<Bytes, StoreError>;

    /// Names of all objects in the store.
    async fn list(&self) -> std::result::Result<Vec<String>, StoreError>;

    /// Store-relative path clients use to download `name`.
    fn download_path(&self, name: &str) -> String;
}

#[derive(Debug)]
pub struct OperatorStore {
    operator: Operator,
    container: String,
    prefix: String,
    timeout: Duration,
}

impl OperatorStore {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let storage = &config.storage;
        let container = storage.container.trim_matches('/').to_string();

        let (operator, prefix) = match storage.backend {
            StorageBackend::Fs => {
                let root = storage.fs_root.clone()
                    .ok_or_else(|| AppError::Config("Missing fs_root configuration".to_string()))?;

                let mut builder = Fs::default();
                builder.root(&root.to_string_lossy());

                let operator = Operator::new(builder)
                    .map_err(StoreError::Backend)?
                    .finish();
                (operator, container.clone())
            }
            StorageBackend::S3 => {
                let bucket = storage.s3_bucket.clone()
                    .ok_or_else(|| AppError::Config("Missing s3_bucket configuration".to_string()))?;
                let region = storage.s3_region.clone()
                    .ok_or_else(|| AppError::Config("Missing s3_region configuration".to_string()))?;

                let mut builder = S3::default();
                builder.bucket(&bucket);
                builder.region(&region);

                if let Some(endpoint) = &storage.s3_endpoint {
                    builder.endpoint(endpoint);
                }

                if let Some(access_key) = &storage.s3_access_key {
                    builder.access_key_id(access_key);
                }

                if let Some(secret_key) = &storage.s3_secret_key {
                    builder.secret_access_key(secret_key);
                }

                let operator = Operator::new(builder)
                    .map_err(StoreError::Backend)?
                    .finish();
                (operator, container.clone())
            }
            StorageBackend::Azblob => {
                let account = storage.azblob_account.clone()
                    .ok_or_else(|| AppError::Config("Missing azblob_account configuration".to_string()))?;

                let endpoint = storage.azblob_endpoint.clone()
                    .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", account));

                let mut builder = Azblob::default();
                builder.container(&container);
                builder.endpoint(&endpoint);
                builder.account_name(&account);

                if let Some(account_key) = &storage.azblob_account_key {
                    builder.account_key(account_key);
                }

                let operator = Operator::new(builder)
                    .map_err(StoreError::Backend)?
                    .finish();
                // The container is native to the service, objects live at its root.
                (operator, String::new())
            }
        };

        Ok(Self {
            operator,
            container,
            prefix,
            timeout: config.timeout(),
        })
    }

    fn object_path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    fn list_root(&self) -> String {
        if self.prefix.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", self.prefix)
        }
    }

    async fn bounded<T, F>(&self, name: &str, op: F) -> std::result::Result<T, StoreError>
    where
        F: std::future::Future<Output = opendal::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result.map_err(StoreError::Backend),
            Err(_) => Err(StoreError::Timeout(name.to_string())),
        }
    }
}

#[async_trait]
impl ContentStore for OperatorStore {
    async fn put(&self, name: &str, content: Bytes, content_type: &str) -> std::result::Result<(), StoreError> {
        let path = self.object_path(name);
        debug!("Writing {} bytes to {}", content.len(), path);
        // The fs service has no notion of content types.
        let with_type = self.operator.info().full_capability().write_with_content_type;
        self.bounded(&path, async {
            if with_type {
                self.operator
                    .write_with(&path, content)
                    .content_type(content_type)
                    .await
            } else {
                self.operator.write(&path, content).await
            }
        })
        .await
    }

    async fn get(&self, name: &str) -> std::result::Result<Bytes, StoreError> {
        let path = self.object_path(name);
        let data = self.bounded(&path, self.operator.read(&path)).await?;
        Ok(Bytes::from(data))
    }

    async fn list(&self) -> std::result::Result<Vec<String>, StoreError> {
        let root = self.list_root();
        let entries = self.bounded(&root, self.operator.list(&root)).await?;

        let mut names = Vec::new();
        for entry in entries {
            if !entry.metadata().is_dir() {
                names.push(entry.name().to_string());
            }
        }
        names.sort();

        Ok(names)
    }

    fn download_path(&self, name: &str) -> String {
        if self.container.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.container, name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn fs_config(root: &std::path::Path) -> AppConfig {
        AppConfig {
            storage: StorageConfig {
                fs_root: Some(root.to_path_buf()),
                container: "models".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_put_overwrites_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let store = OperatorStore::new(&fs_config(dir.path())).unwrap();

        store.put("a.onnx", Bytes::from_static(b"first"), "application/octet-stream").await.unwrap();
        store.put("a.onnx", Bytes::from_static(b"second"), "application/octet-stream").await.unwrap();
        store.put("b.onnx", Bytes::from_static(b"other"), "application/octet-stream").await.unwrap();

        assert_eq!(&store.get("a.onnx").await.unwrap()[..], b"second");
        assert_eq!(store.list().await.unwrap(), vec!["a.onnx".to_string(), "b.onnx".to_string()]);
        assert!(dir.path().join("models").join("a.onnx").exists());
    }

    #[tokio::test]
    async fn test_download_path_includes_container() {
        let dir = tempfile::tempdir().unwrap();
        let store = OperatorStore::new(&fs_config(dir.path())).unwrap();
        assert_eq!(store.download_path("catalog.json"), "models/catalog.json");
    }

    #[test]
    fn test_s3_requires_region() {
        let config = AppConfig {
            storage: StorageConfig {
                backend: StorageBackend::S3,
                s3_bucket: Some("bucket".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = OperatorStore::new(&config).unwrap_err();
        assert!(err.to_string().contains("s3_region"));
    }

    #[tokio::test]
    async fn test_slow_operation_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            timeout_secs: 1,
            ..fs_config(dir.path())
        };
        let store = OperatorStore::new(&config).unwrap();

        let result = store
            .bounded("models/a.onnx", async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok::<(), opendal::Error>(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout(path)) if path == "models/a.onnx"));
    }
}
