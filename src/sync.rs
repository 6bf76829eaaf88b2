use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{AppConfig, PartialFailurePolicy};
use crate::error::ErrorKind;
use crate::manifest::{CatalogManifest, ManifestBuilder, ModelEntry, MANIFEST_NAME};
use crate::registry::{ArtifactDescriptor, Registry};
use crate::resolver::Resolver;
use crate::storage::{ContentStore, StoreError};

pub const ARTIFACT_CONTENT_TYPE: &str = "application/octet-stream";
pub const MANIFEST_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedArtifact {
    pub key: String,
    pub canonical_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub download_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedArtifact {
    pub key: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub succeeded: Vec<UploadedArtifact>,
    pub failed: Vec<FailedArtifact>,
    pub manifest_published: bool,
}

impl SyncReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            manifest_published: false,
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Whether per-artifact failures should fail the run under `policy`.
    pub fn exit_policy_violated(&self, policy: PartialFailurePolicy) -> bool {
        policy == PartialFailurePolicy::Fail && self.has_failures()
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to publish catalog.json: {reason}")]
    ManifestPublishFailed {
        reason: String,
        report: Box<SyncReport>,
    },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ManifestPublishFailed
    }

    pub fn report(&self) -> &SyncReport {
        match self {
            SyncError::ManifestPublishFailed { report, .. } => report,
        }
    }
}

type Outcome = Result<(UploadedArtifact, ModelEntry), FailedArtifact>;

pub struct Synchronizer {
    resolver: Resolver,
    store: Arc<dyn ContentStore>,
    publisher: String,
    catalog_version: String,
    public_base_url: Option<String>,
    concurrency: usize,
}

impl Synchronizer {
    pub fn new(resolver: Resolver, store: Arc<dyn ContentStore>, config: &AppConfig) -> Self {
        Self {
            resolver,
            store,
            publisher: config.publisher.clone(),
            catalog_version: config.catalog_version.clone(),
            public_base_url: config.public_base_url.clone(),
            concurrency: config.concurrency.max(1),
        }
    }

    /// Upload every artifact in `registry` that resolves, then replace the catalog
    /// with one listing exactly those uploads.
    #[instrument(name = "sync", skip_all, fields(artifacts = registry.len()))]
    pub async fn sync(&self, registry: &Registry) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new();
        let mut builder = ManifestBuilder::new();
        info!(run_id = %report.run_id, "Synchronizing {} artifacts", registry.len());

        // Outcomes are consumed by this task alone, so manifest appends never race.
        let mut outcomes = stream::iter(registry.entries())
            .map(|descriptor| self.process(descriptor))
            .buffer_unordered(self.concurrency);

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok((uploaded, entry)) => {
                    builder.push(entry);
                    report.succeeded.push(uploaded);
                }
                Err(failed) => report.failed.push(failed),
            }
        }

        let manifest = builder.finish(&self.publisher, &self.catalog_version, Utc::now());
        match self.publish(&manifest).await {
            Ok(()) => {
                report.manifest_published = true;
                info!(
                    "Published {} with {} models ({} failed)",
                    MANIFEST_NAME,
                    manifest.models.len(),
                    report.failed.len()
                );
                Ok(report)
            }
            Err(reason) => {
                error!("Failed to publish {}: {}", MANIFEST_NAME, reason);
                Err(SyncError::ManifestPublishFailed {
                    reason,
                    report: Box::new(report),
                })
            }
        }
    }

    async fn process(&self, descriptor: &ArtifactDescriptor) -> Outcome {
        let failed = |kind: ErrorKind, message: String| {
            warn!("Skipping {}: {} ({})", descriptor.key, message, kind);
            FailedArtifact {
                key: descriptor.key.clone(),
                kind,
                message,
            }
        };

        let resolved = self
            .resolver
            .resolve(descriptor)
            .await
            .map_err(|e| failed(e.kind(), e.to_string()))?;

        let size_bytes = resolved.size_bytes;
        let sha256 = resolved.sha256.clone();

        self.store
            .put(&descriptor.canonical_name, resolved.content, ARTIFACT_CONTENT_TYPE)
            .await
            .map_err(|e: StoreError| failed(ErrorKind::StorePutFailed, e.to_string()))?;

        let download_path = self.store.download_path(&descriptor.canonical_name);
        info!("Uploaded {} as {} ({} bytes)", descriptor.key, download_path, size_bytes);

        let entry = ModelEntry::from_descriptor(descriptor, &self.publisher, size_bytes, self.public_url(&download_path));
        let uploaded = UploadedArtifact {
            key: descriptor.key.clone(),
            canonical_name: descriptor.canonical_name.clone(),
            size_bytes,
            sha256,
            download_path,
        };
        Ok((uploaded, entry))
    }

    async fn publish(&self, manifest: &CatalogManifest) -> Result<(), String> {
        let document = manifest.to_json().map_err(|e| e.to_string())?;
        self.store
            .put(MANIFEST_NAME, Bytes::from(document), MANIFEST_CONTENT_TYPE)
            .await
            .map_err(|e| e.to_string())
    }

    fn public_url(&self, download_path: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), download_path),
            None => download_path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, PackageFetcher};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use url::Url;

    struct StaticFetcher(HashMap<String, Bytes>);

    #[async_trait]
    impl PackageFetcher for StaticFetcher {
        async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError> {
            self.0
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| FetchError::Status { url: url.to_string(), status: 404 })
        }
    }

    /// In-memory store that can be told to reject particular names.
    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<HashMap<String, (Bytes, String)>>,
        reject: Vec<String>,
    }

    #[async_trait]
    impl ContentStore for MemoryStore {
        async fn put(&self, name: &str, content: Bytes, content_type: &str) -> Result<(), StoreError> {
            if self.reject.iter().any(|r| r == name) {
                return Err(StoreError::Timeout(name.to_string()));
            }
            self.objects
                .lock()
                .unwrap()
                .insert(name.to_string(), (content, content_type.to_string()));
            Ok(())
        }

        async fn get(&self, name: &str) -> Result<Bytes, StoreError> {
            self.objects
                .lock()
                .unwrap()
                .get(name)
                .map(|(content, _)| content.clone())
                .ok_or_else(|| StoreError::Timeout(name.to_string()))
        }

        async fn list(&self) -> Result<Vec<String>, StoreError> {
            let mut names: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
            names.sort();
            Ok(names)
        }

        fn download_path(&self, name: &str) -> String {
            format!("models/{}", name)
        }
    }

    fn descriptor(key: &str, name: &str) -> ArtifactDescriptor {
        ArtifactDescriptor {
            key: key.to_string(),
            source_locator: format!("http://host/{}", name),
            canonical_name: name.to_string(),
            capability_tag: "CPUExecutionProvider".to_string(),
            is_archive: false,
            display_name: "YOLOX".to_string(),
            version: "1.0".to_string(),
            license: "Apache-2.0".to_string(),
        }
    }

    fn synchronizer(store: Arc<MemoryStore>, scratch: &std::path::Path, config: &AppConfig) -> Synchronizer {
        let payloads = HashMap::from([
            ("http://host/a.onnx".to_string(), Bytes::from_static(b"aaaa")),
            ("http://host/b.onnx".to_string(), Bytes::from_static(b"bb")),
        ]);
        let resolver = Resolver::new(Arc::new(StaticFetcher(payloads)), scratch.to_path_buf());
        Synchronizer::new(resolver, store, config)
    }

    async fn published(store: &MemoryStore) -> CatalogManifest {
        CatalogManifest::from_json(&store.get(MANIFEST_NAME).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_put_failure_is_isolated() {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore {
            reject: vec!["a.onnx".to_string()],
            ..Default::default()
        });
        let registry = Registry::new(vec![descriptor("cpu", "a.onnx"), descriptor("vitis", "b.onnx")]).unwrap();

        let report = synchronizer(store.clone(), scratch.path(), &AppConfig::default())
            .sync(&registry)
            .await
            .unwrap();

        assert!(report.manifest_published);
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, "cpu");
        assert_eq!(report.failed[0].kind, ErrorKind::StorePutFailed);
        assert!(report.failed[0].message.contains("timed out"));

        let manifest = published(&store).await;
        assert_eq!(manifest.models.len(), 1);
        assert_eq!(manifest.models[0].id, "yolox-vitis");
    }

    #[tokio::test]
    async fn test_content_types() {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let registry = Registry::new(vec![descriptor("cpu", "a.onnx")]).unwrap();

        synchronizer(store.clone(), scratch.path(), &AppConfig::default())
            .sync(&registry)
            .await
            .unwrap();

        let objects = store.objects.lock().unwrap();
        assert_eq!(objects["a.onnx"].1, ARTIFACT_CONTENT_TYPE);
        assert_eq!(objects[MANIFEST_NAME].1, MANIFEST_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_manifest_publish_failure_is_terminal() {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore {
            reject: vec![MANIFEST_NAME.to_string()],
            ..Default::default()
        });
        let registry = Registry::new(vec![descriptor("cpu", "a.onnx")]).unwrap();

        let err = synchronizer(store.clone(), scratch.path(), &AppConfig::default())
            .sync(&registry)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ManifestPublishFailed);
        assert!(!err.report().manifest_published);
        assert_eq!(err.report().succeeded.len(), 1);
    }

    #[tokio::test]
    async fn test_public_base_url_prefixes_file_urls() {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let registry = Registry::new(vec![descriptor("cpu", "a.onnx")]).unwrap();
        let config = AppConfig {
            public_base_url: Some("https://cdn.example.com/".to_string()),
            publisher: "Contoso".to_string(),
            ..Default::default()
        };

        let report = synchronizer(store.clone(), scratch.path(), &config).sync(&registry).await.unwrap();
        let manifest = published(&store).await;

        assert_eq!(report.succeeded[0].download_path, "models/a.onnx");
        assert_eq!(manifest.publisher, "Contoso");
        assert_eq!(manifest.models[0].publisher, "Contoso");
        assert_eq!(manifest.models[0].files[0].url, "https://cdn.example.com/models/a.onnx");
        assert_eq!(manifest.models[0].files[0].size, 4);
    }

    #[tokio::test]
    async fn test_concurrent_sync_records_every_success() {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let registry = Registry::new(vec![
            descriptor("cpu", "a.onnx"),
            descriptor("vitis", "b.onnx"),
            descriptor("qnn", "missing.onnx"),
        ])
        .unwrap();
        let config = AppConfig {
            concurrency: 3,
            ..Default::default()
        };

        let report = synchronizer(store.clone(), scratch.path(), &config).sync(&registry).await.unwrap();
        let manifest = published(&store).await;

        let mut ids: Vec<_> = manifest.models.iter().map(|m| m.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["yolox-cpu", "yolox-vitis"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind, ErrorKind::FetchFailed);
        assert!(report.exit_policy_violated(PartialFailurePolicy::Fail));
        assert!(!report.exit_policy_violated(PartialFailurePolicy::Tolerate));
    }

    #[tokio::test]
    async fn test_report_json_uses_camel_case() {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let registry = Registry::new(vec![descriptor("cpu", "a.onnx"), descriptor("qnn", "missing.onnx")]).unwrap();

        let report = synchronizer(store, scratch.path(), &AppConfig::default())
            .sync(&registry)
            .await
            .unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["runId"], report.run_id.to_string());
        assert_eq!(json["manifestPublished"], true);
        assert_eq!(json["succeeded"][0]["canonicalName"], "a.onnx");
        assert_eq!(json["succeeded"][0]["sizeBytes"], 4);
        assert_eq!(json["failed"][0]["key"], "qnn");
        assert_eq!(json["failed"][0]["kind"], "fetchFailed");
    }
}
