use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::ArtifactDescriptor;

/// Schema version written into every catalog
pub const SCHEMA_VERSION: &str = "1.0";

/// Object name the catalog is published under
pub const MANIFEST_NAME: &str = "catalog.json";

/// Prefix for model ids derived from descriptor keys
pub const MODEL_ID_PREFIX: &str = "yolox-";

/// The catalog document clients read to discover published models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogManifest {
    pub schema_version: String,
    /// ISO-8601 UTC timestamp of manifest construction
    pub generated_at: String,
    pub publisher: String,
    pub version: String,
    /// One entry per uploaded artifact, in the order they were recorded
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    pub publisher: String,
    pub execution_providers: Vec<ExecutionProvider>,
    pub license: String,
    pub files: Vec<ModelFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProvider {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    pub name: String,
    pub url: String,
    pub size: u64,
}

/// Manifest under construction. Entries are appended as uploads succeed,
/// timestamp and publisher are fixed by [`ManifestBuilder::finish`].
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    models: Vec<ModelEntry>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ModelEntry) {
        self.models.push(entry);
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn finish(self, publisher: &str, version: &str, generated_at: DateTime<Utc>) -> CatalogManifest {
        CatalogManifest {
            schema_version: SCHEMA_VERSION.to_string(),
            generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            publisher: publisher.to_string(),
            version: version.to_string(),
            models: self.models,
        }
    }
}

pub fn model_id(key: &str) -> String {
    format!("{}{}", MODEL_ID_PREFIX, key)
}

impl ModelEntry {
    pub fn from_descriptor(descriptor: &ArtifactDescriptor, publisher: &str, size: u64, url: String) -> Self {
        Self {
            id: model_id(&descriptor.key),
            name: descriptor.display_name.clone(),
            version: descriptor.version.clone(),
            publisher: publisher.to_string(),
            execution_providers: vec![ExecutionProvider {
                name: descriptor.capability_tag.clone(),
            }],
            license: descriptor.license.clone(),
            files: vec![ModelFile {
                name: descriptor.canonical_name.clone(),
                url,
                size,
            }],
        }
    }
}

impl CatalogManifest {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}
