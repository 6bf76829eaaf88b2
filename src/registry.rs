use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Error type for registry construction
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Duplicate artifact key: {0}")]
    DuplicateKey(String),
    #[error("Duplicate canonical name: {0}")]
    DuplicateCanonicalName(String),
    #[error("Invalid source locator for {key}: {reason}")]
    InvalidLocator { key: String, reason: String },
    #[error("Empty field {field} in artifact {key}")]
    EmptyField { key: String, field: &'static str },
    #[error("Failed to read registry file {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Static description of one artifact: where to get it and what to call it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    /// Short identifier, unique within the registry
    pub key: String,
    /// Where the bytes are fetched from
    pub source_locator: String,
    /// Object name in the content store, stable across runs
    pub canonical_name: String,
    /// Execution provider the artifact targets; passed through to the manifest
    pub capability_tag: String,
    /// Whether the payload is a zip archive holding the model
    #[serde(default)]
    pub is_archive: bool,
    /// Human readable model name
    pub display_name: String,
    pub version: String,
    pub license: String,
}

impl ArtifactDescriptor {
    pub fn locator(&self) -> Result<Url, RegistryError> {
        Url::parse(&self.source_locator).map_err(|e| RegistryError::InvalidLocator {
            key: self.key.clone(),
            reason: e.to_string(),
        })
    }
}

struct BuiltinEntry {
    key: &'static str,
    source_locator: &'static str,
    canonical_name: &'static str,
    capability_tag: &'static str,
    is_archive: bool,
    display_name: &'static str,
}

const BUILTIN_VERSION: &str = "1.0";
const BUILTIN_LICENSE: &str = "Apache-2.0";

const BUILTIN: &[BuiltinEntry] = &[
    BuiltinEntry {
        key: "cpu",
        source_locator: "https://github.com/Megvii-BaseDetection/YOLOX/releases/download/0.1.1rc0/yolox_s.onnx",
        canonical_name: "yolox_s_cpu.onnx",
        capability_tag: "CPUExecutionProvider",
        is_archive: false,
        display_name: "YOLOX-S",
    },
    BuiltinEntry {
        key: "dml",
        source_locator: "https://github.com/Megvii-BaseDetection/YOLOX/releases/download/0.1.1rc0/yolox_m.onnx",
        canonical_name: "yolox_m_dml.onnx",
        capability_tag: "DmlExecutionProvider",
        is_archive: false,
        display_name: "YOLOX-M",
    },
    BuiltinEntry {
        key: "qnn",
        source_locator: "https://huggingface.co/qualcomm/Yolo-X/resolve/main/Yolo-X_w8a8.onnx.zip",
        canonical_name: "yolox_qnn_w8a8.onnx",
        capability_tag: "QNNExecutionProvider",
        is_archive: true,
        display_name: "YOLOX (W8A8)",
    },
    BuiltinEntry {
        key: "vitis",
        source_locator: "https://huggingface.co/amd/yolox-s/resolve/main/yolox-s-int8.onnx",
        canonical_name: "yolox_s_int8_vitis.onnx",
        capability_tag: "VitisAIExecutionProvider",
        is_archive: false,
        display_name: "YOLOX-S (INT8)",
    },
];

/// Ordered, immutable set of artifact descriptors used for one run.
#[derive(Debug, Clone)]
pub struct Registry {
    entries: Vec<ArtifactDescriptor>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    artifacts: Vec<ArtifactDescriptor>,
}

impl Registry {
    /// Build a registry, rejecting duplicate keys or names and malformed locators.
    pub fn new(entries: Vec<ArtifactDescriptor>) -> Result<Self, RegistryError> {
        let mut keys = HashSet::new();
        let mut names = HashSet::new();

        for entry in &entries {
            for (field, value) in [
                ("key", &entry.key),
                ("canonicalName", &entry.canonical_name),
                ("capabilityTag", &entry.capability_tag),
            ] {
                if value.trim().is_empty() {
                    return Err(RegistryError::EmptyField {
                        key: entry.key.clone(),
                        field,
                    });
                }
            }
            if !keys.insert(entry.key.as_str()) {
                return Err(RegistryError::DuplicateKey(entry.key.clone()));
            }
            if !names.insert(entry.canonical_name.as_str()) {
                return Err(RegistryError::DuplicateCanonicalName(entry.canonical_name.clone()));
            }
            entry.locator()?;
        }

        Ok(Self { entries })
    }

    /// The compiled-in YOLOX model table.
    pub fn builtin() -> Self {
        let entries = BUILTIN
            .iter()
            .map(|e| ArtifactDescriptor {
                key: e.key.to_string(),
                source_locator: e.source_locator.to_string(),
                canonical_name: e.canonical_name.to_string(),
                capability_tag: e.capability_tag.to_string(),
                is_archive: e.is_archive,
                display_name: e.display_name.to_string(),
                version: BUILTIN_VERSION.to_string(),
                license: BUILTIN_LICENSE.to_string(),
            })
            .collect();
        Self { entries }
    }

    /// Load a registry from a JSON or TOML file with a top-level `artifacts` list.
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let unreadable = |reason: String| RegistryError::Unreadable {
            path: path.display().to_string(),
            reason,
        };

        let content = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let file: RegistryFile = if is_toml {
            toml::from_str(&content).map_err(|e| unreadable(e.to_string()))?
        } else {
            serde_json::from_str(&content).map_err(|e| unreadable(e.to_string()))?
        };

        Self::new(file.artifacts)
    }

    pub fn entries(&self) -> &[ArtifactDescriptor] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ArtifactDescriptor> {
        self.entries.iter().find(|e| e.key == key)
    }
}
