use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, instrument, warn, Span};
use zip::ZipArchive;

use crate::error::ErrorKind;
use crate::fetch::{FetchError, PackageFetcher};
use crate::registry::ArtifactDescriptor;

/// Extension of the archive member holding the model
pub const MODEL_EXTENSION: &str = "onnx";

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Fetch failed: {0}")]
    FetchFailed(#[from] FetchError),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("No .{extension} member in archive (members: {members:?})")]
    MemberNotFound {
        extension: &'static str,
        members: Vec<String>,
    },
}

impl ResolutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolutionError::FetchFailed(_) => ErrorKind::FetchFailed,
            ResolutionError::CorruptArchive(_) => ErrorKind::CorruptArchive,
            ResolutionError::MemberNotFound { .. } => ErrorKind::MemberNotFound,
        }
    }
}

/// Artifact bytes ready for upload.
#[derive(Debug)]
pub struct ResolvedArtifact<'a> {
    pub descriptor: &'a ArtifactDescriptor,
    pub content: Bytes,
    pub size_bytes: u64,
    /// Hex encoded SHA-256 of `content`
    pub sha256: String,
}

impl<'a> ResolvedArtifact<'a> {
    fn new(descriptor: &'a ArtifactDescriptor, content: Bytes) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&content);
        Self {
            descriptor,
            size_bytes: content.len() as u64,
            sha256: hex::encode(hasher.finalize()),
            content,
        }
    }
}

pub struct Resolver {
    fetcher: Arc<dyn PackageFetcher>,
    scratch_root: PathBuf,
}

impl Resolver {
    pub fn new(fetcher: Arc<dyn PackageFetcher>, scratch_root: PathBuf) -> Self {
        Self { fetcher, scratch_root }
    }

    /// Fetch the descriptor's payload and, for archives, pull out the model member.
    #[instrument(name = "resolve", skip_all, fields(key = %descriptor.key))]
    pub async fn resolve<'a>(&self, descriptor: &'a ArtifactDescriptor) -> Result<ResolvedArtifact<'a>, ResolutionError> {
        let url = descriptor
            .locator()
            .map_err(|e| ResolutionError::FetchFailed(FetchError::UnsupportedScheme(e.to_string())))?;

        let payload = self.fetcher.fetch(&url).await?;
        debug!("Fetched {} bytes from {}", payload.len(), url);

        if !descriptor.is_archive {
            return Ok(ResolvedArtifact::new(descriptor, payload));
        }

        // Spilling and inflating block, so they run off the runtime workers.
        let scratch_root = self.scratch_root.clone();
        let key = descriptor.key.clone();
        let span = Span::current();
        let content = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            // Dropping the TempDir removes it, whichever way we leave this closure.
            let scratch = scratch_dir(&scratch_root, &key)?;
            extract_model(scratch.path(), &payload)
        })
        .await
        .map_err(|e| ResolutionError::CorruptArchive(format!("extraction task failed: {}", e)))??;

        Ok(ResolvedArtifact::new(descriptor, content))
    }
}

fn scratch_dir(root: &Path, key: &str) -> Result<TempDir, ResolutionError> {
    std::fs::create_dir_all(root)
        .and_then(|_| {
            tempfile::Builder::new()
                .prefix(&format!("modeldepot-{}-", key))
                .tempdir_in(root)
        })
        .map_err(|e| scratch_error(root, e))
}

/// Spill the archive into `scratch` and return the first member ending in `.onnx`.
fn extract_model(scratch: &Path, payload: &[u8]) -> Result<Bytes, ResolutionError> {
    let archive_path = scratch.join("payload.zip");
    std::fs::write(&archive_path, payload).map_err(|e| scratch_error(&archive_path, e))?;

    let file = File::open(&archive_path).map_err(|e| scratch_error(&archive_path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| ResolutionError::CorruptArchive(e.to_string()))?;

    let mut members = Vec::with_capacity(archive.len());
    let mut matches = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| ResolutionError::CorruptArchive(e.to_string()))?;
        let name = entry.name().to_string();
        if !entry.is_dir() && has_model_extension(&name) {
            matches.push(i);
        }
        members.push(name);
    }

    let Some(&first) = matches.first() else {
        return Err(ResolutionError::MemberNotFound {
            extension: MODEL_EXTENSION,
            members,
        });
    };

    if matches.len() > 1 {
        let ignored: Vec<&str> = matches[1..].iter().map(|&i| members[i].as_str()).collect();
        warn!("Archive has several .{} members, using {} and ignoring {:?}", MODEL_EXTENSION, members[first], ignored);
    }

    let mut entry = archive.by_index(first).map_err(|e| ResolutionError::CorruptArchive(e.to_string()))?;
    // The declared size comes from the archive itself, so it only checks what was read.
    let declared = entry.size();
    let mut content = Vec::new();
    io::copy(&mut entry, &mut content)
        .map_err(|e| ResolutionError::CorruptArchive(format!("{}: {}", members[first], e)))?;
    if content.len() as u64 != declared {
        return Err(ResolutionError::CorruptArchive(format!(
            "{}: declared {} bytes, inflated {}",
            members[first],
            declared,
            content.len()
        )));
    }

    debug!("Extracted {} ({} bytes)", members[first], content.len());
    Ok(Bytes::from(content))
}

fn has_model_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case(MODEL_EXTENSION))
        .unwrap_or(false)
}

fn scratch_error(path: &Path, source: io::Error) -> ResolutionError {
    ResolutionError::FetchFailed(FetchError::Io {
        path: path.display().to_string(),
        source,
    })
}
