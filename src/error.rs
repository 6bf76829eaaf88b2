use std::fmt;

use config::ConfigError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StoreError),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Coarse classification of a per-artifact failure, as it appears in a sync report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    FetchFailed,
    CorruptArchive,
    MemberNotFound,
    StorePutFailed,
    ManifestPublishFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::FetchFailed => write!(f, "FetchFailed"),
            ErrorKind::CorruptArchive => write!(f, "CorruptArchive"),
            ErrorKind::MemberNotFound => write!(f, "MemberNotFound"),
            ErrorKind::StorePutFailed => write!(f, "StorePutFailed"),
            ErrorKind::ManifestPublishFailed => write!(f, "ManifestPublishFailed"),
        }
    }
}
