use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub publisher: String,
    pub catalog_version: String,
    pub timeout_secs: u64,
    pub concurrency: usize,
    pub partial_failure: PartialFailurePolicy,
    pub scratch_dir: Option<PathBuf>,
    pub public_base_url: Option<String>,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub container: String,
    pub fs_root: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub azblob_account: Option<String>,
    pub azblob_account_key: Option<String>,
    pub azblob_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
    Azblob,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Azblob => write!(f, "azblob"),
        }
    }
}

/// What a run that published its manifest but lost some artifacts should report.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PartialFailurePolicy {
    /// Per-artifact failures are reported but do not fail the run.
    #[default]
    Tolerate,
    /// Any per-artifact failure fails the run.
    Fail,
}

/// Values supplied on the command line. They take precedence over every other source.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub backend: Option<String>,
    pub store: Option<String>,
    pub container: Option<String>,
    pub publisher: Option<String>,
    pub concurrency: Option<usize>,
    pub strict: bool,
    pub public_base_url: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_with(&Overrides::default())
    }

    pub fn load_with(overrides: &Overrides) -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "dev".into());

        let mut builder = Config::builder()
            // Start with default values
            .set_default("publisher", "modeldepot")?
            .set_default("catalog_version", "1.0.0")?
            .set_default("timeout_secs", 300)?
            .set_default("concurrency", 1)?
            .set_default("partial_failure", "tolerate")?
            .set_default("storage.backend", "fs")?
            .set_default("storage.container", "models")?
            .set_default("storage.fs_root", "./data")?
            // Add configuration from files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false));

        if let Some(path) = &overrides.config_file {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        builder = builder
            // Add environment variables with prefix MODELDEPOT__
            .add_source(Environment::with_prefix("MODELDEPOT").prefix_separator("__").separator("__"))
            .set_override_option("storage.backend", overrides.backend.clone())?
            .set_override_option("storage.container", overrides.container.clone())?
            .set_override_option("publisher", overrides.publisher.clone())?
            .set_override_option("concurrency", overrides.concurrency.map(|n| n as u64))?
            .set_override_option("public_base_url", overrides.public_base_url.clone())?;

        if overrides.strict {
            builder = builder.set_override("partial_failure", "fail")?;
        }

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let mut app_config: Self = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        if let Some(store) = &overrides.store {
            app_config.storage.set_location(store);
        }

        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(AppError::Config("concurrency must be at least 1".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(AppError::Config("timeout_secs must be at least 1".to_string()));
        }
        if self.publisher.trim().is_empty() {
            return Err(AppError::Config("publisher must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

impl StorageConfig {
    /// Points the active backend at `store`: the fs root, the S3 bucket or the Azure account.
    pub fn set_location(&mut self, store: &str) {
        match self.backend {
            StorageBackend::Fs => self.fs_root = Some(Path::new(store).to_path_buf()),
            StorageBackend::S3 => self.s3_bucket = Some(store.to_string()),
            StorageBackend::Azblob => self.azblob_account = Some(store.to_string()),
        }
    }

    pub fn location(&self) -> Option<String> {
        match self.backend {
            StorageBackend::Fs => self.fs_root.as_ref().map(|p| p.display().to_string()),
            StorageBackend::S3 => self.s3_bucket.clone(),
            StorageBackend::Azblob => self.azblob_account.clone(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            publisher: "modeldepot".to_string(),
            catalog_version: "1.0.0".to_string(),
            timeout_secs: 300,
            concurrency: 1,
            partial_failure: PartialFailurePolicy::Tolerate,
            scratch_dir: None,
            public_base_url: None,
            storage: StorageConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            container: "models".to_string(),
            fs_root: Some(PathBuf::from("./data")),
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
            azblob_account: None,
            azblob_account_key: None,
            azblob_endpoint: None,
        }
    }
}
