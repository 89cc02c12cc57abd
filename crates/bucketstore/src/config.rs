//! Storage configuration with environment variable and file-based loading.
//!
//! Environment variables:
//! - `BUCKETSTORE_ROOT_VOLUME`: Directory holding one subdirectory per bucket
//! - `BUCKETSTORE_PROTECTED_DIR`: Name of the managed subtree inside each bucket
//! - `BUCKETSTORE_DIGEST_ALGORITHM`: `SHA-256`, `SHA-512` or `BLAKE3`
//!
//! Default root volume: `~/.bucketstore/data`

use std::env;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::digest::DigestAlgorithm;
use crate::error::StorageError;

/// Configuration for the disk storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory containing the buckets.
    /// Bucket `b` lives at `{root_volume}/b`, its managed tree at
    /// `{root_volume}/b/{protected_directory}`.
    pub root_volume: PathBuf,

    /// Name of the managed subtree inside every bucket.
    #[serde(default = "default_protected_directory")]
    pub protected_directory: String,

    /// Algorithm used for ingestion digests and the digest cache.
    #[serde(default)]
    pub digest_algorithm: DigestAlgorithm,

    /// Buffer size for reading stored files back out and for hashing them.
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// Bounded capacity of each ingestion sink channel, in chunks.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_protected_directory() -> String {
    "managed".to_string()
}

fn default_read_chunk_size() -> usize {
    64 * 1024
}

fn default_channel_capacity() -> usize {
    16
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::with_root_volume(default_root_volume())
    }
}

/// Get the default root volume (~/.bucketstore/data).
fn default_root_volume() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".bucketstore").join("data"))
        .unwrap_or_else(|| PathBuf::from(".bucketstore/data"))
}

impl StorageConfig {
    /// Create a config with a specific root volume and defaults elsewhere.
    pub fn with_root_volume(path: impl Into<PathBuf>) -> Self {
        Self {
            root_volume: path.into(),
            protected_directory: default_protected_directory(),
            digest_algorithm: DigestAlgorithm::default(),
            read_chunk_size: default_read_chunk_size(),
            channel_capacity: default_channel_capacity(),
        }
    }

    pub fn protected_directory(mut self, name: impl Into<String>) -> Self {
        self.protected_directory = name.into();
        self
    }

    pub fn digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let root_volume = env::var("BUCKETSTORE_ROOT_VOLUME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_root_volume());

        let mut config = Self::with_root_volume(root_volume);

        if let Ok(name) = env::var("BUCKETSTORE_PROTECTED_DIR") {
            config.protected_directory = name;
        }

        if let Ok(algorithm) = env::var("BUCKETSTORE_DIGEST_ALGORITHM") {
            config.digest_algorithm = algorithm
                .parse()
                .context("invalid BUCKETSTORE_DIGEST_ALGORITHM")?;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to environment.
    ///
    /// The file should contain a `[storage]` section:
    /// ```toml
    /// [storage]
    /// root_volume = "/data"
    /// protected_directory = "managed"
    /// digest_algorithm = "SHA-256"
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let table: toml::Table = contents
            .parse()
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;

        if let Some(section) = table.get("storage") {
            let config: StorageConfig = section
                .clone()
                .try_into()
                .context("failed to parse [storage] section")?;
            Ok(config)
        } else {
            Self::from_env()
        }
    }

    /// Reject settings the engine cannot run with.
    ///
    /// The protected directory must be a single plain path component, otherwise
    /// the "managed tree sits exactly two levels below the root" rule breaks.
    pub fn validate(&self) -> Result<(), StorageError> {
        let mut components = Path::new(&self.protected_directory).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => {
                return Err(StorageError::Config(format!(
                    "protected_directory must be a single directory name, got {:?}",
                    self.protected_directory
                )))
            }
        }
        if self.read_chunk_size == 0 || self.channel_capacity == 0 {
            return Err(StorageError::Config(
                "read_chunk_size and channel_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
