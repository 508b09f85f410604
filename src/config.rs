//! Configuration for the identity core and the ledger sink.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration.
//!
//! ```toml
//! [ingest]
//! contract_account = "polaris"
//! dedup_cache_capacity = 100000
//! workers = 4
//! queue_capacity = 1024
//!
//! [resolution]
//! max_hops = 128
//!
//! [storage]
//! event_log_path = "/var/lib/polaris/events.log"
//! sync_on_write = true
//! retarget_mode = "native"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PolarisResult};
use crate::ingest::{IngestRuntimeConfig, DEFAULT_CACHE_CAPACITY};
use crate::resolution::DEFAULT_MAX_HOPS;
use crate::storage::RetargetMode;

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolarisConfig {
    pub ingest: IngestConfig,
    pub resolution: ResolutionConfig,
    pub storage: StorageConfig,
}

impl PolarisConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// `ReadFile`, `Parse`, or `Invalid`.
    pub fn from_file(path: impl AsRef<Path>) -> PolarisResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::ReadFile)?;
        let config: Self = content.parse()?;
        tracing::info!(path = %path.as_ref().display(), "loaded config");
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    /// `Invalid` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolution.max_hops == 0 {
            return Err(ConfigError::Invalid("resolution.max_hops must be > 0".to_string()));
        }
        if self.ingest.workers == 0 {
            return Err(ConfigError::Invalid("ingest.workers must be > 0".to_string()));
        }
        if self.ingest.queue_capacity == 0 {
            return Err(ConfigError::Invalid("ingest.queue_capacity must be > 0".to_string()));
        }
        if self
            .storage
            .event_log_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err(ConfigError::Invalid("storage.event_log_path is empty".to_string()));
        }
        Ok(())
    }

    /// Worker pool settings for the ingest runtime.
    #[must_use]
    pub const fn runtime(&self) -> IngestRuntimeConfig {
        IngestRuntimeConfig {
            workers: self.ingest.workers,
            queue_capacity: self.ingest.queue_capacity,
        }
    }
}

impl FromStr for PolarisConfig {
    type Err = ConfigError;

    /// Parses and validates a TOML document.
    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }
}

/// Ingestion settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Only events from this contract are applied. Empty disables the filter.
    pub contract_account: String,
    /// Fast-path dedup cache size. Zero disables the cache.
    pub dedup_cache_capacity: usize,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let runtime = IngestRuntimeConfig::default();
        Self {
            contract_account: "polaris".to_string(),
            dedup_cache_capacity: DEFAULT_CACHE_CAPACITY,
            workers: runtime.workers,
            queue_capacity: runtime.queue_capacity,
        }
    }
}

/// Identity resolution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Bound on alias/mapping/tombstone hops.
    pub max_hops: usize,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// File-backed event log. In-memory when unset.
    pub event_log_path: Option<PathBuf>,
    /// fsync after every appended event.
    pub sync_on_write: bool,
    pub retarget_mode: RetargetMode,
}
