//! Exchange configuration.
//!
//! Every field has a default, so a partial TOML file (or none at all) yields a
//! working configuration:
//!
//! ```toml
//! [batch]
//! batch_size = 5
//! flush_interval_ms = 250
//!
//! [detector]
//! similarity_threshold = 0.9
//! antonym_pairs = [["stable", "flaky"]]
//!
//! [store]
//! data_dir = "/var/lib/kyroql-exchange"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::BatchConfig;
use crate::cache::CacheConfig;
use crate::conflict::{DetectorConfig, ResolverConfig};
use crate::engine::RouterConfig;
use crate::freshness::HalfLifeTable;
use crate::hub::HubConfig;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid-value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Store backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for the write-ahead log; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// fsync after every append.
    pub sync_on_write: bool,
    /// Bound on waiting for the store lock, in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            sync_on_write: true,
            lock_timeout_ms: 2000,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub listen_addr: String,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines.
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7700".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Publish validation and pipeline sizing.
    pub router: RouterConfig,
    /// Half-life table.
    pub freshness: HalfLifeTable,
    /// Batch flushing.
    pub batch: BatchConfig,
    /// Conflict detection.
    pub detector: DetectorConfig,
    /// Conflict resolution.
    pub resolver: ResolverConfig,
    /// Query cache.
    pub cache: CacheConfig,
    /// Notification hub.
    pub hub: HubConfig,
    /// Store backend.
    pub store: StoreConfig,
    /// HTTP server.
    pub server: ServerConfig,
}

impl ExchangeConfig {
    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reads the file if it exists, otherwise returns validated defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects nonsensical values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.router.validate()?;
        self.freshness.validate()?;
        self.batch.validate()?;
        self.detector.validate()?;
        self.resolver.validate()?;
        self.cache.validate()?;
        self.hub.validate()?;
        if self.store.lock_timeout_ms == 0 {
            return Err(ConfigError::invalid("store.lock_timeout_ms", "must be > 0"));
        }
        if self.server.listen_addr.trim().is_empty() {
            return Err(ConfigError::invalid("server.listen_addr", "must not be empty"));
        }
        Ok(())
    }
}
