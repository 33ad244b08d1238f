//! Store configuration.

use crate::lock::{MAX_LOCK_TTL_SECONDS, MIN_LOCK_TTL_SECONDS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What `load_network` does with a variant the project never declared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownVariantPolicy {
    /// Proceed as a base-only read.
    #[default]
    TreatAsBase,
    /// Fail with `NotFound`.
    Reject,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the JSONL backend.
    pub data_dir: PathBuf,
    /// Project lock expiry; `0` disables expiry.
    pub lock_ttl_seconds: i64,
    /// Attempts for addition index and net id allocation.
    pub addition_retry_budget: u32,
    pub unknown_variant: UnknownVariantPolicy,
    /// Default timeseries collection name.
    pub timeseries_collection: String,
    /// Database holding the cross-project timeseries collections.
    pub global_database: String,
    /// Upgrade old project layouts when a project is opened.
    pub auto_upgrade_projects: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".gridhub"),
            lock_ttl_seconds: crate::lock::DEFAULT_LOCK_TTL_SECONDS,
            addition_retry_budget: 8,
            unknown_variant: UnknownVariantPolicy::TreatAsBase,
            timeseries_collection: "timeseries".to_string(),
            global_database: "global_data".to_string(),
            auto_upgrade_projects: true,
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Like [`StoreConfig::load`], but a missing file yields the defaults.
    pub fn load_optional(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "config file absent, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_ttl_seconds != 0
            && !(MIN_LOCK_TTL_SECONDS..=MAX_LOCK_TTL_SECONDS).contains(&self.lock_ttl_seconds)
        {
            return Err(ConfigError::Invalid(format!(
                "lock_ttl_seconds must be 0 or in range [{MIN_LOCK_TTL_SECONDS}, {MAX_LOCK_TTL_SECONDS}] (got {})",
                self.lock_ttl_seconds
            )));
        }
        if self.addition_retry_budget == 0 {
            return Err(ConfigError::Invalid(
                "addition_retry_budget must be at least 1".to_string(),
            ));
        }
        if self.timeseries_collection.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "timeseries_collection must not be empty".to_string(),
            ));
        }
        if self.global_database.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "global_database must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
