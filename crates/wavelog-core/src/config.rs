//! Logger configuration loaded from TOML.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sample::StreamType;

/// Schema version the current build writes.
pub const SCHEMA_VERSION: u32 = 1;

/// Database file name inside the data directory.
pub const DATABASE_NAME: &str = "wave_logger.db";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level logger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Key presented to the provider with every request.
    pub api_key: String,
    pub store: StoreConfig,
    pub export: ExportConfig,
    /// Registry of provider stream ids this logger knows how to store.
    pub streams: Vec<StreamBinding>,
}

/// Sample store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub schema_version: u32,
    /// Rows fetched per page by a scan.
    pub scan_page_size: u32,
}

/// Export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory bundles are created in.
    pub directory: PathBuf,
}

/// Maps a provider stream id to the table its samples go to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBinding {
    pub id: String,
    pub stream_type: StreamType,
}

impl StreamBinding {
    #[must_use]
    pub fn new(id: impl Into<String>, stream_type: StreamType) -> Self {
        Self {
            id: id.into(),
            stream_type,
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            api_key: "wavelog".to_string(),
            store: StoreConfig::default(),
            export: ExportConfig::default(),
            streams: vec![
                StreamBinding::new("accel", StreamType::Accel),
                StreamBinding::new("location", StreamType::Location),
            ],
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join("wavelog").join(DATABASE_NAME),
            schema_version: SCHEMA_VERSION,
            scan_page_size: 256,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        let base = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            directory: base.join("wavelog-exports"),
        }
    }
}

impl LoggerConfig {
    /// Load and validate a config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate config text. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML or fails validation.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("api_key must not be empty".into()));
        }
        if self.store.scan_page_size == 0 {
            return Err(ConfigError::Invalid("store.scan_page_size must be positive".into()));
        }
        if self.store.schema_version == 0 {
            return Err(ConfigError::Invalid("store.schema_version must be positive".into()));
        }
        let mut seen = HashSet::new();
        for binding in &self.streams {
            if binding.id.trim().is_empty() {
                return Err(ConfigError::Invalid("stream id must not be empty".into()));
            }
            if !seen.insert(binding.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "stream id '{}' registered twice",
                    binding.id
                )));
            }
        }
        Ok(())
    }

    /// Stream type registered for `stream_id`.
    #[must_use]
    pub fn stream_type_of(&self, stream_id: &str) -> Option<StreamType> {
        self.streams
            .iter()
            .find(|b| b.id == stream_id)
            .map(|b| b.stream_type)
    }
}
