//! Logger configuration.

use crate::compaction::TriggerTime;
use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default location of the add-on options file.
pub const DEFAULT_OPTIONS_PATH: &str = "/data/options.json";

/// Default directory for day-files.
pub const DEFAULT_OUTPUT_PREFIX: &str = "/share/hdf5/";

/// Default compaction trigger time (local).
pub const DEFAULT_COMPRESS_TIME: &str = "02:00";

/// Default location of the last-value cache.
pub const DEFAULT_LAST_VALUES_PATH: &str = "/data/last_values.json";

/// Options consumed by the ingest engine and the compactor.
///
/// Unknown keys in the options file are ignored, missing keys take their
/// defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory day-files are written to.
    pub output_path_prefix: PathBuf,

    /// Local `HH:MM` at which yesterday's file is compacted.
    pub compress_time: String,

    /// Path of the last-value cache.
    pub last_values_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_path_prefix: PathBuf::from(DEFAULT_OUTPUT_PREFIX),
            compress_time: DEFAULT_COMPRESS_TIME.to_string(),
            last_values_path: PathBuf::from(DEFAULT_LAST_VALUES_PATH),
        }
    }
}

impl Config {
    /// Load options from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let config: Config = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(config.normalized())
    }

    /// Load options, falling back to defaults if the file is missing or
    /// malformed.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No options file, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable options file, using defaults");
                Self::default()
            }
        }
    }

    /// Parsed compaction trigger time.
    pub fn trigger_time(&self) -> Result<TriggerTime> {
        self.compress_time.parse()
    }

    // Blank strings count as unset.
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.output_path_prefix.as_os_str().is_empty() {
            self.output_path_prefix = defaults.output_path_prefix;
        }
        if self.compress_time.trim().is_empty() {
            self.compress_time = defaults.compress_time;
        } else {
            self.compress_time = self.compress_time.trim().to_string();
        }
        if self.last_values_path.as_os_str().is_empty() {
            self.last_values_path = defaults.last_values_path;
        }
        self
    }
}
