//! Last-value cache.
//!
//! Maps each series identifier to the last raw value that was appended, so
//! unchanged values can be skipped. The cache is global: it is not reset
//! when a new day-file starts.

use crate::dayfile::sibling_path;
use crate::error::{Result, StoreError};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Series identifier -> last raw value.
pub type LastValues = BTreeMap<String, String>;

/// JSON file holding [`LastValues`].
#[derive(Clone, Debug)]
pub struct LastValueCache {
    /// Canonical cache path.
    path: PathBuf,
}

impl LastValueCache {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Canonical cache path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted map.
    ///
    /// Non-string values are stringified.
    pub fn read(&self) -> Result<LastValues> {
        let bytes = fs::read(&self.path)?;
        let raw: BTreeMap<String, JsonValue> = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;

        Ok(raw
            .into_iter()
            .map(|(k, v)| match v {
                JsonValue::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect())
    }

    /// Persist the full map through a temporary file and a rename.
    pub fn write(&self, values: &LastValues) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                debug!(dir = %parent.display(), error = %e, "Could not create cache directory");
            }
        }

        let tmp = sibling_path(&self.path, ".tmp");
        let result = Self::write_tmp(&tmp, values)
            .and_then(|()| fs::rename(&tmp, &self.path).map_err(StoreError::from));
        if result.is_err() && tmp.exists() {
            if let Err(e) = fs::remove_file(&tmp) {
                debug!(path = %tmp.display(), error = %e, "Could not remove cache temp file");
            }
        }
        result
    }

    fn write_tmp(tmp: &Path, values: &LastValues) -> Result<()> {
        let file = File::create(tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, values)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Load the map, falling back to an empty one on any failure.
    pub fn load(&self) -> LastValues {
        match self.read() {
            Ok(values) => values,
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No last-value cache yet");
                LastValues::new()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Discarding unreadable last-value cache");
                LastValues::new()
            }
        }
    }

    /// Persist the map, logging instead of failing. Returns whether it was
    /// written.
    pub fn save(&self, values: &LastValues) -> bool {
        match self.write(values) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    entries = values.len(),
                    error = %e,
                    "Failed to persist last-value cache"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let cache = LastValueCache::new(dir.path().join("last_values.json"));
        assert!(cache.load().is_empty());
        assert!(cache.read().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let cache = LastValueCache::new(dir.path().join("nested/last_values.json"));

        let mut values = LastValues::new();
        values.insert("sensor.temp".into(), "21.5".into());
        values.insert("light.kitchen".into(), "on".into());
        assert!(cache.save(&values));

        assert_eq!(cache.load(), values);
        assert!(!sibling_path(cache.path(), ".tmp").exists());
    }

    #[test]
    fn test_save_of_load_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let cache = LastValueCache::new(dir.path().join("last_values.json"));

        let mut values = LastValues::new();
        values.insert("z.last".into(), "1".into());
        values.insert("a.first".into(), "x \"quoted\"".into());
        cache.save(&values);
        let before = fs::read(cache.path()).unwrap();

        cache.save(&cache.load());
        let after = fs::read(cache.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_values.json");
        fs::write(&path, b"{\"sensor.temp\": \"21").unwrap();

        let cache = LastValueCache::new(&path);
        assert!(matches!(cache.read(), Err(StoreError::Deserialization(_))));
        assert!(cache.load().is_empty());

        fs::write(&path, b"[1, 2, 3]").unwrap();
        assert!(cache.load().is_empty());
    }

    #[test]
    fn test_non_string_values_are_stringified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_values.json");
        fs::write(&path, br#"{"sensor.temp": 21.5, "switch.x": true}"#).unwrap();

        let values = LastValueCache::new(&path).load();
        assert_eq!(values["sensor.temp"], "21.5");
        assert_eq!(values["switch.x"], "true");
    }

    #[test]
    fn test_failed_save_is_swallowed() {
        let dir = TempDir::new().unwrap();
        // The cache path is a directory, so the final rename fails
        let path = dir.path().join("last_values.json");
        fs::create_dir_all(path.join("occupied")).unwrap();

        let cache = LastValueCache::new(&path);
        let mut values = LastValues::new();
        values.insert("sensor.temp".into(), "1".into());
        assert!(!cache.save(&values));
        assert!(!sibling_path(&path, ".tmp").exists());
    }
}
