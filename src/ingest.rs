//! Ingest engine: change detection over a batch of state records.

use crate::cache::LastValueCache;
use crate::config::Config;
use crate::dayfile::{day_file_path, DayFile};
use crate::error::Result;
use crate::types::{IngestStats, SeriesId, StateRecord, Timestamp};
use chrono::{DateTime, Local, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Appends changed values of a batch to the current day-file.
#[derive(Clone, Debug)]
pub struct Ingestor {
    /// Directory day-files are written to.
    output_dir: PathBuf,

    /// Last-value cache shared by all runs.
    cache: LastValueCache,
}

impl Ingestor {
    pub fn new(output_dir: impl AsRef<Path>, cache_path: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            cache: LastValueCache::new(cache_path),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.output_path_prefix, &config.last_values_path)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn cache(&self) -> &LastValueCache {
        &self.cache
    }

    /// Ingest a batch at the current time.
    pub fn ingest(&self, records: &[StateRecord]) -> Result<IngestStats> {
        self.ingest_at(records, Local::now())
    }

    /// Ingest a batch as of `now`.
    ///
    /// `now` selects the day-file (by local date) and provides the single
    /// timestamp shared by every point appended in this run. A record is
    /// skipped when its raw value equals the cached last value of its
    /// series. The cache is persisted once, after the batch; a failure to
    /// persist it is logged and does not fail the batch.
    pub fn ingest_at(&self, records: &[StateRecord], now: DateTime<Local>) -> Result<IngestStats> {
        let file_path = day_file_path(&self.output_dir, now.date_naive());
        let mut stats = IngestStats {
            file_path: file_path.clone(),
            ..Default::default()
        };

        if records.is_empty() {
            return Ok(stats);
        }

        if let Some(dir) = file_path.parent() {
            if let Err(e) = fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "Could not create output directory");
            }
        }

        let mut last_values = self.cache.load();
        let timestamp = Timestamp::from_utc(now.with_timezone(&Utc));
        let mut day = DayFile::open(&file_path)?;

        for record in records {
            let Some(series_id) = SeriesId::new(record.entity_id.as_str()) else {
                debug!("Ignoring record without entity_id");
                continue;
            };

            if last_values.get(series_id.as_str()) == Some(&record.state) {
                stats.skipped_points += 1;
                continue;
            }

            let handle = day.ensure_series(&series_id, &record.attributes)?;
            let stored = day.append(handle, &timestamp, &record.state)?;
            debug!(series = %series_id, value = %stored, "Appended point");

            last_values.insert(series_id.as_str().to_string(), record.state.clone());
            stats.appended_points += 1;
        }

        day.close()?;
        self.cache.save(&last_values);

        info!(
            file = %file_path.display(),
            appended = stats.appended_points,
            skipped = stats.skipped_points,
            "Ingest batch complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ingestor(dir: &TempDir) -> Ingestor {
        Ingestor::new(dir.path().join("out"), dir.path().join("last_values.json"))
    }

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 15, h, m, 0).unwrap()
    }

    #[test]
    fn test_empty_batch_does_no_io() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);

        let stats = ingestor.ingest_at(&[], at(12, 0)).unwrap();
        assert_eq!(stats.appended_points, 0);
        assert_eq!(stats.skipped_points, 0);
        assert!(!dir.path().join("out").exists());
        assert!(!ingestor.cache().path().exists());
    }

    #[test]
    fn test_records_without_id_are_ignored() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);

        let stats = ingestor
            .ingest_at(&[StateRecord::new("", "1")], at(12, 0))
            .unwrap();
        assert_eq!(stats.appended_points, 0);
        assert_eq!(stats.skipped_points, 0);
    }

    #[test]
    fn test_batch_shares_one_timestamp() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);

        let stats = ingestor
            .ingest_at(
                &[
                    StateRecord::new("sensor.a", "1"),
                    StateRecord::new("sensor.b", "2"),
                ],
                at(12, 0),
            )
            .unwrap();

        let ns = DayFile::read(&stats.file_path).unwrap();
        let a = &ns.series("sensor.a").unwrap().timestamps()[0];
        let b = &ns.series("sensor.b").unwrap().timestamps()[0];
        assert_eq!(a, b);
        assert_eq!(a, &Timestamp::from_utc(at(12, 0).with_timezone(&Utc)));
    }

    #[test]
    fn test_locked_day_file_fails_batch_without_touching_cache() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);

        let path = day_file_path(ingestor.output_dir(), at(12, 0).date_naive());
        fs::create_dir_all(ingestor.output_dir()).unwrap();
        let held = DayFile::open(&path).unwrap();

        let result = ingestor.ingest_at(&[StateRecord::new("sensor.a", "1")], at(12, 0));
        assert!(result.is_err());
        assert!(!ingestor.cache().path().exists());
        held.close().unwrap();
    }
}
