//! Crash-safe recompression of a finished day-file.
//!
//! The transaction moves through
//! `Start -> Backup -> Transform -> Commit -> Cleanup -> Done`.
//! Between any two steps at least one complete copy of the source data is
//! on disk: the source itself until commit, the backup alongside it, and the
//! committed replacement afterwards.

use crate::dayfile::{sibling_path, DayFile};
use crate::error::{Result, StoreError};
use std::fs::{self, FileTimes, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Deflate level used for packed columns.
pub const COMPRESSION_LEVEL: u32 = 4;

/// Next step of a compaction transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Start,
    Backup,
    Transform,
    Commit,
    Cleanup,
    Done,
}

/// Summary of a committed compaction.
#[derive(Clone, Debug, PartialEq)]
pub struct CompactionReport {
    pub source: PathBuf,
    pub original_bytes: u64,
    pub compacted_bytes: u64,
    pub series: usize,
    pub points: usize,
    pub elapsed: Duration,
    /// The backup could not be removed and is still on disk.
    pub backup_retained: bool,
}

impl CompactionReport {
    /// Size reduction in percent.
    pub fn reduction_percent(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        100.0 * (1.0 - self.compacted_bytes as f64 / self.original_bytes as f64)
    }
}

/// How a compaction transaction ended.
#[derive(Clone, Debug, PartialEq)]
pub enum CompactionOutcome {
    /// Nothing to compact.
    NoSource { source: PathBuf },

    /// Source replaced by its compacted copy.
    Compacted(CompactionReport),

    /// Backup could not be written. Source untouched.
    BackupFailed { source: PathBuf, error: String },

    /// Compacted copy could not be produced. Source and backup untouched.
    TransformFailed {
        source: PathBuf,
        backup: PathBuf,
        error: String,
    },

    /// Compacted copy could not be moved over the source. Source, backup
    /// and temp file are left in place for manual recovery.
    CommitFailed {
        source: PathBuf,
        backup: PathBuf,
        temp: PathBuf,
        error: String,
    },
}

impl CompactionOutcome {
    /// Whether an operator has to look at the leftover files.
    pub fn needs_operator(&self) -> bool {
        matches!(self, CompactionOutcome::CommitFailed { .. })
    }
}

/// Result of a single [`CompactionTxn::step`].
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Moved on to the given phase.
    Advanced(Phase),
    /// The transaction is over.
    Finished(CompactionOutcome),
}

/// A compaction transaction over one day-file.
#[derive(Debug)]
pub struct CompactionTxn {
    source: PathBuf,
    backup: PathBuf,
    temp: PathBuf,
    level: u32,
    phase: Phase,
    started: Instant,
    original_bytes: u64,
    compacted_bytes: u64,
    series: usize,
    points: usize,
    outcome: Option<CompactionOutcome>,
}

impl CompactionTxn {
    /// Prepare a transaction for `source`. Nothing is touched until the
    /// first step.
    pub fn new(source: impl AsRef<Path>) -> Self {
        let source = source.as_ref().to_path_buf();
        Self {
            backup: sibling_path(&source, ".bak"),
            temp: sibling_path(&source, ".tmp"),
            source,
            level: COMPRESSION_LEVEL,
            phase: Phase::Start,
            started: Instant::now(),
            original_bytes: 0,
            compacted_bytes: 0,
            series: 0,
            points: 0,
            outcome: None,
        }
    }

    /// Override the deflate level (0-9).
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn source_path(&self) -> &Path {
        &self.source
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Run the transaction to completion.
    pub fn run(mut self) -> CompactionOutcome {
        loop {
            if let Step::Finished(outcome) = self.step() {
                return outcome;
            }
        }
    }

    /// Execute the current phase.
    pub fn step(&mut self) -> Step {
        if let Some(outcome) = &self.outcome {
            return Step::Finished(outcome.clone());
        }

        match self.phase {
            Phase::Start => self.start(),
            Phase::Backup => self.backup(),
            Phase::Transform => self.transform(),
            Phase::Commit => self.commit(),
            Phase::Cleanup => self.cleanup(),
            // Only reachable with an outcome recorded
            Phase::Done => self.finish(self.report()),
        }
    }

    fn start(&mut self) -> Step {
        if !self.source.exists() {
            warn!(source = %self.source.display(), "No day-file to compact");
            return self.finish(CompactionOutcome::NoSource {
                source: self.source.clone(),
            });
        }

        info!(
            source = %self.source.display(),
            backup = %self.backup.display(),
            temp = %self.temp.display(),
            level = self.level,
            "Starting day-file compaction"
        );
        self.started = Instant::now();
        self.advance(Phase::Backup)
    }

    fn backup(&mut self) -> Step {
        match copy_preserving(&self.source, &self.backup) {
            Ok(bytes) => {
                self.original_bytes = bytes;
                self.advance(Phase::Transform)
            }
            Err(e) => {
                error!(
                    source = %self.source.display(),
                    backup = %self.backup.display(),
                    error = %e,
                    "Could not create backup, compaction aborted"
                );
                // A partial copy must not pass for a backup
                if self.backup.is_file() {
                    if let Err(rm) = fs::remove_file(&self.backup) {
                        warn!(
                            backup = %self.backup.display(),
                            error = %rm,
                            "Could not remove partial backup"
                        );
                    }
                }
                self.finish(CompactionOutcome::BackupFailed {
                    source: self.source.clone(),
                    error: e.to_string(),
                })
            }
        }
    }

    fn transform(&mut self) -> Step {
        match self.write_compacted() {
            Ok(()) => {
                info!(
                    elapsed_secs = self.started.elapsed().as_secs_f64(),
                    original_mb = mb(self.original_bytes),
                    compacted_mb = mb(self.compacted_bytes),
                    "Compaction written"
                );
                self.advance(Phase::Commit)
            }
            Err(e) => {
                if self.temp.exists() {
                    if let Err(rm) = fs::remove_file(&self.temp) {
                        warn!(temp = %self.temp.display(), error = %rm, "Could not remove temp file");
                    }
                }
                warn!(
                    source = %self.source.display(),
                    backup = %self.backup.display(),
                    error = %e,
                    "Compaction failed, original and backup kept"
                );
                self.finish(CompactionOutcome::TransformFailed {
                    source: self.source.clone(),
                    backup: self.backup.clone(),
                    error: e.to_string(),
                })
            }
        }
    }

    fn commit(&mut self) -> Step {
        match fs::rename(&self.temp, &self.source) {
            Ok(()) => {
                info!(source = %self.source.display(), "Original replaced by compacted copy");
                self.advance(Phase::Cleanup)
            }
            Err(e) => {
                error!(
                    source = %self.source.display(),
                    backup = %self.backup.display(),
                    temp = %self.temp.display(),
                    error = %e,
                    "Could not replace original with compacted copy; manual recovery needed"
                );
                self.finish(CompactionOutcome::CommitFailed {
                    source: self.source.clone(),
                    backup: self.backup.clone(),
                    temp: self.temp.clone(),
                    error: e.to_string(),
                })
            }
        }
    }

    fn cleanup(&mut self) -> Step {
        let backup_retained = match fs::remove_file(&self.backup) {
            Ok(()) => false,
            Err(e) => {
                warn!(backup = %self.backup.display(), error = %e, "Could not remove backup");
                true
            }
        };

        let outcome = self.report();
        let outcome = match outcome {
            CompactionOutcome::Compacted(mut report) => {
                report.backup_retained = backup_retained;
                info!(
                    source = %report.source.display(),
                    series = report.series,
                    points = report.points,
                    reduction_percent = report.reduction_percent(),
                    "Day-file compaction finished"
                );
                CompactionOutcome::Compacted(report)
            }
            other => other,
        };
        self.finish(outcome)
    }

    /// Replay the source and write it packed into the temp file, then check
    /// the temp file replays to the same tree.
    fn write_compacted(&mut self) -> Result<()> {
        let namespace = DayFile::read(&self.source)?;
        self.series = namespace.series_count();
        self.points = namespace.point_count();

        self.compacted_bytes = DayFile::write_packed(&self.temp, &namespace, self.level)?;

        let check = DayFile::read(&self.temp)?;
        if check != namespace {
            return Err(StoreError::Corruption(format!(
                "compacted copy {} does not match its source",
                self.temp.display()
            )));
        }
        Ok(())
    }

    fn report(&self) -> CompactionOutcome {
        CompactionOutcome::Compacted(CompactionReport {
            source: self.source.clone(),
            original_bytes: self.original_bytes,
            compacted_bytes: self.compacted_bytes,
            series: self.series,
            points: self.points,
            elapsed: self.started.elapsed(),
            backup_retained: false,
        })
    }

    fn advance(&mut self, phase: Phase) -> Step {
        self.phase = phase;
        Step::Advanced(phase)
    }

    fn finish(&mut self, outcome: CompactionOutcome) -> Step {
        self.phase = Phase::Done;
        self.outcome = Some(outcome.clone());
        Step::Finished(outcome)
    }
}

/// Copy `src` to `dst`, keeping permissions and access/modification times.
fn copy_preserving(src: &Path, dst: &Path) -> std::io::Result<u64> {
    let bytes = fs::copy(src, dst)?;
    let meta = fs::metadata(src)?;
    let times = FileTimes::new()
        .set_accessed(meta.accessed()?)
        .set_modified(meta.modified()?);
    let target = OpenOptions::new().write(true).open(dst)?;
    target.set_times(times)?;
    target.sync_all()?;
    Ok(bytes)
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
