//! Day-file series store.
//!
//! One file per local calendar day holds every series written that day,
//! grouped as `domain/entity_id` in a namespace tree. Files only grow while
//! they are current; compaction later rewrites them as packed columns.

mod file;
pub mod format;
mod namespace;

pub use file::{DayFile, SeriesHandle};
pub use namespace::{Column, Namespace, Node, NodeId, Series};

use chrono::NaiveDate;
use std::path::{Path, PathBuf};

/// File name prefix of day-files.
pub const DAYFILE_PREFIX: &str = "datalogger_";

/// File extension of day-files.
pub const DAYFILE_EXTENSION: &str = "dlg";

/// File name of the day-file for `date` (`datalogger_2026-10-15.dlg`).
pub fn day_file_name(date: NaiveDate) -> String {
    format!(
        "{}{}.{}",
        DAYFILE_PREFIX,
        date.format("%Y-%m-%d"),
        DAYFILE_EXTENSION
    )
}

/// Full path of the day-file for `date` under `output_dir`.
pub fn day_file_path(output_dir: impl AsRef<Path>, date: NaiveDate) -> PathBuf {
    output_dir.as_ref().join(day_file_name(date))
}

/// Path with `suffix` appended to the file name (`x.dlg` -> `x.dlg.bak`).
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
