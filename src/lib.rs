//! # Datalogger
//!
//! Records the state history of home-automation entities into one
//! append-only day-file per local calendar day, and compacts finished
//! day-files once a day.
//!
//! ## Core Concepts
//!
//! - **Ingest**: A batch of state records is compared against the
//!   last-value cache; only changed values are appended
//! - **Day-files**: Framed, checksummed files holding a `domain/entity_id`
//!   tree of timestamped series
//! - **Compaction**: Backup, transform, commit and cleanup of yesterday's
//!   file, never losing the only copy
//!
//! ## Example
//!
//! ```ignore
//! use datalogger::{Config, Ingestor, StateRecord};
//!
//! let config = Config::load_or_default("/data/options.json");
//! let ingestor = Ingestor::from_config(&config);
//!
//! let stats = ingestor.ingest(&[
//!     StateRecord::new("sensor.temp", "21.5").with_attribute("unit_of_measurement", "°C"),
//! ])?;
//! println!("{} appended, {} skipped", stats.appended_points, stats.skipped_points);
//! ```

pub mod cache;
pub mod compaction;
pub mod config;
pub mod dayfile;
pub mod error;
pub mod ingest;
pub mod types;

// Re-exports
pub use cache::{LastValueCache, LastValues};
pub use compaction::{
    poll_once, run_forever, CompactionOutcome, CompactionReport, CompactionTxn, CompactorState,
    Phase, Poll, Step, TriggerTime,
};
pub use config::Config;
pub use dayfile::{day_file_name, day_file_path, DayFile, Namespace, Series, SeriesHandle};
pub use error::{Result, StoreError};
pub use ingest::Ingestor;
pub use types::*;
