//! Daily compaction of finished day-files.
//!
//! A [`CompactionTxn`] rewrites one day-file as packed, deflated columns
//! without ever leaving the data without a complete copy on disk. The
//! scheduler runs one transaction per day, for the previous date, at the
//! configured trigger minute.

mod scheduler;
mod transaction;

pub use scheduler::{
    poll_once, run_forever, CompactorState, Poll, TriggerTime, AFTER_TRIGGER_INTERVAL,
    IDLE_INTERVAL,
};
pub use transaction::{
    CompactionOutcome, CompactionReport, CompactionTxn, Phase, Step, COMPRESSION_LEVEL,
};
