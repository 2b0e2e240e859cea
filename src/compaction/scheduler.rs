//! Daily compaction scheduling.

use crate::compaction::transaction::{CompactionOutcome, CompactionTxn};
use crate::config::{Config, DEFAULT_COMPRESS_TIME};
use crate::dayfile::day_file_path;
use crate::error::{Result, StoreError};
use chrono::{Days, Local, NaiveDate, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll interval outside the trigger minute.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(20);

/// Poll interval after the trigger minute was handled.
pub const AFTER_TRIGGER_INTERVAL: Duration = Duration::from_secs(60);

// Must agree with DEFAULT_COMPRESS_TIME
const DEFAULT_TRIGGER: TriggerTime = TriggerTime { hour: 2, minute: 0 };

/// Local wall-clock minute at which compaction runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerTime {
    hour: u32,
    minute: u32,
}

impl TriggerTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    /// Whether `at` falls in the trigger minute.
    pub fn matches(&self, at: &NaiveDateTime) -> bool {
        at.hour() == self.hour && at.minute() == self.minute
    }
}

impl FromStr for TriggerTime {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StoreError::InvalidTriggerTime(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hour = h.parse().map_err(|_| invalid())?;
        let minute = m.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for TriggerTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// State carried by the compaction loop between polls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactorState {
    /// Last date a transaction was run for (whatever its outcome).
    pub last_processed: Option<NaiveDate>,
}

/// What a single poll did.
#[derive(Clone, Debug, PartialEq)]
pub enum Poll {
    /// Outside the trigger minute.
    Idle,
    /// Trigger minute, but the date was already processed.
    AlreadyDone(NaiveDate),
    /// A transaction ran for the date.
    Ran(NaiveDate, CompactionOutcome),
}

impl Poll {
    /// How long the loop sleeps after this poll.
    pub fn sleep_interval(&self) -> Duration {
        match self {
            Poll::Idle => IDLE_INTERVAL,
            Poll::AlreadyDone(_) | Poll::Ran(..) => AFTER_TRIGGER_INTERVAL,
        }
    }
}

/// Run one scheduling cycle at local time `now`.
///
/// In the trigger minute, compacts the day-file of the previous date unless
/// that date is already marked in `state`. The date is marked whatever the
/// outcome, so a failed transaction is not retried until the next day.
pub fn poll_once(config: &Config, state: &mut CompactorState, now: NaiveDateTime) -> Poll {
    let trigger = config.trigger_time().unwrap_or_else(|e| {
        warn!(error = %e, fallback = DEFAULT_COMPRESS_TIME, "Invalid compress_time");
        DEFAULT_TRIGGER
    });

    if !trigger.matches(&now) {
        return Poll::Idle;
    }

    let Some(target) = now.date().checked_sub_days(Days::new(1)) else {
        return Poll::Idle;
    };
    if state.last_processed == Some(target) {
        debug!(date = %target, "Day-file already processed");
        return Poll::AlreadyDone(target);
    }

    let source = day_file_path(&config.output_path_prefix, target);
    info!(date = %target, source = %source.display(), "Compaction triggered");
    let outcome = CompactionTxn::new(&source).run();
    state.last_processed = Some(target);
    Poll::Ran(target, outcome)
}

/// Run the compaction loop forever.
///
/// `load_config` is called before every poll so option changes are picked
/// up without a restart.
pub fn run_forever<F>(mut load_config: F, state: &mut CompactorState) -> !
where
    F: FnMut() -> Config,
{
    info!("Compactor loop started");
    loop {
        let config = load_config();
        let poll = poll_once(&config, state, Local::now().naive_local());
        std::thread::sleep(poll.sleep_interval());
    }
}
