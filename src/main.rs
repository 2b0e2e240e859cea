use anyhow::{bail, Context};
use chrono::{Days, Local, NaiveDate};
use clap::{Parser, Subcommand};
use datalogger::config::DEFAULT_OPTIONS_PATH;
use datalogger::{
    day_file_path, run_forever, CompactionOutcome, CompactionTxn, CompactorState, Config,
    DayFile, Ingestor, StateRecord,
};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "datalogger")]
#[command(about = "Log home-automation entity states into daily files")]
#[command(version)]
struct Cli {
    /// Options file
    #[arg(long, global = true, env = "DATALOGGER_OPTIONS", default_value = DEFAULT_OPTIONS_PATH)]
    options: PathBuf,

    /// Directory for day-files (overrides the options file)
    #[arg(long, global = true, env = "DATALOGGER_OUTPUT_PREFIX")]
    output_prefix: Option<PathBuf>,

    /// Local HH:MM compaction time (overrides the options file)
    #[arg(long, global = true, env = "DATALOGGER_COMPRESS_TIME")]
    compress_time: Option<String>,

    /// Last-value cache path (overrides the options file)
    #[arg(long, global = true, env = "DATALOGGER_LAST_VALUES")]
    last_values: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append changed states from a JSON array to today's day-file
    Ingest {
        /// JSON file with state records, `-` for stdin
        #[arg(long, default_value = "-")]
        states: String,
    },

    /// Compact the day-file of one date
    Compact {
        /// Date to compact (default: yesterday)
        #[arg(long)]
        date: Option<String>,
    },

    /// Run the daily compaction loop
    Compactor,

    /// Print a per-series summary of a day-file
    Inspect {
        /// Day-file path
        path: PathBuf,
    },
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::load_or_default(&self.options);
        if let Some(prefix) = &self.output_prefix {
            config.output_path_prefix = prefix.clone();
        }
        if let Some(time) = &self.compress_time {
            config.compress_time = time.trim().to_string();
        }
        if let Some(path) = &self.last_values {
            config.last_values_path = path.clone();
        }
        config
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn read_states(source: &str) -> anyhow::Result<Vec<StateRecord>> {
    let mut raw = String::new();
    if source == "-" {
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read states from stdin")?;
    } else {
        raw = fs::read_to_string(source)
            .with_context(|| format!("Failed to read states from {}", source))?;
    }
    serde_json::from_str(&raw).context("States must be a JSON array of state records")
}

fn ingest(config: &Config, states: &str) -> anyhow::Result<()> {
    let records = read_states(states)?;
    let stats = Ingestor::from_config(config).ingest(&records)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn compact(config: &Config, date: Option<&str>) -> anyhow::Result<()> {
    let date = match date {
        Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", d))?,
        None => Local::now()
            .date_naive()
            .checked_sub_days(Days::new(1))
            .context("No previous date")?,
    };

    let source = day_file_path(&config.output_path_prefix, date);
    match CompactionTxn::new(&source).run() {
        CompactionOutcome::NoSource { .. } => {
            info!(source = %source.display(), "Nothing to compact");
            Ok(())
        }
        CompactionOutcome::Compacted(report) => {
            println!(
                "{}: {} series, {} points, {} -> {} bytes ({:.1}% smaller)",
                report.source.display(),
                report.series,
                report.points,
                report.original_bytes,
                report.compacted_bytes,
                report.reduction_percent()
            );
            Ok(())
        }
        CompactionOutcome::BackupFailed { error, .. } => bail!("Backup failed: {}", error),
        CompactionOutcome::TransformFailed { error, .. } => bail!("Compaction failed: {}", error),
        CompactionOutcome::CommitFailed {
            backup, temp, error, ..
        } => bail!(
            "Commit failed: {} (backup {}, compacted copy {})",
            error,
            backup.display(),
            temp.display()
        ),
    }
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let namespace = DayFile::read(path)?;
    println!(
        "{}: {} series, {} points",
        path.display(),
        namespace.series_count(),
        namespace.point_count()
    );
    for (id, _, series) in namespace.series_nodes() {
        let last = match series.last() {
            Some((ts, value)) => format!("{} @ {}", value, ts),
            None => "-".to_string(),
        };
        println!(
            "  {:<48} {:?} {:>6}  {}",
            namespace.path_of(id)?,
            series.kind(),
            series.len(),
            last
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Ingest { states } => ingest(&cli.config(), states),
        Commands::Compact { date } => compact(&cli.config(), date.as_deref()),
        Commands::Compactor => {
            let mut state = CompactorState::default();
            run_forever(|| cli.config(), &mut state)
        }
        Commands::Inspect { path } => inspect(path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            ExitCode::FAILURE
        }
    }
}
