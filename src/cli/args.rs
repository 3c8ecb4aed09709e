//! Command line argument parsing for nrtbench using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::ingest::IngestMode;

/// nrtbench - near-real-time ingestion, refresh and query benchmark
#[derive(Parser, Debug, Clone)]
#[command(name = "nrtbench")]
#[command(about = "Ingest, refresh and query a segment index at the same time")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct NrtbenchArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl NrtbenchArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Ingest, refresh and replay tasks for a fixed duration
    Run(RunArgs),

    /// Print the task order of a category
    Tasks(TasksArgs),
}

/// Arguments of `nrtbench run`. Flags override the configuration file.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Coordinator configuration (JSON)
    #[arg(short, long, value_name = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Task log to replay
    #[arg(short, long, value_name = "TASK_FILE")]
    pub tasks: PathBuf,

    /// Line document file (title<TAB>date<TAB>body). Generated records are
    /// used when absent.
    #[arg(short, long, value_name = "DOC_FILE")]
    pub docs: Option<PathBuf>,

    /// Start over at the end of the document file
    #[arg(long)]
    pub repeat_docs: bool,

    /// Keep segments in this directory instead of memory
    #[arg(long, value_name = "DIR")]
    pub index_dir: Option<PathBuf>,

    /// Read segments through memory maps (with --index-dir)
    #[arg(long, requires = "index_dir")]
    pub mmap: bool,

    /// Seconds to run
    #[arg(long, default_value = "60")]
    pub duration: f64,

    /// Seconds between progress lines
    #[arg(long, default_value = "1")]
    pub progress: f64,

    /// Ingestion threads
    #[arg(long)]
    pub threads: Option<usize>,

    /// Records per second per ingestion thread (0 = unthrottled)
    #[arg(long)]
    pub rate: Option<f64>,

    /// Add or update records
    #[arg(long)]
    pub mode: Option<CliIngestMode>,

    /// Stop ingesting after this many records
    #[arg(long)]
    pub max_records: Option<u64>,

    /// Seconds between snapshot refreshes
    #[arg(long)]
    pub refresh_interval: Option<f64>,

    /// Task worker threads
    #[arg(long)]
    pub task_workers: Option<usize>,

    /// Categories to run (comma-separated, default all)
    #[arg(long, value_delimiter = ',')]
    pub categories: Vec<String>,

    /// Seed of the task order
    #[arg(long)]
    pub seed: Option<u64>,

    /// Merges running at once
    #[arg(long)]
    pub max_concurrent_merges: Option<usize>,

    /// Merges queued before flushing blocks
    #[arg(long)]
    pub max_queued_merges: Option<usize>,

    /// Commit merged segments without warming them
    #[arg(long)]
    pub no_warm: bool,
}

/// Arguments of `nrtbench tasks`.
#[derive(Parser, Debug, Clone)]
pub struct TasksArgs {
    /// Task log
    #[arg(value_name = "TASK_FILE")]
    pub tasks: PathBuf,

    /// Category to print (default: every category)
    #[arg(long)]
    pub category: Option<String>,

    /// Tasks to print per category
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Seed of the task order
    #[arg(long, default_value = "17")]
    pub seed: u64,

    /// Tasks kept per category
    #[arg(long, default_value = "5")]
    pub tasks_per_category: usize,
}

/// Ingestion modes accepted on the command line
#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum CliIngestMode {
    /// Append every record
    Add,
    /// Replace records with the same id
    Update,
}

impl From<CliIngestMode> for IngestMode {
    fn from(mode: CliIngestMode) -> Self {
        match mode {
            CliIngestMode::Add => IngestMode::Add,
            CliIngestMode::Update => IngestMode::Update,
        }
    }
}

/// Output formats
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}
