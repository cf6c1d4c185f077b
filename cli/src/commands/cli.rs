use std::path::PathBuf;

use clap::{Parser, Subcommand};
use seqflow_core::process::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "seqflow",
    version,
    about = "Task engine for long-running bioinformatics pipelines"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an external worker command under the task scheduler.
    Run(RunArgs),
    /// Fetch a remote document: sequence, features, merge and save.
    Fetch(FetchArgs),
    /// Worker mode: execute a job, speaking the wire protocol on stdout.
    Worker(WorkerArgs),
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Worker executable. Defaults to the current binary.
    #[arg(long)]
    pub program: Option<String>,

    /// Minimum worker log level forwarded to the parent log.
    #[arg(long, default_value = "details")]
    pub log_level: String,

    /// Hide the progress bar.
    #[arg(long)]
    pub quiet: bool,

    /// Worker command and its arguments.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    /// Accession id to fetch.
    pub accession: String,

    /// Reference source base URL.
    #[arg(long)]
    pub source: String,

    /// Feature source, as `name=url` or a bare URL. Repeatable.
    #[arg(long = "features")]
    pub features: Vec<String>,

    /// Resolve the accession id before fetching.
    #[arg(long)]
    pub convert_id: bool,

    /// Output path for the fetched document.
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub job: WorkerJob,

    /// Emit `task-progress=` tokens for the parent process.
    #[arg(long, global = true)]
    pub emit_progress_state: bool,

    /// Emit a sentinel-wrapped error payload on failure.
    #[arg(long, global = true)]
    pub emit_task_error: bool,

    /// Suppress human-readable progress log lines.
    #[arg(long, global = true)]
    pub log_no_task_progress: bool,

    #[arg(long, global = true)]
    pub log_level_trace: bool,
    #[arg(long, global = true)]
    pub log_level_details: bool,
    #[arg(long, global = true)]
    pub log_level_info: bool,
    #[arg(long, global = true)]
    pub log_level_error: bool,
}

impl WorkerArgs {
    pub fn min_level(&self) -> LogLevel {
        if self.log_level_trace {
            LogLevel::Trace
        } else if self.log_level_details {
            LogLevel::Details
        } else if self.log_level_info {
            LogLevel::Info
        } else if self.log_level_error {
            LogLevel::Error
        } else {
            LogLevel::Details
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum WorkerJob {
    /// Count steps, reporting progress for each.
    Count {
        #[arg(long, default_value_t = 10)]
        steps: u64,
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
    },
    /// Fail with the given message.
    Fail {
        message: String,
        /// Omit the closing error sentinel.
        #[arg(long)]
        open: bool,
    },
    /// Sleep until terminated.
    Hang,
    /// Emit a mix of leveled and free-text lines.
    Spam,
}
