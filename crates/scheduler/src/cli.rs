use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "jobmill",
    version,
    about = "SQLite-backed parallel batch job scheduler"
)]
pub struct Cli {
    /// SQLite job database file.
    pub db_file: PathBuf,

    /// Command to execute for each job; the job's user columns are appended
    /// as arguments.
    pub command: String,

    /// Maximum total runtime per worker in seconds.
    #[arg(long, env = "JOBMILL_MAX_RUNTIME", default_value_t = 86_400)]
    pub max_runtime: u64,

    /// Safety margin subtracted from the remaining budget in seconds.
    #[arg(long, env = "JOBMILL_MARGIN_TIME", default_value_t = 0)]
    pub margin_time: u64,

    /// Speed factor dividing job time estimates (this host is N× a
    /// reference host).
    #[arg(long, env = "JOBMILL_SPEED_FACTOR", default_value_t = 1.0)]
    pub speed_factor: f64,

    /// Only claim jobs whose estimated runtime fits the remaining budget.
    #[arg(
        long,
        env = "JOBMILL_SMART_SCHEDULING",
        action = ArgAction::Set,
        default_value_t = true
    )]
    pub smart_scheduling: bool,

    /// Pass user columns as `--column value` pairs instead of positional
    /// arguments.
    #[arg(long, env = "JOBMILL_NAMED_ARGS", default_value_t = false)]
    pub named_args: bool,

    /// Number of parallel workers.
    #[arg(
        short = 'p',
        long,
        env = "JOBMILL_PARALLEL",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..=512)
    )]
    pub parallel: u16,
}
