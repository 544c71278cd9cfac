use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jobmill_store::batch;
use jobmill_store::JobStore;

#[derive(Debug, Parser)]
#[command(
    name = "jobmill-db",
    version,
    about = "Batch database utility for jobmill"
)]
struct Cli {
    #[command(subcommand)]
    command: DbCommand,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Import jobs from a CSV batch file, creating or extending the schema.
    Import {
        /// SQLite job database file (created if missing).
        db_file: PathBuf,
        /// CSV batch file.
        csv_file: PathBuf,
        /// Keep the status column from the file instead of resetting every
        /// row to pending.
        #[arg(long)]
        no_reset: bool,
    },
    /// Export jobs to a CSV file.
    Export {
        /// SQLite job database file.
        db_file: PathBuf,
        /// Destination CSV file.
        csv_file: PathBuf,
        /// Only export jobs with this status.
        #[arg(long)]
        status: Option<String>,
    },
    /// Print job statistics.
    Stats {
        /// SQLite job database file.
        db_file: PathBuf,
    },
    /// Reset every job to pending, clearing execution fields.
    Reset {
        /// SQLite job database file.
        db_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        DbCommand::Import {
            db_file,
            csv_file,
            no_reset,
        } => {
            let store = JobStore::open_or_create(&db_file).await?;
            let imported = batch::import_csv(&store, &csv_file, !no_reset).await?;
            println!("Imported {imported} jobs from {}", csv_file.display());
        }
        DbCommand::Export {
            db_file,
            csv_file,
            status,
        } => {
            let store = JobStore::open(&db_file).await?;
            let exported = batch::export_csv(&store, &csv_file, status.as_deref()).await?;
            println!("Exported {exported} jobs to {}", csv_file.display());
        }
        DbCommand::Stats { db_file } => {
            let store = JobStore::open(&db_file).await?;
            let counts = store.count_by_status().await?;
            println!("Job statistics:");
            println!("  Total:   {}", counts.total);
            println!("  Pending: {}", counts.pending);
            println!("  Running: {}", counts.running);
            println!("  Done:    {}", counts.done);
            println!("  Error:   {}", counts.error);
        }
        DbCommand::Reset { db_file } => {
            let store = JobStore::open(&db_file).await?;
            let count = store.reset_all().await?;
            println!("Reset {count} jobs to pending");
        }
    }

    Ok(())
}
