use std::io::stdout;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};

use jobmill_store::JobStore;

#[derive(Debug, Parser)]
#[command(
    name = "jobmill-progress",
    version,
    about = "Read-only progress viewer for jobmill job databases"
)]
struct Cli {
    /// SQLite job database file.
    db_file: PathBuf,

    /// Repaint continuously until interrupted.
    #[arg(long)]
    watch: bool,

    /// Repaint interval in seconds for watch mode.
    #[arg(long, default_value_t = 2)]
    interval: u64,
}

fn percent(part: i64, total: i64) -> f64 {
    if total > 0 {
        part as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

fn progress_bar(percentage: f64, width: usize) -> String {
    let filled = ((width as f64 * percentage / 100.0) as usize).min(width);
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

async fn print_report(store: &JobStore, db_file: &Path) -> anyhow::Result<()> {
    let counts = store.count_by_status().await?;
    let breakdown = store.pending_breakdown().await?;
    let running = store.running_jobs().await?;
    let recent = store.recent_completed(5).await?;
    let remaining = store.estimated_remaining_seconds().await?;

    let completion_rate = percent(counts.done + counts.error, counts.total);

    println!("{}", "=".repeat(70));
    println!("jobmill progress viewer");
    println!("Database: {}", db_file.display());
    println!("Time: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!("{}", "=".repeat(70));

    println!();
    println!("Statistics:");
    println!("  Total jobs: {}", counts.total);
    println!(
        "  Pending:    {:4} ({:.1}%)",
        counts.pending,
        percent(counts.pending, counts.total)
    );
    if let Some(breakdown) = breakdown {
        println!("    - Ready:   {:4}", breakdown.ready);
        println!("    - Waiting: {:4}", breakdown.waiting);
        if breakdown.blocked > 0 {
            println!("    - Blocked: {:4}", breakdown.blocked);
        }
    }
    println!("  Running:    {:4}", counts.running);
    println!(
        "  Completed:  {:4} ({:.1}%)",
        counts.done,
        percent(counts.done, counts.total)
    );
    println!(
        "  Failed:     {:4} ({:.1}%)",
        counts.error,
        percent(counts.error, counts.total)
    );
    println!(
        "  Progress:   [{}] {:.1}%",
        progress_bar(completion_rate, 40),
        completion_rate
    );
    if let Some(remaining) = remaining {
        let minutes = (remaining / 60.0) as u64;
        let seconds = (remaining % 60.0) as u64;
        println!("  Est. remaining: ~{minutes}m {seconds}s");
    }

    if !running.is_empty() {
        println!();
        println!("Currently running ({} jobs):", running.len());
        for job in running.iter().take(10) {
            let worker = job.worker_id.as_deref().unwrap_or("unknown");
            let heartbeat = match job.heartbeat_age_seconds() {
                Some(age) => format!("heartbeat={age}s ago"),
                None => "heartbeat=never".to_string(),
            };
            println!(
                "  • {} (worker={worker}, {heartbeat}, priority={})",
                job.job_id, job.priority
            );
        }
        if running.len() > 10 {
            println!("  ... and {} more", running.len() - 10);
        }
    }

    if !recent.is_empty() {
        println!();
        println!("Recently completed:");
        for job in &recent {
            let icon = if job.status == "done" { "✓" } else { "✗" };
            let elapsed = match job.elapsed_time {
                Some(elapsed) => format!("({elapsed:.2}s)"),
                None => "(no time)".to_string(),
            };
            println!("  {icon} {} {elapsed}", job.job_id);
        }
    }

    println!();
    println!("{}", "=".repeat(70));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let store = JobStore::open(&cli.db_file).await?;

    if !cli.watch {
        print_report(&store, &cli.db_file).await?;
        return Ok(());
    }

    let interval = Duration::from_secs(cli.interval.max(1));
    loop {
        execute!(stdout(), Clear(ClearType::All), MoveTo(0, 0))?;
        print_report(&store, &cli.db_file).await?;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Monitoring stopped.");
                break;
            }
        }
    }
    Ok(())
}
