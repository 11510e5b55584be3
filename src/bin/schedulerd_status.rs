//! schedulerd-status — a read-only informational CLI. Opens the same
//! Store the daemon writes to and prints job/run status; it never
//! touches the daemon's in-memory state, keeping it a genuinely external
//! collaborator to the core per the distilled spec's Non-goals.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use schedulerd::store::{RunFilter, SqliteStore, Store};
use schedulerd::Config;

#[derive(Parser)]
#[command(name = "schedulerd-status")]
#[command(about = "Read-only status CLI for schedulerd")]
struct Cli {
    /// Configuration file path; used only to locate the data directory / database.
    #[arg(short, long, default_value = "/etc/schedulerd/config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured jobs and concurrency groups.
    Jobs,
    /// Show recent finished runs for a job (or every job, if omitted).
    Runs {
        job: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config).with_context(|| format!("loading {:?}", cli.config))?;

    match cli.command {
        Commands::Jobs => {
            for job in config.jobs.values() {
                println!(
                    "{:<32} schedule={:<24} groups={:?}",
                    job.name,
                    job.schedule.as_deref().unwrap_or("(trigger-only)"),
                    job.concurrency_groups
                );
            }
            for group in config.concurrency_groups.values() {
                println!("group {:<32} max={}", group.name, group.max);
            }
        }
        Commands::Runs { job, limit } => {
            let db_path = config.database_path();
            let store = SqliteStore::open(&db_path).with_context(|| format!("opening {:?}", db_path))?;
            let filter = RunFilter {
                job_names: job.map(|j| vec![j]),
                run_ids: None,
                limit: Some(limit),
            };
            for run in store.get_runs(&filter).await? {
                println!(
                    "{} {} exit={} stop={}",
                    run.id, run.job_name, run.exit_code, run.stop_time
                );
            }
        }
    }

    Ok(())
}
