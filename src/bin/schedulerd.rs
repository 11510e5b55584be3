//! schedulerd — the daemon binary. Loads configuration, initializes
//! logging, acquires a single-instance lock, builds the [`Scheduler`],
//! installs signal handlers, and runs the loop to completion.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use schedulerd::store::SqliteStore;
use schedulerd::{Config, Scheduler};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "schedulerd")]
#[command(about = "Single-host job scheduler and run executor daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path (JSON, or YAML with the `yaml` feature).
    #[arg(short, long, default_value = "/etc/schedulerd/config.json")]
    config: PathBuf,

    /// Run the loop until currently due/running work drains, then exit,
    /// instead of running forever. Useful for cron-driven invocation.
    #[arg(long)]
    once: bool,

    /// Log file path; defaults to `<data_dir>/schedulerd.log`.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(log_file: &std::path::Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let file_appender = tracing_appender::rolling::never(
        log_file.parent().unwrap_or_else(|| std::path::Path::new(".")),
        log_file.file_name().unwrap_or_else(|| std::ffi::OsStr::new("schedulerd.log")),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(guard)
}

fn acquire_lock(data_dir: &std::path::Path) -> Result<fd_lock::RwLock<std::fs::File>> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join("schedulerd.lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("opening lock file {:?}", path))?;
    Ok(fd_lock::RwLock::new(file))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;

    let log_file = cli
        .log_file
        .clone()
        .unwrap_or_else(|| config.data_dir.join("schedulerd.log"));
    // Written before the tracing subscriber is installed so a crash during
    // init is still visible: same rationale the oddjobs daemon's
    // write_startup_marker uses.
    std::fs::create_dir_all(log_file.parent().unwrap_or_else(|| std::path::Path::new("."))).ok();
    let _ = std::fs::write(
        log_file.with_extension("startup"),
        format!("schedulerd starting, pid {}\n", std::process::id()),
    );

    let _guard = init_logging(&log_file)?;

    let mut lock = acquire_lock(&config.data_dir)?;
    let _lock_guard = match lock.try_write() {
        Ok(g) => g,
        Err(_) => {
            error!("another schedulerd instance already holds the lock in {:?}", config.data_dir);
            std::process::exit(1);
        }
    };

    let db_path = config.database_path();
    let store: Arc<dyn schedulerd::store::Store> =
        Arc::new(SqliteStore::open(&db_path).with_context(|| format!("opening store at {:?}", db_path))?);

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = schedulerd::signals::install(tx).await {
            error!(error = %e, "signal handler installation failed");
        }
    });

    let mut scheduler = Scheduler::new(config, Some(cli.config.clone()), store, rx);
    scheduler.initialize().await?;

    info!(once = cli.once, "schedulerd starting");
    scheduler.run(cli.once).await?;
    info!("schedulerd exiting cleanly");
    Ok(())
}
