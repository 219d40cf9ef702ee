use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reorder_sync::{SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reorder")]
#[command(about = "Client reorder watch: last purchase per client, synced from the sales API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync (incremental unless REBUILD_MODE or --rebuild is set).
    Sync {
        #[arg(long)]
        rebuild: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run incremental syncs on SYNC_CRON until Ctrl-C (needs SCHEDULER_ENABLED).
    Schedule,
    /// Print an index of the most recent exported runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        /// Defaults to REPORTS_DIR, then `./reports`.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn schedule(config: SyncConfig) -> Result<()> {
    let pipeline: Arc<SyncPipeline> = Arc::new(reorder_sync::build_pipeline(&config).await?);
    let Some(mut sched) = reorder_sync::maybe_build_scheduler(pipeline, &config).await? else {
        warn!("SCHEDULER_ENABLED is not set; scheduler not started");
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { rebuild: false }) {
        Commands::Sync { rebuild } => {
            let summary = reorder_sync::run_sync_once_from_env(rebuild).await?;
            println!("sync complete: {}", summary.one_line());
            if let Some(dir) = &summary.reports_dir {
                println!("reports: {dir}");
            }
        }
        Commands::Migrate => {
            reorder_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Schedule => schedule(SyncConfig::from_env()).await?,
        Commands::Report { runs, dir } => {
            let root = dir
                .or_else(|| SyncConfig::from_env().reports_dir)
                .unwrap_or_else(|| PathBuf::from("reports"));
            println!("{}", reorder_sync::report_daily_markdown(runs, &root)?);
        }
    }

    Ok(())
}
