use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cinesync")]
#[command(about = "Synchronize the title catalog against the source dataset")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download the dataset and run one sync pass.
    Sync {
        /// Compute and report the delta without applying it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Keep running syncs on the configured cron schedule.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let pipeline = cinesync_sync::pipeline_from_env()?;
            let summary = if dry_run {
                pipeline.plan_once().await?
            } else {
                pipeline.run_once().await?
            };
            println!(
                "sync {}: run_id={} scraped={} catalog_before={} added={} removed={}",
                if summary.dry_run {
                    "planned (dry run)"
                } else {
                    "complete"
                },
                summary.run_id,
                summary.scraped,
                summary.catalog_before,
                summary.added,
                summary.removed
            );
            if !dry_run && pipeline.config().scheduler_enabled {
                cinesync_sync::run_scheduled(pipeline).await?;
            }
        }
        Commands::Schedule => {
            cinesync_sync::run_scheduled_from_env().await?;
        }
    }

    Ok(())
}
