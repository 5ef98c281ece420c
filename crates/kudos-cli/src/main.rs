use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kudos_storage::StateStore;
use kudos_sync::KudosConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kudos-cli")]
#[command(about = "Praise closed deals posted to a Feishu group chat")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and exit.
    Run,
    /// Keep running on the configured cron schedule until interrupted.
    Schedule,
    /// Print the persisted state without contacting Feishu.
    State {
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = KudosConfig::from_env().context("loading configuration")?;
            let summary = kudos_sync::run_once_from_config(&config).await?;
            println!(
                "run complete: run_id={} fetched={} praised={} digested={} skipped={} failures={}",
                summary.run_id,
                summary.fetched_events,
                summary.praised,
                summary.digested,
                summary.skipped_malformed,
                summary.send_failures
            );
        }
        Commands::Schedule => {
            let config = Arc::new(KudosConfig::from_env().context("loading configuration")?);
            let cron = config.schedule_cron.clone();
            let mut sched = kudos_sync::build_scheduler(config).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::State { file } => {
            let path = file
                .or_else(|| std::env::var_os("STATE_FILE").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("state.json"));
            let state = StateStore::new(path).load().await;
            println!("{}", kudos_sync::state_report(&state));
        }
    }

    Ok(())
}
