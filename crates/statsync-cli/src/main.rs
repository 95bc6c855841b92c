use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use statsync_core::InvocationResult;
use statsync_sync::{SyncConfig, SyncService, Targets};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "statsync")]
#[command(about = "Mirror statistical datasets into a blob store and report on them")]
struct Cli {
    /// Overrides STATSYNC_TARGETS_FILE.
    #[arg(long, global = true)]
    targets: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every sync target once.
    Sync,
    /// Run the report pipeline for one changed object.
    Report {
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long)]
        key: String,
    },
    /// Serve the HTTP trigger endpoints.
    Serve,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
    /// Print the effective targets as YAML.
    Targets,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn print_result(result: &InvocationResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    if !result.is_success() {
        bail!("{}", result.message);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env()?;
    if let Some(path) = cli.targets {
        config.targets_file = path;
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let service = SyncService::from_config(&config).await?;
            print_result(&service.run_sync().await)?;
        }
        Commands::Report { bucket, key } => {
            let service = SyncService::from_config(&config).await?;
            let bucket = bucket.unwrap_or_else(|| config.store.bucket.clone());
            print_result(&service.pipeline().run_report(&bucket, &key).await)?;
        }
        Commands::Serve => {
            statsync_web::serve(config, statsync_web::port_from_env()).await?;
        }
        Commands::Schedule => {
            let service = Arc::new(SyncService::from_config(&config).await?);
            let scheduler = service
                .maybe_build_scheduler(true, &config.sync_cron)
                .await?
                .context("scheduler was not built")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
        Commands::Targets => {
            let targets = Targets::load(&config.targets_file)?;
            print!("{}", serde_yaml::to_string(&targets)?);
        }
    }

    Ok(())
}
