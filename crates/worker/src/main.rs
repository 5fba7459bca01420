use anyhow::Result;
use clap::Parser;
use stagehand_core::dispatcher::StepRegistry;
use std::path::PathBuf;

mod api;
mod config;
mod policy;
mod queue;

use config::{AppState, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(about = "Pipeline node execution worker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "stagehand.toml", env = "STAGEHAND_CONFIG")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "STAGEHAND_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stagehand=info,stagehand_core=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Stagehand worker");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = WorkerConfig::load(&args.config, args.data_dir)?;

    // Step implementations are registered by the embedding deployment
    let (state, receiver) = AppState::new(&config, StepRegistry::new())?;

    let workers = queue::spawn_workers(
        receiver,
        state.queue.clone(),
        state.dispatcher.clone(),
        config.worker.concurrency,
    );
    tracing::info!("Spawned {} event workers", workers.len());

    let addr = format!("{}:{}", args.host, args.port);
    api::serve(&addr, state).await?;

    Ok(())
}
