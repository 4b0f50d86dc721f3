use anyhow::Result;
use clap::Parser;
use postcadence::config;
use postcadence::orchestrator::{BulkPostOrchestrator, OrchestratorOptions};
use postcadence::posting::HttpPostingClient;
use postcadence::queue::SqliteJobQueue;
use postcadence::worker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about = "Run the bulk post poller")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let queue = Arc::new(SqliteJobQueue::connect(&cfg.database_url()).await?);
    let api = Arc::new(HttpPostingClient::from_config(&cfg)?);
    let orchestrator =
        BulkPostOrchestrator::new(queue.clone(), api, OrchestratorOptions::from_config(&cfg));

    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let stale_after = chrono::Duration::seconds(cfg.app.stale_after_seconds as i64);

    // Single poller; the orchestrator itself refuses concurrent runs.
    let worker_queue = queue.clone();
    let worker_orchestrator = orchestrator.clone();
    let poller = tokio::spawn(async move {
        loop {
            match worker::process_next_job(worker_queue.as_ref(), &worker_orchestrator, stale_after)
                .await
            {
                Ok(picked) => {
                    if !picked {
                        tokio::time::sleep(poll_sleep).await;
                    }
                }
                Err(err) => {
                    error!(?err, "poller error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    info!(owner = %orchestrator.owner_id(), "poller started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    poller.abort();
    if let Some(summary) = orchestrator.shutdown().await {
        info!(outcome = ?summary.outcome, success = summary.success_count, "last run closed");
    }

    Ok(())
}
