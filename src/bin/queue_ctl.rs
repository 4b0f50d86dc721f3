use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use postcadence::config;
use postcadence::db;
use postcadence::model::{ContentItem, JobStatus, PostingStrategy, ScheduleSettings};
use postcadence::orchestrator::{BulkPostOrchestrator, OrchestratorOptions};
use postcadence::posting::{HttpPostingClient, PostingApi};
use postcadence::queue::{JobQueueStore, SqliteJobQueue};

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and manage the bulk post queue")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List queued jobs in start order
    List {
        /// Only show jobs with this status (pending, processing, completed, failed)
        #[arg(long)]
        status: Option<String>,
        /// Only show the batches of one bulk post
        #[arg(long, conflicts_with = "status")]
        group: Option<Uuid>,
    },
    /// Count jobs per status
    Stats,
    /// Remove completed and failed jobs
    Clear,
    /// Remove a single job
    Remove { id: i64 },
    /// Re-anchor pending jobs to the next allowed slot from now
    Reschedule,
    /// List profiles connected on the aggregator
    Profiles,
    /// Print an example config file
    ExampleConfig,
    /// Run a bulk post described by a JSON request file and wait for it
    Post {
        #[arg(long)]
        file: PathBuf,
    },
}

/// Body of a `post --file` request.
#[derive(Debug, Deserialize)]
struct PostRequest {
    items: Vec<ContentItem>,
    strategy: PostingStrategy,
    settings: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let queue = Arc::new(SqliteJobQueue::connect(&cfg.database_url()).await?);
    let api = Arc::new(HttpPostingClient::from_config(&cfg)?);

    match args.command {
        Command::List { status, group } => {
            let jobs = match (group, status.as_deref()) {
                (Some(group), _) => queue.list_group(group).await?,
                (None, Some(s)) => {
                    let status =
                        JobStatus::parse_status(s).ok_or_else(|| anyhow!("unknown status {s}"))?;
                    queue.list(Some(status)).await?
                }
                (None, None) => queue.list(None).await?,
            };
            for job in jobs {
                println!(
                    "{:>6}  {:<10}  {}  batch {}/{}  items {}{}",
                    job.id,
                    job.status.as_str(),
                    job.scheduled_start_time.to_rfc3339(),
                    job.batch_index + 1,
                    job.total_batches,
                    job.payload.items.len(),
                    job.error
                        .as_deref()
                        .map(|e| format!("  error: {e}"))
                        .unwrap_or_default(),
                );
            }
        }
        Command::Stats => {
            for status in [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Completed,
                JobStatus::Failed,
            ] {
                let count = db::count_jobs(queue.pool(), status).await?;
                println!("{:<10}  {count}", status.as_str());
            }
        }
        Command::ExampleConfig => unreachable!("handled before loading config"),
        Command::Clear => {
            let removed = queue
                .remove_where(&[JobStatus::Completed, JobStatus::Failed])
                .await?;
            info!(removed, "cleared finished jobs");
        }
        Command::Remove { id } => {
            match queue.get(id).await? {
                Some(job) if job.status == JobStatus::Processing => {
                    return Err(anyhow!("job {id} is being processed; stop it first"));
                }
                Some(_) => {
                    queue.remove(id).await?;
                    info!(id, "job removed");
                }
                None => warn!(id, "no such job"),
            }
        }
        Command::Reschedule => {
            let orchestrator =
                BulkPostOrchestrator::new(queue.clone(), api, OrchestratorOptions::from_config(&cfg));
            let moved = orchestrator.reschedule_queue().await?;
            info!(moved, "pending jobs rescheduled");
        }
        Command::Profiles => {
            for profile in api.list_profiles().await? {
                println!(
                    "{}  {}  {}",
                    profile.id,
                    profile.platform.as_deref().unwrap_or("-"),
                    profile.username.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Post { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let mut request: PostRequest =
                serde_json::from_str(&raw).context("invalid post request JSON")?;
            // Quiet hours follow the configured zone unless the request names one.
            if let Some(settings) = request.settings.as_object_mut() {
                settings
                    .entry("timezone")
                    .or_insert_with(|| serde_json::Value::String(cfg.app.tz().name().to_string()));
            }
            let settings: ScheduleSettings =
                serde_json::from_value(request.settings).context("invalid schedule settings")?;

            let orchestrator =
                BulkPostOrchestrator::new(queue.clone(), api, OrchestratorOptions::from_config(&cfg));
            let ids = orchestrator
                .start_bulk_post(request.items, request.strategy, settings)
                .await?;
            info!(?ids, "bulk post started");

            let runner = orchestrator.clone();
            let summary = tokio::select! {
                summary = runner.wait() => summary,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted; stopping after the in-flight post");
                    orchestrator.shutdown().await
                }
            };
            if let Some(summary) = summary {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
    }

    Ok(())
}
