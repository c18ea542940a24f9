use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use cron_lite::config::{CronConfig, FieldPaths};
use cron_lite::document::{Job, JobId, NewJob, WaitState};
use cron_lite::error::CronError;
use cron_lite::shutdown::install_shutdown_handler;
use cron_lite::store::{Filter, JobStore, SqliteJobStore};
use cron_lite::worker::{CronHandler, CronWorker, HookResult};

#[derive(Parser, Debug)]
#[command(name = "cron-lite")]
#[command(version)]
#[command(about = "A job queue and cron scheduler on a shared SQLite file")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a worker that logs every job it handles
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Path to the SQLite database shared by all workers
    #[arg(long)]
    db: PathBuf,

    /// Pause before every tick (milliseconds)
    #[arg(long, default_value = "0")]
    next_delay_ms: u64,

    /// Pause after a tick that found nothing to do (milliseconds)
    #[arg(long, default_value = "1000")]
    idle_delay_ms: u64,

    /// Minimum gap between a run and the next occurrence (milliseconds)
    #[arg(long, default_value = "0")]
    reprocess_delay_ms: u64,

    /// How long a claimed job stays locked (milliseconds)
    #[arg(long, default_value = "600000")]
    lock_duration_ms: u64,

    /// Only take jobs from these namespaces (comma-separated)
    #[arg(long, value_delimiter = ',')]
    watch: Vec<String>,

    /// Own one namespace at a time
    #[arg(long)]
    dedicate: bool,

    /// Skip jobs that have no namespace
    #[arg(long)]
    exclude_unnamespaced: bool,

    /// Record per-job statistics in the database
    #[arg(long)]
    stats: bool,

    /// Name recorded with statistics
    #[arg(long, default_value = "cron-lite")]
    cron_name: String,
}

// =============================================================================
// Job Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Path to the SQLite database
    #[arg(long)]
    db: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Insert a new job
    Add {
        /// Cron rule with a seconds field (e.g. "*/10 * * * * *")
        #[arg(long)]
        interval: Option<String>,

        /// First run (RFC 3339); runs as soon as possible when omitted
        #[arg(long)]
        wait_until: Option<String>,

        /// Last possible run (RFC 3339)
        #[arg(long)]
        repeat_until: Option<String>,

        /// Delete the job once it has no further run
        #[arg(long)]
        auto_remove: bool,

        #[arg(long)]
        namespace: Option<String>,

        /// Extra fields as a JSON object
        #[arg(long)]
        data: Option<String>,
    },
    /// List all jobs
    List,
    /// Show one job document
    Show {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Show the most recent job statistics
    Stats {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobAddOutput {
    job_id: String,
}

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    wait_until: String,
    lock_until: Option<String>,
    interval: Option<String>,
    namespace: Option<String>,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobListItem>,
    total_count: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_time(raw: &str) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))?
        .with_timezone(&Utc))
}

fn describe_wait(state: WaitState) -> String {
    match state {
        WaitState::Inert => "inert".to_string(),
        WaitState::Ready => "ready".to_string(),
        WaitState::At(t) => t.to_rfc3339(),
    }
}

fn list_item(job: &Job, fields: &FieldPaths) -> JobListItem {
    let doc = &job.document;
    JobListItem {
        job_id: job.id.to_string(),
        wait_until: describe_wait(fields.wait_state(doc)),
        lock_until: fields.lock_until(doc).map(|t| t.to_rfc3339()),
        interval: fields.interval(doc).map(str::to_string),
        namespace: fields.namespace(doc).map(str::to_string),
    }
}

// =============================================================================
// Worker Implementation
// =============================================================================

/// Handler used by the `worker` command: logs each job.
struct LoggingHandler;

#[async_trait]
impl CronHandler for LoggingHandler {
    async fn on_document(&self, job: Job) -> HookResult {
        tracing::info!(job_id = %job.id, document = %job.document, "Handling job");
        Ok(())
    }

    async fn on_idle(&self) -> HookResult {
        tracing::info!("No jobs due, waiting");
        Ok(())
    }
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteJobStore::open(&args.db)?;

    let mut config = CronConfig::new()
        .with_next_delay(Duration::from_millis(args.next_delay_ms))
        .with_idle_delay(Duration::from_millis(args.idle_delay_ms))
        .with_reprocess_delay(Duration::from_millis(args.reprocess_delay_ms))
        .with_lock_duration(Duration::from_millis(args.lock_duration_ms))
        .with_namespace_dedication(args.dedicate)
        .with_unnamespaced(!args.exclude_unnamespaced)
        .with_cron_name(args.cron_name);
    if !args.watch.is_empty() {
        config = config.with_watched_namespaces(args.watch);
    }

    tracing::info!(
        db = %args.db.display(),
        lock_duration_ms = args.lock_duration_ms,
        dedication = config.namespaces.dedication,
        watched = ?config.namespaces.watched,
        server_name = %config.server_name,
        "Starting cron-lite worker"
    );

    let mut builder = CronWorker::builder(Arc::new(store.clone()), Arc::new(LoggingHandler))
        .config(config)
        .namespace_lock(Arc::new(store.namespace_lock()));
    if args.stats {
        builder = builder.statistics(Arc::new(store));
    }
    let worker = builder.build()?;

    let shutdown = install_shutdown_handler()?;
    worker.start().await?;
    shutdown.cancelled().await;
    worker.stop(false).await?;

    Ok(())
}

// =============================================================================
// Job Command Handlers
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn handle_job_add(
    store: &SqliteJobStore,
    interval: Option<String>,
    wait_until: Option<String>,
    repeat_until: Option<String>,
    auto_remove: bool,
    namespace: Option<String>,
    data: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut job = match wait_until {
        Some(raw) => NewJob::at(parse_time(&raw)?),
        None => NewJob::ready(),
    };
    if let Some(rule) = interval {
        job = job.with_interval(rule);
    }
    if let Some(raw) = repeat_until {
        job = job.with_repeat_until(parse_time(&raw)?);
    }
    if let Some(ns) = namespace {
        job = job.with_namespace(ns);
    }
    if let Some(raw) = data {
        job = job.with_data(serde_json::from_str(&raw)?);
    }
    job = job.with_auto_remove(auto_remove);

    let job_id = store
        .insert(job.into_document(&FieldPaths::default()))
        .await?;

    match output_format {
        OutputFormat::Json => {
            let output = JobAddOutput {
                job_id: job_id.to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job added.");
            println!("Job ID: {}", job_id);
        }
    }
    Ok(())
}

async fn handle_job_list(
    store: &SqliteJobStore,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let fields = FieldPaths::default();
    let jobs: Vec<JobListItem> = store
        .find(&Filter::all())
        .await?
        .iter()
        .map(|job| list_item(job, &fields))
        .collect();

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                total_count: jobs.len(),
                jobs,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<27} {:<16} {:<12} INTERVAL",
                "JOB ID", "WAIT UNTIL", "LOCKED", "NAMESPACE"
            );
            println!("{}", "-".repeat(110));
            let now = Utc::now();
            for job in &jobs {
                let locked = match &job.lock_until {
                    Some(t) if parse_time(t).is_ok_and(|t| t > now) => "yes",
                    _ => "-",
                };
                println!(
                    "{:<38} {:<27} {:<16} {:<12} {}",
                    job.job_id,
                    job.wait_until,
                    locked,
                    job.namespace.as_deref().unwrap_or("-"),
                    job.interval.as_deref().unwrap_or("-"),
                );
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

async fn handle_job_show(
    store: &SqliteJobStore,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let id: JobId = job_id.parse()?;
    let job = store.get(&id).await?.ok_or(CronError::JobNotFound(id))?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            let item = list_item(&job, &FieldPaths::default());
            println!("Job ID:     {}", item.job_id);
            println!("Wait until: {}", item.wait_until);
            println!("Lock until: {}", item.lock_until.as_deref().unwrap_or("-"));
            println!("Interval:   {}", item.interval.as_deref().unwrap_or("-"));
            println!("Namespace:  {}", item.namespace.as_deref().unwrap_or("-"));
            println!();
            println!("{}", serde_json::to_string_pretty(&job.document)?);
        }
    }
    Ok(())
}

async fn handle_job_stats(
    store: &SqliteJobStore,
    limit: usize,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let stats = store.recent_statistics(limit).await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Table => {
            if stats.is_empty() {
                println!("No statistics recorded.");
                return Ok(());
            }
            println!(
                "{:<38} {:<27} {:<10} {:<20} CRON",
                "JOB ID", "STARTED", "MS", "SERVER"
            );
            println!("{}", "-".repeat(105));
            for entry in &stats {
                println!(
                    "{:<38} {:<27} {:<10} {:<20} {}",
                    entry.job_id,
                    entry.job_start.to_rfc3339(),
                    entry.execution_time_ms,
                    entry.server_name,
                    entry.cron_name
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Job { store, command } => {
            let db = SqliteJobStore::open(&store.db)?;

            match command {
                JobCommands::Add {
                    interval,
                    wait_until,
                    repeat_until,
                    auto_remove,
                    namespace,
                    data,
                } => {
                    handle_job_add(
                        &db,
                        interval,
                        wait_until,
                        repeat_until,
                        auto_remove,
                        namespace,
                        data,
                        &store.output,
                    )
                    .await?;
                }
                JobCommands::List => {
                    handle_job_list(&db, &store.output).await?;
                }
                JobCommands::Show { job_id } => {
                    handle_job_show(&db, job_id, &store.output).await?;
                }
                JobCommands::Stats { limit } => {
                    handle_job_stats(&db, limit, &store.output).await?;
                }
            }
        }
    }

    Ok(())
}
