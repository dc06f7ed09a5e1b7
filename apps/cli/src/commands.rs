//! CLI command definitions, routing, and tracing setup.

use std::path::Path;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use lorepath_core::Runtime;
use lorepath_shared::{
    AppConfig, Job, JobPayload, JobStatus, QueueName, SourceType, init_config, load_config,
    validate_api_key,
};
use lorepath_storage::JobFilter;
use tracing::info;
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Lorepath: turn learning material into adaptive learning paths.
#[derive(Parser)]
#[command(
    name = "lorepath",
    version,
    about = "Ingest learning material and build adaptive narrative graphs.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run workers, folder watchers and URL monitors until Ctrl-C.
    Serve,

    /// Queue a file or URL for ingestion.
    Ingest {
        /// File path or http(s) URL.
        source: String,

        /// Organization that owns the content.
        #[arg(long)]
        org: String,

        /// Process now and wait until the pipeline settles.
        #[arg(long)]
        wait: bool,

        /// Seconds to wait with --wait.
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// Inspect and administer jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Similarity search over an organization's ready content units.
    Search {
        /// Query text.
        text: String,

        #[arg(long)]
        org: String,

        /// Minimum similarity (exclusive). Defaults to the configured value.
        #[arg(long)]
        threshold: Option<f32>,

        /// Maximum results. Defaults to the configured value.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Job subcommands.
#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List jobs, newest first.
    List {
        /// ingestion, embedding, ai-authoring or narrative-planning.
        #[arg(long)]
        queue: Option<String>,

        /// pending, processing, completed or failed.
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        org: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Re-run a failed job from attempt 1.
    Retry { id: String },
    /// Cancel a pending job.
    Cancel { id: String },
    /// Delete a completed or failed job.
    Delete { id: String },
    /// Deliver a job recorded without auto-processing.
    Dispatch { id: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "lorepath=info",
        1 => "lorepath=debug",
        _ => "lorepath=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve => cmd_serve().await,
        Command::Ingest {
            source,
            org,
            wait,
            timeout,
        } => cmd_ingest(&source, &org, wait, Duration::from_secs(timeout)).await,
        Command::Jobs { action } => cmd_jobs(action).await,
        Command::Search {
            text,
            org,
            threshold,
            limit,
        } => cmd_search(&text, &org, threshold, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

async fn open_runtime() -> Result<(AppConfig, Runtime)> {
    let config = load_config()?;
    validate_api_key(&config)?;
    let runtime = Runtime::open(config.clone()).await?;
    Ok((config, runtime))
}

async fn cmd_serve() -> Result<()> {
    let (_, mut runtime) = open_runtime().await?;
    runtime.start().await?;
    println!("Lorepath is running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("failed to listen for Ctrl-C: {e}"))?;

    println!("Shutting down...");
    runtime.shutdown().await;
    Ok(())
}

async fn cmd_ingest(source: &str, org: &str, wait: bool, timeout: Duration) -> Result<()> {
    let (_, mut runtime) = open_runtime().await?;
    let payload = ingestion_payload(source, org)?;
    info!(source, org, wait, "queueing ingestion");

    if !wait {
        let job = runtime.queue().enqueue(payload).await?;
        println!("Queued ingestion job {}", job.id);
        println!("It will be processed by `lorepath serve`.");
        return Ok(());
    }

    runtime.start().await?;
    let spinner = spinner();
    spinner.set_message(format!("Ingesting {source}"));

    let queue = runtime.queue();
    let job = queue.enqueue(payload).await?;
    let result = async {
        let done = queue.wait_terminal(&job.id, timeout).await?;
        if done.status == JobStatus::Failed {
            return Ok::<Job, color_eyre::Report>(done);
        }
        spinner.set_message("Enriching and planning".to_string());
        settle(&runtime, org, timeout).await?;
        Ok(done)
    }
    .await;

    spinner.finish_and_clear();
    runtime.shutdown().await;
    let done = result?;

    println!();
    println!("  Job:     {}", done.id);
    println!("  Status:  {}", done.status.as_str());
    if let Some(error) = &done.error {
        println!("  Error:   {error}");
    }
    let storage = runtime.storage();
    println!("  Units:   {}", storage.list_nuggets(org).await?.len());
    println!("  Nodes:   {}", storage.count_nodes(org).await?);
    println!();
    Ok(())
}

/// Wait until the organization has no delivered work left in flight.
async fn settle(runtime: &Runtime, org: &str, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut busy = 0;
        for status in [JobStatus::Pending, JobStatus::Processing] {
            busy += runtime
                .queue()
                .list(&JobFilter {
                    status: Some(status),
                    organization_id: Some(org.to_string()),
                    ..JobFilter::default()
                })
                .await?
                .iter()
                .filter(|j| !j.deferred)
                .count();
        }
        if busy == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(eyre!("{busy} jobs still running after {}s", timeout.as_secs()));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn ingestion_payload(source: &str, org: &str) -> Result<JobPayload> {
    let (source_type, source) = match Url::parse(source) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => (SourceType::Url, url.to_string()),
        _ => {
            let path = Path::new(source)
                .canonicalize()
                .map_err(|e| eyre!("cannot read '{source}': {e}"))?;
            (SourceType::File, path.display().to_string())
        }
    };
    Ok(JobPayload::Ingestion {
        source_type,
        source,
        organization_id: org.to_string(),
        metadata: None,
    })
}

async fn cmd_jobs(action: JobsAction) -> Result<()> {
    let (_, runtime) = open_runtime().await?;
    let queue = runtime.queue();

    match action {
        JobsAction::List {
            queue: queue_name,
            status,
            org,
            limit,
            json,
        } => {
            let filter = JobFilter {
                queue: queue_name.map(|q| q.parse::<QueueName>()).transpose()?,
                status: status.map(|s| s.parse::<JobStatus>()).transpose()?,
                organization_id: org,
                limit: Some(limit),
            };
            let jobs = queue.list(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs);
            }
        }
        JobsAction::Retry { id } => {
            let job = queue.retry(&id).await?;
            println!("Job {} reset to {}", job.id, job.status.as_str());
        }
        JobsAction::Cancel { id } => {
            let job = queue.cancel(&id).await?;
            println!("Job {} cancelled", job.id);
        }
        JobsAction::Delete { id } => {
            queue.delete(&id).await?;
            println!("Job {id} deleted");
        }
        JobsAction::Dispatch { id } => {
            let job = queue.dispatch(&id).await?;
            println!("Job {} dispatched to {}", job.id, job.queue);
        }
    }
    Ok(())
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    println!(
        "{:<36}  {:<18}  {:<18}  {:<10}  {:>7}  CREATED",
        "ID", "QUEUE", "KIND", "STATUS", "TRIES"
    );
    for job in jobs {
        let status = if job.deferred && job.status == JobStatus::Pending {
            "deferred"
        } else {
            job.status.as_str()
        };
        println!(
            "{:<36}  {:<18}  {:<18}  {:<10}  {:>3}/{:<3}  {}",
            job.id,
            job.queue.as_str(),
            job.payload.kind(),
            status,
            job.attempts,
            job.max_attempts,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
        if let Some(error) = &job.error {
            println!("    error: {error}");
        }
    }
}

async fn cmd_search(
    text: &str,
    org: &str,
    threshold: Option<f32>,
    limit: Option<usize>,
) -> Result<()> {
    let (config, runtime) = open_runtime().await?;
    let embeddings = runtime.embeddings();
    let query = embeddings.embed("query", text).await?;
    let hits = embeddings
        .search_with(
            &query,
            org,
            threshold.unwrap_or(config.search.threshold),
            limit.unwrap_or(config.search.limit),
        )
        .await?;

    if hits.is_empty() {
        println!("No matching content.");
        return Ok(());
    }
    let storage = runtime.storage();
    for hit in hits {
        let title = storage
            .get_nugget(&hit.nugget_id)
            .await?
            .map(|n| n.title)
            .unwrap_or_default();
        println!("{:.3}  {}  {title}", hit.similarity, hit.nugget_id);
    }
    Ok(())
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(
            style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
    }
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
