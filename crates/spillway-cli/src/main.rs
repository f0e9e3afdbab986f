use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spillway_core::app::{CallerHints, Preview, RouteRequest};
use spillway_core::domain::{FetchOperation, JobId, OutputFormat, OutputMode, Outcome};
use spillway_core::impls::MemoryFetcher;
use spillway_core::ports::Fetcher;
use spillway_core::{App, AppBuilder, Settings};

#[derive(Debug, Parser)]
#[command(name = "spillway", version, about = "Adaptive output routing for paged fetches")]
struct Cli {
    /// Overrides SPILLWAY_STORAGE_ROOT.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Route a synthetic paged result and follow it to the end.
    Demo(DemoArgs),
    /// Print the effective settings as JSON.
    Settings,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PreviewKind {
    /// Fetch the first page and estimate from it.
    Page,
    /// Only the declared row count is known.
    Count,
    /// Nothing is known up front.
    Unknown,
}

#[derive(Debug, clap::Args)]
struct DemoArgs {
    #[arg(long, default_value_t = 50_000)]
    rows: usize,

    #[arg(long, default_value_t = 1_000)]
    page_size: usize,

    /// Simulated provider latency per page.
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    #[arg(long, value_enum, default_value_t = PreviewKind::Count)]
    preview: PreviewKind,

    /// auto | inline | file | job
    #[arg(long, default_value = "auto")]
    mode: OutputMode,

    /// csv | json
    #[arg(long)]
    format: Option<OutputFormat>,

    #[arg(long)]
    project: Option<String>,

    #[arg(long)]
    subdir: Option<String>,

    #[arg(long)]
    filename: Option<String>,

    #[arg(long)]
    profile: Option<String>,

    /// Status poll interval.
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env().context("loading settings")?;
    if let Some(root) = cli.root {
        settings.storage.root = root;
    }

    match cli.command {
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Demo(args) => demo(settings, args).await,
    }
}

async fn demo(settings: Settings, args: DemoArgs) -> anyhow::Result<()> {
    let fetcher = Arc::new(
        MemoryFetcher::synthetic(args.rows, args.page_size)
            .with_latency(Duration::from_millis(args.latency_ms)),
    );
    let operation = FetchOperation::new(
        "series_observations",
        serde_json::json!({ "series_id": "DEMO", "rows": args.rows }),
    );

    let preview = match args.preview {
        PreviewKind::Page => Preview::Page(
            fetcher
                .fetch(&operation, None)
                .await
                .context("fetching the preview page")?,
        ),
        PreviewKind::Count => Preview::DeclaredCount(args.rows as u64),
        PreviewKind::Unknown => Preview::Unknown,
    };

    let app = AppBuilder::new(settings).fetcher(fetcher).build()?;
    let outcome = app
        .router
        .handle(RouteRequest {
            operation,
            preview,
            hints: CallerHints {
                mode: args.mode,
                format: args.format,
                project: args.project,
                subdir: args.subdir,
                filename: args.filename,
                profile: args.profile,
            },
        })
        .await;

    let result = match outcome {
        Ok(outcome) => report(&app, outcome, Duration::from_millis(args.poll_ms)).await,
        Err(e) => Err(e.into()),
    };

    let shutdown = app.shutdown().await;
    if !shutdown.graceful {
        warn!(interrupted_queued = shutdown.interrupted_queued, "shutdown was not graceful");
    }
    result
}

async fn report(app: &App, outcome: Outcome, poll: Duration) -> anyhow::Result<()> {
    match outcome {
        Outcome::Inline { records, verdict } => {
            println!(
                "inline: {} records ({} units, {})",
                records.len(),
                verdict.estimated_units,
                verdict.reason
            );
            if let Some(first) = records.first() {
                println!("first record: {first}");
            }
            Ok(())
        }
        Outcome::File {
            location,
            rows_written,
            bytes_written,
            format,
        } => {
            println!(
                "file: {} ({rows_written} rows, {bytes_written} bytes, {format})",
                location.display()
            );
            Ok(())
        }
        Outcome::Job {
            job_id,
            estimated_rows,
            estimated_duration,
            location,
        } => {
            println!(
                "job {job_id}: ~{estimated_rows} rows, ~{}s -> {}",
                estimated_duration.as_secs(),
                location.display()
            );
            follow(app, job_id, poll).await
        }
    }
}

/// Poll until the job is terminal; Ctrl-C cancels it.
async fn follow(app: &App, job_id: JobId, poll: Duration) -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let job = app.status.get_status(job_id).await?;
        let p = &job.progress;
        info!(
            job_id = %job_id,
            status = %job.status,
            rows = p.rows_fetched,
            pages = p.pages_fetched,
            percent = p.percent_complete.unwrap_or(0.0),
            retries = job.retry_count,
            "progress"
        );
        if job.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&job)?);
            if let Some(error) = job.error {
                bail!("job failed: {} ({})", error.message, error.kind);
            }
            return Ok(());
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                warn!(job_id = %job_id, "interrupted; cancelling job");
                // the job may have finished in the meantime
                if let Err(e) = app.status.cancel(job_id, Some("interrupted from the terminal")).await {
                    warn!(job_id = %job_id, error = %e, "cancel refused");
                }
            }
            _ = sleep(poll) => {}
        }
    }
}
