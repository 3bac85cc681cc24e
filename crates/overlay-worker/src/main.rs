//! Overlay render worker binary.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use overlay_media::{
    build_plan, check_tool, FfmpegCommand, FfprobeProbe, FsAssets, SourceProbe,
};
use overlay_models::{JobState, Overlay};
use overlay_store::{JobStore, MemoryJobStore, RedisJobStore, RedisStoreConfig};
use overlay_worker::{JobScheduler, RetentionSweeper, WorkerConfig};

/// How often `render` polls the job status.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "overlay-worker", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a video with overlays and wait for the result.
    Render(JobArgs),
    /// Print the ffmpeg command a render would run.
    Plan(JobArgs),
}

#[derive(Parser, Debug)]
struct JobArgs {
    /// Source video.
    #[arg(long)]
    input: PathBuf,

    /// JSON file holding the overlay list.
    #[arg(long)]
    overlays: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env();

    let result = match cli.cmd {
        Command::Render(args) => cmd_render(config, args).await,
        Command::Plan(args) => cmd_plan(config, args).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Colored output for dev, JSON for production.
fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    if let Ok(directive) = "overlay=info".parse() {
        env_filter = env_filter.add_directive(directive);
    }

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

fn read_overlays(path: &Path) -> anyhow::Result<Vec<Overlay>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read overlays from {}", path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("invalid overlay list in {}", path.display()))
}

async fn open_store(config: &WorkerConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match config.redis_store_config(RedisStoreConfig::from_env()) {
        Some(redis) => {
            let store = RedisJobStore::new(redis)?;
            store.ping().await.context("Redis is not reachable")?;
            info!("Using Redis job store");
            Ok(Arc::new(store))
        }
        None => {
            info!("Using in-memory job store");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

async fn cmd_plan(config: WorkerConfig, args: JobArgs) -> anyhow::Result<bool> {
    let overlays = read_overlays(&args.overlays)?;
    let probe = FfprobeProbe::new(&config.ffprobe_path);
    let info = probe.probe(&args.input).await?;
    let plan = build_plan(&overlays, &info, &FsAssets)?;

    let output = config.output_dir.join("plan_output.mp4");
    let command =
        FfmpegCommand::from_plan(&args.input, output, &plan).render_command(&config.ffmpeg_path);
    println!("{}", command);
    Ok(true)
}

async fn cmd_render(config: WorkerConfig, args: JobArgs) -> anyhow::Result<bool> {
    info!("Starting overlay-worker");
    info!("Worker config: {:?}", config);

    let overlays = read_overlays(&args.overlays)?;
    check_tool(&config.ffmpeg_path)?;
    check_tool(&config.ffprobe_path)?;

    let store = open_store(&config).await?;
    let shutdown = CancellationToken::new();
    let sweeper = RetentionSweeper::from_config(store.clone(), &config);
    let sweeper_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };

    let scheduler = JobScheduler::start(
        config.clone(),
        store,
        Arc::new(FfprobeProbe::new(&config.ffprobe_path)),
        Arc::new(config.render_runner()),
        Arc::new(FsAssets),
    );

    let id = scheduler.submit(&args.input, overlays).await?;
    info!(job_id = %id, "Submitted render job");

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut cancel_sent = false;
    let mut last_message = String::new();

    let status = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                info!("Received shutdown signal, cancelling job");
                cancel_sent = true;
                if let Err(e) = scheduler.cancel(&id).await {
                    warn!(job_id = %id, error = %e, "Failed to cancel job");
                }
            }
            _ = ticker.tick() => {
                let status = scheduler.get_status(&id).await?;
                if status.message != last_message {
                    info!(job_id = %id, state = %status.state, "{}", status.message);
                    last_message = status.message.clone();
                }
                if status.state.is_terminal() {
                    break status;
                }
            }
        }
    };

    scheduler.shutdown().await;
    shutdown.cancel();
    sweeper_handle.await.ok();

    match status.state {
        JobState::Completed => {
            let output = scheduler.get_result(&id).await?;
            println!("{}", output.display());
            Ok(true)
        }
        state => {
            if let Some(err) = &status.error {
                if let Some(diagnostics) = &err.diagnostics {
                    eprintln!("{}", diagnostics);
                }
            }
            error!(job_id = %id, state = %state, "Render did not complete: {}", status.message);
            Ok(false)
        }
    }
}
