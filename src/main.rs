mod config;
mod encoder;
mod error;
mod fetch;
mod queue;
mod server;
mod subtitle;
mod supervisor;
mod utils;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use config::AppConfig;
use queue::{JobScheduler, JobStatus, JobStore, Pipeline, SourceRef, SubmitRequest, SubtitleMode};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::DependencyStatus;

#[derive(Parser)]
#[command(name = "subforge", version, about = "Subtitle embedding and multi-resolution transcoding service")]
struct Cli {
    /// Config file, defaults to the user config directory
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API
    Serve,
    /// Process one job from the command line and wait for it
    Run {
        /// Video URL or local path
        #[arg(long)]
        video: String,
        /// Subtitle URL or local path
        #[arg(long)]
        subtitle: String,
        /// Target resolution, repeatable; all configured when omitted
        #[arg(short, long = "resolution")]
        resolutions: Vec<String>,
        /// Burn subtitles into the picture instead of adding a track
        #[arg(long)]
        hard: bool,
    },
    /// Check that ffmpeg and ffprobe can be run
    Check,
    /// Print the config path and resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = AppConfig::load(cli.config.as_deref());

    match cli.command {
        Command::Check => {
            let status = DependencyStatus::check(&config.ffmpeg);
            println!("{}", status.report());
            Ok(if status.all_present() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Config => {
            let path = cli.config.unwrap_or_else(AppConfig::config_path);
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => {
            let (scheduler, _guard) = start(config)?;
            serve(scheduler).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            video,
            subtitle,
            resolutions,
            hard,
        } => {
            let (scheduler, _guard) = start(config)?;
            let request = SubmitRequest {
                video: SourceRef::parse(&video),
                subtitle: SourceRef::parse(&subtitle),
                resolutions,
                subtitle_mode: hard.then_some(SubtitleMode::Hard),
                job_id: None,
            };
            run_once(scheduler, request).await
        }
    }
}

/// Shared startup of `serve` and `run`: logging, directories, persisted jobs
fn start(
    config: AppConfig,
) -> anyhow::Result<(JobScheduler, Option<tracing_appender::non_blocking::WorkerGuard>)> {
    config.validate()?;
    let guard = utils::init_logging(&config.paths.logs);
    config
        .ensure_directories()
        .context("Failed to create working directories")?;

    let deps = DependencyStatus::check(&config.ffmpeg);
    if !deps.all_present() {
        warn!(
            "Missing dependencies: {}. Jobs will fail until they are installed",
            deps.missing().join(", ")
        );
    }

    let store = JobStore::load_and_reconcile(config.paths.state_file())
        .context("Failed to load job state")?;
    info!("Loaded {} job record(s)", store.list().len());

    let pipeline = Pipeline::from_config(config, Arc::new(store))?;
    Ok((JobScheduler::new(pipeline), guard))
}

async fn serve(scheduler: JobScheduler) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        trigger.cancel();
    });

    server::serve(server::AppState::new(scheduler.clone()), shutdown).await?;

    // Leave no orphaned ffmpeg behind and record the job as cancelled
    if let Some(id) = scheduler.running_job_id() {
        info!("Cancelling running job {}", id);
        if scheduler.cancel(&id).is_ok() {
            let _ = tokio::time::timeout(
                Duration::from_secs(10),
                scheduler.wait_for(&id, Duration::from_millis(100)),
            )
            .await;
        }
    }
    Ok(())
}

async fn run_once(scheduler: JobScheduler, request: SubmitRequest) -> anyhow::Result<ExitCode> {
    let id = match scheduler.submit(request) {
        Ok(id) => id,
        Err(e) => bail!("Job rejected: {}", e),
    };
    println!("Job {}", id);

    let canceller = scheduler.clone();
    let cancel_id = id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            let _ = canceller.cancel(&cancel_id);
        }
    });

    let mut last = String::new();
    let job = loop {
        let job = scheduler.status(&id)?;
        if job.is_terminal() && scheduler.running_job_id().as_deref() != Some(id.as_str()) {
            break job;
        }
        if let Some(progress) = &job.progress {
            let line = format!("[{:>3}%] {}", progress.percentage, job.stage);
            if line != last {
                println!("{}", line);
                last = line;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    match job.elapsed() {
        Some(took) => println!("Job {} {:?} after {}s", id, job.status, took.num_seconds()),
        None => println!("Job {} {:?}", id, job.status),
    }
    for (resolution, path) in &job.outputs {
        println!("  {}: {}", resolution, path.display());
    }
    for (key, error) in &job.errors {
        match &error.hint {
            Some(hint) => println!("  {} failed: {} ({})", key, error.message, hint),
            None => println!("  {} failed: {}", key, error.message),
        }
    }

    Ok(if job.status == JobStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
