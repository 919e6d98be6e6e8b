//! kpipe-worker - karaoke media pipeline
//!
//! Runs the stage workers (metadata, split, package, organize), the status
//! HTTP server, and one-shot intake and admin commands against the shared
//! SQLite Status Store and Stream Broker.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kpipe_common::config::PipelineConfig;
use kpipe_common::{FileStatus, StageKind};
use kpipe_worker::intake::EnqueueOutcome;
use kpipe_worker::{api, Pipeline};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for kpipe-worker
#[derive(Parser, Debug)]
#[command(name = "kpipe-worker")]
#[command(about = "Karaoke media pipeline worker")]
#[command(version)]
struct Args {
    /// TOML config file (defaults to ~/.config/kpipe/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root folder holding the database and artifact folders
    #[arg(short, long, global = true, env = "KPIPE_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Log filter, e.g. "info" or "kpipe_worker=debug"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run stage workers; `all` also starts the status server
    Run {
        #[arg(long, value_enum, default_value = "all")]
        stage: StageSelection,
    },
    /// Run only the status server
    Serve,
    /// Copy files into the queue and start them through the pipeline
    Enqueue {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Enqueue every new audio file in the input folder
    Scan {
        /// Folder to scan instead of the configured input folder
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Reset a file to queued and restart it
    Retry { filename: String },
    /// Print file records
    Status {
        /// Only files in this status
        #[arg(long)]
        status: Option<FileStatus>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StageSelection {
    Metadata,
    Split,
    Package,
    Organize,
    All,
}

impl StageSelection {
    fn kinds(self) -> Vec<StageKind> {
        match self {
            StageSelection::Metadata => vec![StageKind::Metadata],
            StageSelection::Split => vec![StageKind::Split],
            StageSelection::Package => vec![StageKind::Package],
            StageSelection::Organize => vec![StageKind::Organize],
            StageSelection::All => StageKind::ALL.to_vec(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    config.apply_env().context("Invalid environment override")?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config);

    info!("Starting kpipe-worker {}", env!("CARGO_PKG_VERSION"));

    let root = config.resolve_root_folder(args.root_folder.as_deref());
    let paths = config.resolve_paths(&root);
    info!("Root folder: {}", root.display());
    info!("Database: {}", paths.database.display());

    let pipeline = Pipeline::open(config, paths)
        .await
        .context("Failed to open pipeline database")?;

    match args.command {
        Command::Run { stage } => run(&pipeline, stage).await,
        Command::Serve => {
            let shutdown = CancellationToken::new();
            tokio::spawn(cancel_on_signal(shutdown.clone()));
            serve(&pipeline, shutdown).await
        }
        Command::Enqueue { paths } => {
            let intake = pipeline.intake();
            for path in paths {
                match intake.enqueue(&path).await {
                    Ok(EnqueueOutcome::Queued(name)) => println!("queued {}", name),
                    Ok(EnqueueOutcome::SkippedError(name)) => println!("skipped {} (in error, use retry)", name),
                    Ok(EnqueueOutcome::InPipeline(name, status)) => println!("skipped {} (already {})", name, status),
                    Err(e) => warn!(path = %path.display(), "Could not enqueue: {}", e),
                }
            }
            Ok(())
        }
        Command::Scan { input } => {
            let folder = input.unwrap_or_else(|| pipeline.paths().input.clone());
            let report = pipeline.intake().scan(&folder).await?;
            println!(
                "queued {}, skipped {}, failed {}",
                report.queued.len(),
                report.skipped,
                report.failed
            );
            Ok(())
        }
        Command::Retry { filename } => {
            pipeline.admin().retry(&filename).await?;
            println!("{} reset to queued", filename);
            Ok(())
        }
        Command::Status { status } => {
            let records = pipeline.store().list_all().await?;
            for record in records.iter().filter(|r| status.map_or(true, |s| r.status == s)) {
                match &record.last_error {
                    Some(err) => println!("{}\t{}\t[{}] {}", record.filename, record.status, err.stage, err.message),
                    None => println!("{}\t{}", record.filename, record.status),
                }
            }
            Ok(())
        }
    }
}

fn init_tracing(config: &PipelineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(pipeline: &Pipeline, selection: StageSelection) -> Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let mut workers = Vec::new();
    for kind in selection.kinds() {
        workers.push(pipeline.worker(kind).with_context(|| format!("Failed to set up {} stage", kind))?);
    }

    if selection == StageSelection::All {
        let (workers_done, server_done) = tokio::join!(
            pipeline.run_workers(workers, shutdown.clone()),
            serve(pipeline, shutdown.clone())
        );
        workers_done?;
        server_done?;
    } else {
        pipeline.run_workers(workers, shutdown).await?;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn serve(pipeline: &Pipeline, shutdown: CancellationToken) -> Result<()> {
    let server = &pipeline.config().server;
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .with_context(|| format!("Invalid server address {}:{}", server.host, server.port))?;

    let result = api::serve(addr, pipeline.app_state(), shutdown.clone())
        .await
        .with_context(|| format!("Status server on {} failed", addr));
    if result.is_err() {
        // Take the workers down with the server
        shutdown.cancel();
    }
    result
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current work");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing current work");
        },
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
