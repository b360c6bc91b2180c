use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use zombie_sweeper::cleaner::Cleaner;
use zombie_sweeper::config::{Config, LoggerConfig};
use zombie_sweeper::detector::{Detector, TimeoutLedger};
use zombie_sweeper::metrics::{self, Metrics};
use zombie_sweeper::proc::ProcfsSource;
use zombie_sweeper::runtime;
use zombie_sweeper::shim::HostShimKiller;

/// Upper bound on graceful shutdown after SIGINT/SIGTERM.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Zombie-process cleaner for container hosts
#[derive(Parser, Debug)]
#[command(name = "zombie-sweeper")]
#[command(about = "Detects zombie processes and removes the containers that spawned them")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "/etc/zombie-sweeper/config.yaml")]
    config: String,
}

/// RUST_LOG takes precedence; otherwise the configured level seeds the filter.
fn init_tracing(cfg: &LoggerConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    match &cfg.output_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file '{path}'"))?;
            let writer = std::sync::Mutex::new(file);
            if cfg.format == "json" {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(writer)
                    .init();
            }
        }
        None => {
            if cfg.format == "json" {
                tracing_subscriber::fmt().with_env_filter(filter).json().init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = Config::load(&args.config).context("loading configuration")?;
    init_tracing(&cfg.logger)?;

    tracing::info!(
        config = %args.config,
        node = %metrics::node_name(),
        "Starting zombie-sweeper"
    );

    let metrics = Arc::new(Metrics::new()?);
    if cfg.metrics.enabled {
        let server_metrics = metrics.clone();
        let port = cfg.metrics.port;
        let path = cfg.metrics.path.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(server_metrics, port, &path).await {
                tracing::error!(error = %e, "Metrics server failed");
            }
        });
        tracing::info!(port = port, "Metrics enabled");
    }

    let ledger = TimeoutLedger::new();
    let runtime = runtime::connect(
        cfg.cleaner.container_runtime,
        cfg.cleaner.container_timeout(),
        ledger.clone().callback(),
    )
    .await
    .context("connecting to container runtime")?;

    let detector = Arc::new(Detector::new(
        Arc::new(ProcfsSource),
        runtime.clone(),
        metrics.clone(),
        cfg.cleaner.max_concurrent_containers,
        cfg.cleaner.process_timeout(),
        ledger,
    ));
    let cleaner = Cleaner::new(
        cfg.cleaner.clone(),
        detector,
        runtime,
        Arc::new(HostShimKiller),
        metrics,
    );

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn(cleaner.clone().run(cancel.clone()));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }

    cancel.cancel();
    cleaner.shutdown(SHUTDOWN_DEADLINE).await;
    let _ = loop_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
