//! # Ethos Transcriber - Worker Entry Point
//!
//! Long-lived transcription worker driven by its host application over stdio.
//! The host writes JSON commands to our stdin and reads JSON events from our
//! stdout; logs go to stderr so they never mix with the protocol.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **protocol** / **channel**: control message shapes and the stdio framing
//! - **queue**: the single-threaded queue loop that owns all job state
//! - **pipeline**: normalize → recognize → cleanup for one job
//! - **process**: supervision of one external engine process
//! - **events**: job transitions turned into outbound messages
//! - **job**, **state**, **error**: records, counters, error taxonomy

mod channel;
mod config;
mod error;
mod events;
mod job;
mod pipeline;
mod process;
mod protocol;
mod queue;
mod state;

use anyhow::Result;
use crate::config::{AppConfig, LoggingConfig};
use crate::queue::{Orchestrator, OrchestratorEvent};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for background tasks once the queue loop has finished.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Load configuration, set up logging, and run the queue loop to completion.
///
/// The runtime is built by hand so that a stdin read still parked on the
/// blocking pool cannot keep the process alive after the loop has finished.
fn main() -> Result<()> {
    // .ok(): a missing .env file is fine
    dotenv::dotenv().ok();

    let config = AppConfig::load()?;
    init_tracing(&config.logging)?;
    config.validate()?;

    info!("Starting ethos-transcriber v{}", env!("CARGO_PKG_VERSION"));
    info!(
        ffmpeg = %config.transcriber.ffmpeg_path,
        python = %config.transcriber.python_path,
        models = %config.transcriber.models_root,
        stage_timeout_secs = config.queue.stage_timeout_secs,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(config));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run(config: AppConfig) -> Result<()> {
    let (emitter, writer) = channel::spawn_emitter(tokio::io::stdout());
    let orchestrator = Orchestrator::new(&config, emitter);
    let events = orchestrator.sender();

    channel::spawn_reader(tokio::io::stdin(), events.clone());
    setup_signal_handlers(events)?;

    let metrics = orchestrator.run().await;

    // The loop owned the last emitter; the writer ends once everything is flushed.
    if tokio::time::timeout(SHUTDOWN_GRACE, writer).await.is_err() {
        warn!("Control channel writer did not finish in time");
    }

    info!(
        finished = metrics.finished(),
        failure_rate = metrics.failure_rate(),
        "Worker stopped"
    );
    Ok(())
}

/// Set up structured logging on stderr.
///
/// `RUST_LOG` wins over the configured filter.
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging.filter))?;

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(())
}

/// Translate SIGTERM / SIGINT into a shutdown event for the queue loop.
fn setup_signal_handlers(events: mpsc::UnboundedSender<OrchestratorEvent>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        let _ = events.send(OrchestratorEvent::Shutdown);
    });

    Ok(())
}
