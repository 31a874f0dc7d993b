//! ==============================================================================
//! main.rs - telemetry pipeline entry point
//! ==============================================================================
//!
//! purpose:
//!     starts the simulated sensor fleet, the storage writer, the live
//!     broker and the dashboard api, then waits for ctrl-c.
//!
//! responsibilities:
//!     - parse cli flags and load host.toml
//!     - initialize tracing
//!     - wire registry, batch writer and broker into one pipeline
//!     - run one scheduler task per sensor
//!     - serve the rest api and websocket endpoint
//!     - shut down in order: api, scheduler, writer, broker
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                     tokio runtime                            │
//!     │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//!     │  │ scheduler   │  │ web server  │  │ batch writer        │  │
//!     │  │ (per sensor)│  │ (axum)      │  │ (age ticker+flusher)│  │
//!     │  └──────┬──────┘  └──────┬──────┘  └──────────┬──────────┘  │
//!     │         │ dispatch       │ reads              │ writes      │
//!     │         ▼                ▼                    ▼             │
//!     │   registry / broker ◄── ws clients       storage sink       │
//!     └─────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use smarthome_telemetry::batch::{BatchWriter, WriterEvent};
use smarthome_telemetry::broker::SubscriptionBroker;
use smarthome_telemetry::config::HostConfig;
use smarthome_telemetry::pipeline::Pipeline;
use smarthome_telemetry::registry::ReadingRegistry;
use smarthome_telemetry::scheduler::IngestionScheduler;
use smarthome_telemetry::server::{self, AppState};
use smarthome_telemetry::{logging, sink};

/// Smart home telemetry ingestion and broadcast pipeline
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// path to host.toml (default: config/host.toml or ../config/host.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// seed the sensor simulation for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// override [server] port
    #[arg(short, long)]
    port: Option<u16>,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // step 1: load configuration
    let mut config = match &args.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::load_or_default()?,
    };
    if let Some(seed) = args.seed {
        config.simulation.seed = Some(seed);
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    logging::init(&config.logging)?;
    config.log_summary();

    // step 2: storage and pipeline
    let sink = sink::from_config(&config.storage)?;
    info!(sink = sink.name(), "storage sink ready");

    let registry = Arc::new(ReadingRegistry::new());
    let writer = Arc::new(BatchWriter::start(config.batching.to_batch_config(), sink));
    let broker = Arc::new(SubscriptionBroker::new(config.broker.subscriber_queue));
    let pipeline = Arc::new(Pipeline::new(
        registry.clone(),
        writer.clone(),
        broker.clone(),
        config.logging.show_sensor_data,
    ));
    tokio::spawn(log_writer_events(writer.events()));

    // step 3: sensor scheduler
    let scheduler = Arc::new(IngestionScheduler::from_config(&config, pipeline));
    scheduler.start();

    // step 4: web server in background
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.server.host, config.server.port))?;
    let state = AppState::new(
        registry,
        broker.clone(),
        writer.clone(),
        scheduler.clone(),
        config.broker.subscriber_queue,
    );
    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async {
            let _ = server_stopped.await;
        };
        if let Err(e) = server::run_server(addr, state, shutdown).await {
            error!(error = %e, "web server error");
        }
    });

    // step 5: wait for ctrl-c, then drain
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    let timeout = Duration::from_secs(config.simulation.shutdown_timeout_secs);
    let _ = stop_server.send(());
    if let Err(e) = scheduler.stop(timeout).await {
        warn!(error = %e, "scheduler did not stop cleanly");
    }
    if let Err(e) = writer.close(timeout).await {
        warn!(error = %e, "batch writer did not drain cleanly");
    }
    broker.close();
    let _ = tokio::time::timeout(timeout, server).await;

    let stats = writer.stats();
    info!(
        flushed_points = stats.flushed_points,
        dropped_points = stats.dropped_points,
        "shutdown complete"
    );
    Ok(())
}

/// storage outcomes at debug level; drops are already logged as errors by the writer
async fn log_writer_events(mut events: broadcast::Receiver<WriterEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(?event, "writer event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "writer event log lagging"),
            Err(RecvError::Closed) => break,
        }
    }
}
