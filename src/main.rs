//! ==============================================================================
//! main.rs - ground station host entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the pipeline together and owns process lifetime.
//!
//! responsibilities:
//!     - load host.toml (path from argv[1], else config/host.toml)
//!     - initialise tracing
//!     - open the serial port (or stdin with port = "-")
//!     - start the csv reading log on its own worker
//!     - serve viewers (websocket + dashboard) in the background
//!     - run the ingest loop until ctrl-c or the source ends
//!     - on the way out: close the reading log, stop the web server
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                      host (this file)                       │
//!     │  ┌─────────────┐   ┌─────────────┐   ┌──────────────────┐   │
//!     │  │ serial      │──►│ ingest loop │──►│ csv sink worker  │   │
//!     │  │ reader thr. │   │ (decode)    │   │ (spawn_blocking) │   │
//!     │  └─────────────┘   └──────┬──────┘   └──────────────────┘   │
//!     │                           │ publish                         │
//!     │                    ┌──────┴──────┐    ┌─────────────────┐   │
//!     │                    │  registry   │◄───│ web server      │   │
//!     │                    └──────┬──────┘    │ (port 3000)     │   │
//!     │                           │           └─────────────────┘   │
//!     └───────────────────────────┼─────────────────────────────────┘
//!                                 ▼ one queue per viewer
//!                           websocket viewers
//!
//! ==============================================================================

use anyhow::{Context, Result};
use groundstation_host::config::HostConfig;
use groundstation_host::server::{self, ServerState};
use groundstation_host::source;
use groundstation_host::{
    Broadcaster, CsvSink, IngestLoop, PacketDecoder, SchemaTable, SinkHandle, SubscriberRegistry,
    SystemClock,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const SERVER_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let (config, config_path) = HostConfig::discover(explicit)?;
    let config = config.with_env();

    // step 2: logging (RUST_LOG wins over logging.level)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.level))
        .context("invalid logging.level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("===========================================================");
    tracing::info!("  Ground Station Host v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("===========================================================");
    match &config_path {
        Some(path) => tracing::info!(path = %path.display(), "loaded config"),
        None => tracing::warn!("no config file found - using defaults"),
    }
    config.print_summary();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    tokio::spawn(forward_ctrl_c(tokio::signal::ctrl_c(), shutdown_tx.clone()));

    // step 3: open the line source
    let lines = if config.serial.is_stdin() {
        tracing::info!("reading packets from stdin");
        source::stdin_lines()
    } else {
        match source::serial_lines(&config.serial.port, config.serial.baud_rate) {
            Ok(lines) => lines,
            Err(e) => {
                source::log_available_ports();
                return Err(e).with_context(|| format!("cannot open {}", config.serial.port));
            }
        }
    };

    // step 4: reading log (failure here only disables logging)
    let schema = SchemaTable::default();
    let sink = if config.sink.enabled {
        match CsvSink::new(
            &config.sink.directory,
            config.sink.file_prefix.clone(),
            schema,
            chrono::Utc::now(),
        ) {
            Ok(csv) => Some(
                SinkHandle::spawn(csv, config.sink.buffer)
                    .with_close_timeout(Duration::from_secs(config.sink.close_timeout_secs)),
            ),
            Err(e) => {
                tracing::error!(error = %e, "reading log unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    // step 5: web server in background
    let registry = SubscriberRegistry::new(config.server.subscriber_queue);
    let state = ServerState { registry: registry.clone(), schema };
    let bind = config.server.bind.clone();
    let static_dir = config.server.static_dir.clone();
    let server_shutdown = wait_for_shutdown(shutdown_rx.clone());
    let web = tokio::spawn(async move {
        if let Err(e) = server::run_server(&bind, state, &static_dir, server_shutdown).await {
            tracing::error!(error = %e, "web server error");
        }
    });

    // step 6: ingest until ctrl-c or the source ends
    let decoder = PacketDecoder::new(schema)
        .with_prefixes(config.decoder.prefixes.clone())
        .with_policy(config.decoder.policy);
    let ingest = IngestLoop::new(decoder, Arc::new(SystemClock), Broadcaster::new(registry), sink)
        .show_sensor_data(config.logging.show_sensor_data);

    tracing::info!("listening for packets");
    tracing::info!("────────────────────────────────────────────────────────────");
    let result = ingest.run(lines, wait_for_shutdown(shutdown_rx)).await;

    // the sink is already closed here; stop the server too
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SERVER_DRAIN, web).await.is_err() {
        tracing::warn!("web server did not stop in time");
    }

    let stats = result.context("ingest stopped")?;
    tracing::info!(readings = stats.readings, errors = stats.errors, "bye");
    Ok(())
}

fn wait_for_shutdown(mut rx: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// turn the ctrl-c future into a shutdown request
async fn forward_ctrl_c<F>(signal: F, shutdown: Arc<watch::Sender<bool>>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            tracing::info!("received ctrl-c");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            // keep running; the host then stops only when the source ends
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}
