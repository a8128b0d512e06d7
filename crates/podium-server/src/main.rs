//! # Podium Server
//!
//! Real-time leaderboard server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! podium
//!
//! # Run with custom config
//! podium /path/to/podium.toml
//!
//! # Run with environment variables
//! PODIUM__PORT=8080 PODIUM__HOST=0.0.0.0 podium
//! ```

mod api;
mod config;
mod handlers;
mod metrics;
mod session;

use anyhow::{Context, Result};
use podium_core::{
    subscribe, EventLog, HistoryRecorder, HistoryService, Hub, LeaderboardService,
    MemoryEventLog, MemoryHistoryRepository, MemoryLeaderboardRepository, MemoryRankedStore,
    Outbox, ServiceConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::AppState;

/// How often the updates stream is trimmed and gauges are refreshed.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podium=info,podium_core=info,podium_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = config::Config::load(config_path.as_deref())?;

    info!("Starting Podium server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    // Backends
    let (hub, hub_task) = Hub::spawn(config.hub());
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
    let outbox = Arc::new(Outbox::new(config.outbox.capacity));
    let history = HistoryService::new(Arc::new(MemoryHistoryRepository::new()));
    let leaderboards = LeaderboardService::new(
        Arc::new(MemoryRankedStore::new()),
        log.clone(),
        Arc::new(hub.clone()),
        Arc::new(MemoryLeaderboardRepository::new()),
        outbox.clone(),
        ServiceConfig {
            updates_stream: config.stream.name.clone(),
            ..ServiceConfig::default()
        },
    );

    // Background work
    let recorder = subscribe(
        log.clone(),
        config.stream.name.clone(),
        config.stream.group.clone(),
        config.stream.consumer.clone(),
        Arc::new(HistoryRecorder::new(history.clone())),
        config.consumer(),
    )
    .await
    .context("Failed to start history consumer")?;
    let flusher = outbox.clone().spawn_flusher(
        log.clone(),
        Duration::from_millis(config.outbox.flush_interval_ms),
    );

    let listener = TcpListener::bind(config.bind_addr()?)
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;

    let state = Arc::new(AppState {
        config,
        hub: hub.clone(),
        leaderboards,
        history,
        outbox: outbox.clone(),
    });
    let (stop_maintenance, maintenance) = spawn_maintenance(state.clone(), log.clone());

    // Serve until a shutdown signal arrives
    let served = handlers::run_server(state, listener, shutdown_signal()).await;

    info!("Shutting down");
    let _ = stop_maintenance.send(true);
    hub.shutdown().await;
    if let Err(e) = hub_task.await {
        error!(error = %e, "Hub task panicked");
    }
    recorder.shutdown().await;
    flusher.shutdown().await;
    if let Err(e) = maintenance.await {
        error!(error = %e, "Maintenance task panicked");
    }
    if !outbox.is_empty() {
        warn!(pending = outbox.len(), "Events left unpublished at shutdown");
    }
    info!("Podium server stopped");

    served
}

/// Trim the updates stream and refresh gauges until told to stop.
fn spawn_maintenance(
    state: Arc<AppState>,
    log: Arc<dyn EventLog>,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = stopped.changed() => break,
                _ = ticker.tick() => {}
            }

            let stream = &state.config.stream.name;
            match log.trim(stream, state.config.stream.max_len).await {
                Ok(0) => {}
                Ok(dropped) => info!(stream = %stream, dropped, "Trimmed stream"),
                Err(e) => warn!(stream = %stream, error = %e, "Trim failed"),
            }
            metrics::set_hub_stats(&state.hub.stats());
            metrics::set_outbox_pending(state.outbox.len());
        }
    });
    (stop, task)
}

/// Resolve on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received ctrl-c"),
        () = terminate => info!("Received SIGTERM"),
    }
}
