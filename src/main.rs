//! Geofence engine - device location intake and zone entry/exit alerts
//!
//! Module structure:
//! - `domain/` - Core types (Position, Zone, Transition, AlertEvent) and geodesy
//! - `store/` - Spatial store trait with memory and sqlite backends
//! - `services/` - Containment, transition detection, alert recording, workers
//! - `io/` - HTTP API, Prometheus formatting, alert egress
//! - `infra/` - Configuration and metrics

use anyhow::Context;
use clap::Parser;
use geofence_engine::infra::{Config, Metrics, StoreBackend};
use geofence_engine::io::{create_alert_egress, start_api_server, ApiState};
use geofence_engine::services::{
    create_geofence_workers, AlertRecorder, GeofenceEngine, Ingestor, TransitionDetector,
};
use geofence_engine::store::{MemoryStore, SpatialStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Geofence engine - evaluates device positions against circular zones
#[derive(Parser, Debug)]
#[command(name = "geofence-engine", version, about)]
struct Args {
    /// Path to TOML configuration file (else $CONFIG_FILE, else config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// Grace period for workers to drain their queues on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Alerts buffered for the egress writer
const EGRESS_BUFFER: usize = 1024;

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn SpatialStore>> {
    let store: Arc<dyn SpatialStore> = match config.store_backend() {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(
            SqliteStore::open(config.store_path())
                .with_context(|| format!("Failed to open sqlite store {}", config.store_path()))?,
        ),
    };
    Ok(store)
}

/// Create the configured seed zones when the store has none
async fn seed_zones(store: &dyn SpatialStore, config: &Config) -> anyhow::Result<()> {
    if config.seed_zones().is_empty() {
        return Ok(());
    }
    let existing = store.list_zones().await.context("Failed to list zones")?;
    if !existing.is_empty() {
        info!(zones = %existing.len(), "zone_seed_skipped");
        return Ok(());
    }
    for zone in config.seed_zones() {
        let zone = store.create_zone(zone.clone()).await.context("Failed to seed zone")?;
        info!(zone_id = %zone.zone_id, name = %zone.name, radius_m = %zone.radius_meters, "zone_seeded");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git = %env!("GIT_HASH"), "geofence-engine starting");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Config::default_config_path());
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        http = %format!("{}:{}", config.http_bind_address(), config.http_port()),
        store = %config.store_backend().as_str(),
        store_path = %config.store_path(),
        store_timeout_ms = %config.store_timeout_ms(),
        workers = %config.geofence_workers(),
        queue_capacity = %config.geofence_queue_capacity(),
        egress = ?config.alerts_egress_file(),
        "config_loaded"
    );

    let store = open_store(&config)?;
    seed_zones(store.as_ref(), &config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let store_timeout = Duration::from_millis(config.store_timeout_ms());

    // Geofence evaluation pipeline
    let mut recorder = AlertRecorder::new(store.clone(), store_timeout, metrics.clone());
    let mut egress_handle = None;
    if let Some(path) = config.alerts_egress_file() {
        let (egress, writer) = create_alert_egress(path, EGRESS_BUFFER);
        egress_handle = Some(tokio::spawn(writer.run()));
        recorder = recorder.with_egress(egress);
    }
    let engine = Arc::new(GeofenceEngine::new(
        TransitionDetector::new(store.clone(), store_timeout, metrics.clone()),
        recorder,
        metrics.clone(),
    ));
    let (dispatcher, workers) = create_geofence_workers(
        engine,
        metrics.clone(),
        config.geofence_workers(),
        config.geofence_queue_capacity(),
    );
    let worker_handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

    let ingestor =
        Arc::new(Ingestor::new(store.clone(), Arc::new(dispatcher), metrics.clone(), store_timeout));

    // HTTP API
    let api_state = Arc::new(ApiState {
        store,
        ingestor,
        metrics: metrics.clone(),
        site_id: config.site_id().to_string(),
        store_timeout,
    });
    let bind_address = config.http_bind_address().to_string();
    let http_port = config.http_port();
    let api_shutdown = shutdown_rx.clone();
    let mut api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(&bind_address, http_port, api_state, api_shutdown).await {
            error!(error = %e, "api_server_error");
        }
    });

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut metrics_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = metrics_shutdown.changed() => break,
            }
        }
    });

    let api_exited = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
            false
        }
        _ = &mut api_handle => {
            warn!("api_server_exited");
            true
        }
    };
    let _ = shutdown_tx.send(true);
    if !api_exited {
        let _ = api_handle.await;
    }

    // Workers stop once the last dispatcher handle (held by the API state) is gone
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        for handle in worker_handles {
            let _ = handle.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("geofence_workers_drain_timeout");
    }

    // The writer finishes once the recorder (owned by the workers) is dropped
    if let Some(handle) = egress_handle {
        if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("alert_egress_drain_timeout");
        }
    }

    metrics.report().log();
    info!("geofence-engine shutdown complete");
    Ok(())
}
