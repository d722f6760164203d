//! droidfarm controller
//!
//! Runs the farm, device and device-job reconcilers against an in-process
//! control plane, optionally seeded from a JSON manifest.

use std::sync::Arc;

use anyhow::Result;
use droidfarm_controller::{
    adb::{Adb, AdbDeviceControl},
    config::{load_manifest, seed, Config},
    jobs::TtlSweeper,
    registry::LoggingRegistry,
    Client, DeviceJobRunner, DeviceReconciler, Dispatcher, FarmReconciler, MemoryControlPlane,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to DROIDFARM_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting droidfarm controller");
    info!(
        resync_secs = config.resync_interval.as_secs(),
        max_concurrent_reconciles = config.max_concurrent_reconciles,
        adb_path = %config.adb_path.display(),
        "Configuration loaded"
    );

    let control_plane = Arc::new(MemoryControlPlane::new());
    if let Some(path) = &config.manifest {
        let objects = load_manifest(path)?;
        let seeded = seed(control_plane.as_ref(), objects).await?;
        info!(seeded, manifest = %path.display(), "Control plane seeded");
    }
    let client = Client::new(control_plane);

    let devices = Arc::new(AdbDeviceControl::new(Adb::new(
        config.adb_path.clone(),
        config.adb_timeout,
    )));
    let registry = Arc::new(LoggingRegistry);

    let dispatcher = Dispatcher::new(
        client.clone(),
        &config.dispatcher(),
        Arc::new(FarmReconciler::new(client.clone(), registry.clone())),
        Arc::new(DeviceReconciler::new(
            client.clone(),
            devices.clone(),
            registry,
        )),
        Arc::new(DeviceJobRunner::new(client.clone(), devices)),
    );
    if let Err(e) = dispatcher.router().resync().await {
        warn!(error = %e, "Initial resync failed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            dispatcher.run(shutdown_rx).await;
        }
    });

    let sweeper = TtlSweeper::new(client, config.job_ttl_sweep_interval);
    let sweeper_handle = tokio::spawn(async move {
        sweeper.run(shutdown_rx).await;
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        info!("Received shutdown signal");
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, dispatcher_handle).await {
        warn!(error = %e, "Dispatcher did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, sweeper_handle).await {
        warn!(error = %e, "TTL sweeper did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
