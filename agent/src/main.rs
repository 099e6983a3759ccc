//! SAI-Cam agent entry point: wiring, signals, graceful shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use sai_cam_agent::capture::{CameraRegistry, CaptureCoordinator, CapturedFrame};
use sai_cam_agent::config::Config;
use sai_cam_agent::health::HealthState;
use sai_cam_agent::ipc::ControlContext;
use sai_cam_agent::logging::{self, FilterHandle};
use sai_cam_agent::storage::{PendingRef, StorageManager};
use sai_cam_agent::upload::UploadWorker;
use sai_cam_agent::{capture, health, ipc, watchdog};

#[derive(Parser, Debug)]
#[command(name = "saicam-agent", version, about = "SAI-Cam edge node agent")]
struct Cli {
    /// Path to the node configuration file.
    #[arg(long, default_value = "/etc/sai-cam/config.yaml")]
    config: PathBuf,

    /// Override the configured log level (WARNING, INFO, DEBUG).
    #[arg(long)]
    log_level: Option<String>,

    /// Initialize cameras, print a summary, and exit.
    #[arg(long)]
    dry_run: bool,

    /// Store images locally without uploading.
    #[arg(long)]
    local_save: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    let log_handles = logging::init(&config.logging)?;
    tracing::info!(
        "Starting SAI-Cam agent v{} (node {})",
        env!("CARGO_PKG_VERSION"),
        config.device.id
    );

    if cli.dry_run {
        let ok = capture::dry_run(&config).await;
        if ok {
            tracing::info!("Dry run completed successfully");
            return Ok(());
        }
        anyhow::bail!("dry run failed: one or more cameras did not initialize");
    }
    if cli.local_save {
        tracing::info!("Upload disabled, running in local save mode");
    }

    // Storage must be writable before anything starts.
    let storage = Arc::new(StorageManager::new(&config.storage).await?);

    let grace = Duration::from_secs(config.advanced.shutdown_grace.max(1));
    let health_socket = config.advanced.health_socket.clone();
    let control_socket = config.advanced.control_socket.clone();
    let server_cfg = config.server.clone();

    let cancel = CancellationToken::new();
    let config = Arc::new(RwLock::new(config));
    let health_state = Arc::new(HealthState::new(&config.read().await.monitoring));
    let registry: CameraRegistry = Arc::new(RwLock::new(HashMap::new()));

    let (frame_tx, frame_rx) = mpsc::channel::<CapturedFrame>(64);
    let (upload_tx, upload_rx) = mpsc::channel::<PendingRef>(1000);

    // Storage ingest: capture workers -> disk -> upload queue.
    tokio::spawn(ingest_loop(frame_rx, storage.clone(), upload_tx));

    // Upload worker, rehydrating whatever a previous run left behind.
    let backlog = storage.scan_pending().await;
    let upload_worker = UploadWorker::new(
        storage.clone(),
        config.clone(),
        &server_cfg,
        !cli.local_save,
    )?;
    tokio::spawn(upload_worker.run(backlog, upload_rx, cancel.clone(), grace));

    // Capture coordinator with its per-camera workers.
    let coordinator = CaptureCoordinator::new(
        config.clone(),
        registry.clone(),
        health_state.clone(),
        frame_tx,
        cancel.clone(),
    );
    let coordinator_handle = tokio::spawn(coordinator.run());

    // Health sampling and the IPC surface.
    tokio::spawn(health::run_system_sampler(
        health_state.clone(),
        config.clone(),
        storage.clone(),
        cancel.clone(),
    ));
    tokio::spawn(health::run_camera_refresher(
        health_state.clone(),
        registry.clone(),
        cancel.clone(),
    ));
    tokio::spawn(run_logged(ipc::run_health_socket(
        health_socket,
        health_state.clone(),
        cancel.clone(),
    )));
    tokio::spawn(run_logged(ipc::run_control_socket(
        control_socket,
        ControlContext {
            registry: registry.clone(),
            filter: log_handles.filter.clone(),
        },
        cancel.clone(),
    )));

    // Hourly retention/size cleanup.
    tokio::spawn(cleanup_loop(storage.clone(), cancel.clone()));

    // systemd integration.
    watchdog::notify_ready();
    tokio::spawn(watchdog::run(cancel.clone()));

    // Signal handling: TERM/INT stop, HUP reloads the runtime subset.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, shutting down");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
            _ = sighup.recv() => {
                reload_config(&cli.config, &config, &log_handles.filter).await;
            }
        }
    }

    cancel.cancel();
    if tokio::time::timeout(grace + Duration::from_secs(5), coordinator_handle)
        .await
        .is_err()
    {
        tracing::warn!("Forced exit: capture workers exceeded the grace period");
    }
    tracing::info!("Agent stopped");
    Ok(())
}

/// Persist captured frames and queue them for upload. Ends when the last
/// capture worker hangs up.
async fn ingest_loop(
    mut frame_rx: mpsc::Receiver<CapturedFrame>,
    storage: Arc<StorageManager>,
    upload_tx: mpsc::Sender<PendingRef>,
) {
    while let Some(frame) = frame_rx.recv().await {
        match storage
            .store(&frame.camera_id, &frame.jpeg, &frame.metadata, frame.captured_at)
            .await
        {
            Ok(pending) => {
                if upload_tx.try_send(pending).is_err() {
                    // The file is on disk and will be rehydrated next start.
                    tracing::warn!(
                        "Upload queue full, {} deferred to next run",
                        frame.camera_id
                    );
                }
            }
            Err(e) => {
                tracing::warn!("Dropping capture from {}: {}", frame.camera_id, e);
            }
        }
    }
}

async fn cleanup_loop(storage: Arc<StorageManager>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                if let Err(e) = storage.cleanup().await {
                    tracing::warn!("Storage cleanup failed: {}", e);
                }
            }
        }
    }
}

/// Re-read the config file and apply the runtime-reloadable subset. An
/// invalid file keeps the previous configuration.
async fn reload_config(path: &PathBuf, shared: &Arc<RwLock<Config>>, filter: &FilterHandle) {
    tracing::info!("SIGHUP received, reloading configuration");
    let newer = match Config::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Config reload failed, keeping previous configuration: {}", e);
            return;
        }
    };

    let mut cfg = shared.write().await;
    let outcome = cfg.apply_runtime_reload(newer);
    if outcome.applied.contains(&"logging.level") {
        if let Err(e) = logging::set_level(filter, &cfg.logging.level) {
            tracing::warn!("Could not apply reloaded log level: {}", e);
        }
    }
    if !outcome.applied.is_empty() {
        tracing::info!("Reloaded settings: {}", outcome.applied.join(", "));
    }
    for section in &outcome.requires_restart {
        tracing::warn!(
            "Section '{}' changed on disk but requires a restart to take effect",
            section
        );
    }
}

async fn run_logged(task: impl std::future::Future<Output = sai_cam_agent::Result<()>>) {
    if let Err(e) = task.await {
        tracing::error!("Background task failed: {}", e);
    }
}
