//! Portal entry point.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sai_cam_portal::config::PortalConfig;
use sai_cam_portal::state::PortalState;
use sai_cam_portal::{events, routes};

#[derive(Parser, Debug)]
#[command(name = "saicam-portal", version, about = "SAI-Cam node status portal")]
struct Cli {
    /// Path to the node configuration file.
    #[arg(long, default_value = "/etc/sai-cam/config.yaml")]
    config: PathBuf,

    /// Override the configured bind address.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = PortalConfig::load(&cli.config)?;

    let directive = match config.logging.level.to_ascii_uppercase().as_str() {
        "WARNING" | "WARN" => "warn",
        "DEBUG" => "debug",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let (filter_layer, filter_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let host = cli.host.unwrap_or_else(|| config.portal.host.clone());
    let port = cli.port.unwrap_or(config.portal.port);
    let assets_dir = config.portal.assets_dir.clone();
    let log_path = config.logging.log_path();

    tracing::info!(
        "Starting SAI-Cam portal v{} (node {})",
        env!("CARGO_PKG_VERSION"),
        config.device.id
    );

    let state = PortalState::new(config, cli.config.clone(), filter_handle);
    let cancel = CancellationToken::new();

    // Tail the agent log into the SSE fan-out.
    tokio::spawn(events::run_log_tailer(
        log_path,
        state.log_tx.clone(),
        cancel.clone(),
    ));

    let app = routes::build_router(state, assets_dir);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    tracing::info!("Portal stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("signal handler");
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
    }
    cancel.cancel();
}
