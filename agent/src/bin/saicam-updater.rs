//! Periodic self-update oneshot, invoked by the host timer.
//!
//! Exit codes: 0 when up-to-date, deferred, or successfully applied;
//! 1 on any failure recorded in the update-state file.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sai_cam_agent::config::{parse_level, Config};
use sai_cam_agent::update::{UpdateController, UpdaterOptions};

#[derive(Parser, Debug)]
#[command(name = "saicam-updater", version, about = "SAI-Cam self-update controller")]
struct Cli {
    /// Path to the node configuration file.
    #[arg(long, default_value = "/etc/sai-cam/config.yaml")]
    config: PathBuf,

    /// Ignore the enable flag and the three-strike guard.
    #[arg(long)]
    force: bool,

    /// Check the release index and record what is available, without
    /// fetching or applying anything.
    #[arg(long)]
    check_only: bool,

    /// Override the update-state file location.
    #[arg(long)]
    state_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(path) = cli.state_path {
        config.updates.state_path = path;
    }

    let directive = parse_level(&config.logging.level).unwrap_or("info");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let controller = UpdateController::new(config)?;
    let code = controller
        .run(&UpdaterOptions {
            force: cli.force,
            check_only: cli.check_only,
        })
        .await;
    std::process::exit(code);
}
