//! Shared portal application state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::PortalConfig;

/// Reload handle for the portal's own log filter.
pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

pub struct PortalState {
    pub config: RwLock<PortalConfig>,
    pub config_path: PathBuf,
    /// Fan-out of freshly tailed agent log lines to SSE subscribers.
    pub log_tx: broadcast::Sender<String>,
    /// Operator-facing level last applied through the API.
    pub log_level: RwLock<String>,
    pub filter: FilterHandle,
    pub started: Instant,
}

pub type SharedState = Arc<PortalState>;

impl PortalState {
    pub fn new(config: PortalConfig, config_path: PathBuf, filter: FilterHandle) -> SharedState {
        let (log_tx, _) = broadcast::channel(256);
        let level = config.logging.level.clone();
        Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            log_tx,
            log_level: RwLock::new(level),
            filter,
            started: Instant::now(),
        })
    }
}
