//! systemd readiness and watchdog notifications.
//!
//! The protocol is a single datagram line on `$NOTIFY_SOCKET`; no library
//! needed. When the unit has no watchdog configured this module does nothing.

use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Send one notification line, best-effort.
fn notify(message: &str) {
    let Some(socket_path) = std::env::var_os("NOTIFY_SOCKET") else {
        return;
    };
    let path = std::path::PathBuf::from(&socket_path);
    if path.to_string_lossy().starts_with('@') {
        // Abstract-namespace sockets are not used by our units.
        tracing::debug!("Abstract NOTIFY_SOCKET unsupported, skipping notification");
        return;
    }
    let Ok(socket) = UnixDatagram::unbound() else {
        return;
    };
    if let Err(e) = socket.send_to(message.as_bytes(), &path) {
        tracing::debug!("sd_notify '{}' failed: {}", message, e);
    }
}

/// Tell systemd startup finished.
pub fn notify_ready() {
    notify("READY=1");
}

/// Heartbeat loop: `WATCHDOG=1` every half watchdog interval. Returns
/// immediately when the unit has no watchdog.
pub async fn run(cancel: CancellationToken) {
    let usec: u64 = std::env::var("WATCHDOG_USEC")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if usec == 0 {
        tracing::info!("systemd watchdog not enabled");
        return;
    }
    let interval = Duration::from_micros(usec / 2);
    tracing::info!("systemd watchdog enabled, heartbeat every {:?}", interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => notify("WATCHDOG=1"),
        }
    }
}
