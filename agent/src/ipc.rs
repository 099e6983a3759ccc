//! Unix-socket IPC: the read-only health channel and the control channel.
//!
//! Both sockets speak one line-delimited exchange per connection: the client
//! writes a single request line, the agent answers with one JSON document
//! and closes. Health requests are served from cached snapshots so a slow
//! sampler can never block the portal; control requests are relayed to the
//! owning camera worker over its command channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::capture::{CameraCommand, CameraRegistry};
use crate::error::{AgentError, Result};
use crate::health::HealthState;
use crate::logging::FilterHandle;

/// Upper bound on one request/response exchange.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Bind a unix socket, replacing any stale file from a previous run.
fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| AgentError::Internal(format!("cannot bind {}: {}", path.display(), e)))?;

    // Owner and group only. Connecting needs write permission on the socket
    // file; the read-only guarantee of the health channel is protocol-level.
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
    Ok(listener)
}

/// Serve health snapshot requests: one of `full`, `cameras`, `threads`,
/// `system` per connection.
pub async fn run_health_socket(
    path: PathBuf,
    health: Arc<HealthState>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = bind_socket(&path)?;
    tracing::info!("Health socket listening at {}", path.display());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let health = health.clone();
                        tokio::spawn(async move {
                            let _ = tokio::time::timeout(
                                CONNECTION_TIMEOUT,
                                serve_health_connection(stream, health),
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Health socket accept failed: {}", e);
                    }
                }
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    Ok(())
}

async fn serve_health_connection(stream: UnixStream, health: Arc<HealthState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    let mut reader = BufReader::new(read_half);
    if reader.read_line(&mut line).await.is_err() {
        return;
    }
    let kind = line.trim();
    let reply = health.snapshot(if kind.is_empty() { "full" } else { kind }).await;
    let mut body = reply.to_string();
    body.push('\n');
    let _ = write_half.write_all(body.as_bytes()).await;
    let _ = write_half.shutdown().await;
}

/// Shared context for control-socket request dispatch.
#[derive(Clone)]
pub struct ControlContext {
    pub registry: CameraRegistry,
    pub filter: FilterHandle,
}

/// Serve portal-relayed control commands.
pub async fn run_control_socket(
    path: PathBuf,
    ctx: ControlContext,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = bind_socket(&path)?;
    tracing::info!("Control socket listening at {}", path.display());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let _ = tokio::time::timeout(
                                CONNECTION_TIMEOUT,
                                serve_control_connection(stream, ctx),
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Control socket accept failed: {}", e);
                    }
                }
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    Ok(())
}

async fn serve_control_connection(stream: UnixStream, ctx: ControlContext) {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    let mut reader = BufReader::new(read_half);
    if reader.read_line(&mut line).await.is_err() {
        return;
    }
    let reply = match serde_json::from_str::<serde_json::Value>(line.trim()) {
        Ok(request) => dispatch_control(&ctx, &request).await,
        Err(e) => json!({ "ok": false, "error": format!("bad request: {}", e) }),
    };
    let mut body = reply.to_string();
    body.push('\n');
    let _ = write_half.write_all(body.as_bytes()).await;
    let _ = write_half.shutdown().await;
}

/// Execute one control command and report the outcome.
pub async fn dispatch_control(ctx: &ControlContext, request: &serde_json::Value) -> serde_json::Value {
    let cmd = request["cmd"].as_str().unwrap_or("");
    match cmd {
        "capture" | "restart" | "set_position" => {
            let Some(camera_id) = request["camera"].as_str() else {
                return json!({ "ok": false, "error": "missing 'camera'" });
            };
            let command = match cmd {
                "capture" => CameraCommand::ForceCapture,
                "restart" => CameraCommand::Restart,
                _ => {
                    let Some(position) = request["position"].as_str() else {
                        return json!({ "ok": false, "error": "missing 'position'" });
                    };
                    CameraCommand::SetPosition(position.to_string())
                }
            };
            let registry = ctx.registry.read().await;
            match registry.get(camera_id) {
                Some(camera) => match camera.command_tx.try_send(command) {
                    Ok(()) => json!({ "ok": true }),
                    Err(e) => json!({
                        "ok": false,
                        "error": format!("camera '{}' not accepting commands: {}", camera_id, e),
                    }),
                },
                None => json!({ "ok": false, "error": format!("unknown camera '{}'", camera_id) }),
            }
        }
        "set_log_level" => {
            let Some(level) = request["level"].as_str() else {
                return json!({ "ok": false, "error": "missing 'level'" });
            };
            match crate::logging::set_level(&ctx.filter, level) {
                Ok(()) => json!({ "ok": true, "level": level }),
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            }
        }
        other => json!({ "ok": false, "error": format!("unknown command '{}'", other) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn health_socket_answers_one_request_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.sock");
        let health = Arc::new(HealthState::new(&MonitoringConfig::default()));
        let cancel = CancellationToken::new();

        let server = tokio::spawn(run_health_socket(
            path.clone(),
            health,
            cancel.clone(),
        ));
        // Wait for the socket file to appear.
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"system\n").await.unwrap();
        let mut reply = String::new();
        let mut reader = BufReader::new(&mut stream);
        reader.read_line(&mut reply).await.unwrap();

        let doc: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(doc["stale"], true, "no sampler ran, snapshot is stale");
        assert!(reply.len() < 64 * 1024, "responses stay under 64 KiB");

        cancel.cancel();
        let _ = server.await;
    }

    #[tokio::test]
    async fn unknown_camera_command_rejected() {
        let registry: CameraRegistry = Arc::new(RwLock::new(HashMap::new()));
        let (_filter_layer, filter) =
            tracing_subscriber::reload::Layer::new(tracing_subscriber::EnvFilter::new("info"));
        let ctx = ControlContext { registry, filter };

        let reply = dispatch_control(
            &ctx,
            &json!({ "cmd": "capture", "camera": "nope" }),
        )
        .await;
        assert_eq!(reply["ok"], false);
        assert!(reply["error"].as_str().unwrap().contains("unknown camera"));
    }

    #[tokio::test]
    async fn capture_command_reaches_worker_channel() {
        use crate::capture::{CameraCommand, CameraPublic};
        use crate::cameras::CameraStateTracker;
        use std::sync::atomic::AtomicBool;
        use std::sync::Mutex as StdMutex;

        let spec = crate::config::CameraSpec {
            id: "cam1".into(),
            kind: crate::config::CameraKind::Usb,
            device_path: None,
            device_index: Some(0),
            rtsp_url: None,
            address: None,
            port: 8000,
            username: None,
            password: None,
            resolution: [640, 480],
            fps: 30,
            capture_interval: 10,
            position: String::new(),
            buffer_size: 1,
            timeout: 5,
            auto_exposure: true,
            brightness: None,
            contrast: None,
            saturation: None,
        };
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let public = CameraPublic {
            spec,
            tracker: Arc::new(StdMutex::new(CameraStateTracker::new(
                "cam1",
                Duration::from_secs(10),
            ))),
            alive: Arc::new(AtomicBool::new(true)),
            position: Arc::new(StdMutex::new(String::new())),
            command_tx: tx,
        };
        let registry: CameraRegistry =
            Arc::new(RwLock::new(HashMap::from([("cam1".to_string(), public)])));
        let (_filter_layer, filter) =
            tracing_subscriber::reload::Layer::new(tracing_subscriber::EnvFilter::new("info"));
        let ctx = ControlContext { registry, filter };

        let reply = dispatch_control(&ctx, &json!({ "cmd": "capture", "camera": "cam1" })).await;
        assert_eq!(reply["ok"], true);
        assert!(matches!(rx.try_recv(), Ok(CameraCommand::ForceCapture)));

        let reply = dispatch_control(
            &ctx,
            &json!({ "cmd": "set_position", "camera": "cam1", "position": "north ridge" }),
        )
        .await;
        assert_eq!(reply["ok"], true);
        assert!(matches!(
            rx.try_recv(),
            Ok(CameraCommand::SetPosition(p)) if p == "north ridge"
        ));
    }

    #[tokio::test]
    async fn malformed_json_rejected() {
        let registry: CameraRegistry = Arc::new(RwLock::new(HashMap::new()));
        let (_l, filter) =
            tracing_subscriber::reload::Layer::new(tracing_subscriber::EnvFilter::new("info"));
        let ctx = ControlContext { registry, filter };
        let reply = dispatch_control(&ctx, &json!({ "cmd": "bogus" })).await;
        assert_eq!(reply["ok"], false);
    }
}
