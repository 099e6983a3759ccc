//! Client side of the agent's unix-socket IPC.
//!
//! One connection per request: write a single line, read one JSON document,
//! done. The health socket serves cached snapshots; the control socket
//! relays camera commands to the owning worker.

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{PortalError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

async fn round_trip(socket: &Path, line: &str) -> Result<serde_json::Value> {
    let exchange = async {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            PortalError::AgentUnavailable(format!("{}: {}", socket.display(), e))
        })?;
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| PortalError::AgentUnavailable(e.to_string()))?;

        let mut reply = String::new();
        BufReader::new(read_half)
            .read_line(&mut reply)
            .await
            .map_err(|e| PortalError::AgentUnavailable(e.to_string()))?;
        serde_json::from_str(reply.trim())
            .map_err(|e| PortalError::AgentUnavailable(format!("bad reply: {}", e)))
    };
    tokio::time::timeout(REQUEST_TIMEOUT, exchange)
        .await
        .map_err(|_| PortalError::AgentUnavailable("request timed out".to_string()))?
}

/// Fetch one health snapshot kind: `full`, `cameras`, `threads` or `system`.
pub async fn health(socket: &Path, kind: &str) -> Result<serde_json::Value> {
    round_trip(socket, kind).await
}

/// Send one control command and surface the agent's verdict.
pub async fn control(socket: &Path, request: serde_json::Value) -> Result<serde_json::Value> {
    let reply = round_trip(socket, &request.to_string()).await?;
    if reply["ok"].as_bool().unwrap_or(false) {
        Ok(reply)
    } else {
        let message = reply["error"].as_str().unwrap_or("command rejected");
        if message.contains("unknown camera") {
            Err(PortalError::NotFound(message.to_string()))
        } else {
            Err(PortalError::BadRequest(message.to_string()))
        }
    }
}

/// Convenience constructors for the control verbs the portal uses.
pub fn capture_cmd(camera_id: &str) -> serde_json::Value {
    json!({ "cmd": "capture", "camera": camera_id })
}

pub fn restart_cmd(camera_id: &str) -> serde_json::Value {
    json!({ "cmd": "restart", "camera": camera_id })
}

pub fn set_position_cmd(camera_id: &str, position: &str) -> serde_json::Value {
    json!({ "cmd": "set_position", "camera": camera_id, "position": position })
}

pub fn set_log_level_cmd(level: &str) -> serde_json::Value {
    json!({ "cmd": "set_log_level", "level": level })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_socket_maps_to_unavailable() {
        let err = health(Path::new("/nonexistent/health.sock"), "full")
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::AgentUnavailable(_)));
    }

    #[test]
    fn command_shapes() {
        assert_eq!(capture_cmd("cam1")["cmd"], "capture");
        assert_eq!(set_position_cmd("cam1", "ridge")["position"], "ridge");
        assert_eq!(set_log_level_cmd("DEBUG")["level"], "DEBUG");
    }
}
