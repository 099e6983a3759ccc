//! HTTP handlers for the operator browser and the fleet API.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent_client;
use crate::error::{PortalError, Result};
use crate::state::SharedState;
use crate::wifi;

const PORTAL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimal dashboard served when no asset directory is configured.
pub async fn index() -> Html<&'static str> {
    Html(concat!(
        "<!doctype html><html><head><title>SAI-Cam node</title></head>",
        "<body><h1>SAI-Cam node</h1>",
        "<p>Status portal is up. See <code>/api/status</code> and <code>/api/events</code>.</p>",
        "</body></html>"
    ))
}

// ---------------------------------------------------------------------------
// Status composition
// ---------------------------------------------------------------------------

/// Full composed snapshot for the initial browser render.
pub async fn api_status(State(state): State<SharedState>) -> Result<Json<Value>> {
    Ok(Json(compose_status(&state).await))
}

pub async fn compose_status(state: &SharedState) -> Value {
    let cfg = state.config.read().await.clone();
    let agent = agent_client::health(&cfg.advanced.health_socket, "full")
        .await
        .unwrap_or_else(|e| json!({ "error": e.to_string() }));

    let wifi_ap = wifi::ap_info(&cfg.wifi_ap, &cfg.device.id).await;
    let features = json!({
        "cameras": !cfg.cameras.is_empty(),
        "wifi_ap": wifi_ap.is_some(),
        "storage": cfg.storage.base_path.exists(),
        "onvif": cfg.cameras.iter().any(|c| c.kind == "onvif"),
        "rtsp": cfg.cameras.iter().any(|c| c.kind == "rtsp"),
        "usb_camera": cfg.cameras.iter().any(|c| c.kind == "usb"),
    });

    json!({
        "node": {
            "id": cfg.device.id,
            "location": cfg.device.location,
            "description": cfg.device.description,
            "version": PORTAL_VERSION,
        },
        "features": features,
        "data": {
            "system": agent["system"].clone(),
            "cameras": agent["cameras"].clone(),
            "storage": agent["storage"].clone(),
            "network": network_info().await,
            "wifi_ap": wifi_ap,
            "update": update_info(&cfg.updates.state_path),
        },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Raw health snapshot straight off the agent socket.
pub async fn api_health(State(state): State<SharedState>) -> Result<Json<Value>> {
    let socket = state.config.read().await.advanced.health_socket.clone();
    Ok(Json(agent_client::health(&socket, "full").await?))
}

pub async fn api_status_cameras(State(state): State<SharedState>) -> Result<Json<Value>> {
    let socket = state.config.read().await.advanced.health_socket.clone();
    let snapshot = agent_client::health(&socket, "cameras").await?;
    Ok(Json(snapshot["cameras"].clone()))
}

pub async fn api_status_system(State(state): State<SharedState>) -> Result<Json<Value>> {
    let socket = state.config.read().await.advanced.health_socket.clone();
    let snapshot = agent_client::health(&socket, "system").await?;
    Ok(Json(snapshot["system"].clone()))
}

pub async fn api_status_network() -> Json<Value> {
    Json(network_info().await)
}

/// Interface addresses plus a best-effort upstream reachability probe.
pub async fn network_info() -> Value {
    let mut interfaces = serde_json::Map::new();
    let networks = sysinfo::Networks::new_with_refreshed_list();
    for (name, data) in networks.iter() {
        if name == "lo" || name.starts_with("docker") || name.starts_with("veth") {
            continue;
        }
        let ipv4 = data
            .ip_networks()
            .iter()
            .find(|ip| ip.addr.is_ipv4())
            .map(|ip| ip.addr.to_string());
        if let Some(ip) = ipv4 {
            interfaces.insert(
                name.clone(),
                json!({
                    "ip": ip,
                    "type": if name.starts_with("wl") { "wireless" } else { "ethernet" },
                }),
            );
        }
    }

    let upstream_online = tokio::time::timeout(
        Duration::from_secs(3),
        tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", "2", "8.8.8.8"])
            .output(),
    )
    .await
    .map(|r| r.map(|o| o.status.success()).unwrap_or(false))
    .unwrap_or(false);

    json!({
        "interfaces": interfaces,
        "upstream_online": upstream_online,
    })
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_lines")]
    pub lines: usize,
}

fn default_log_lines() -> usize {
    50
}

pub async fn api_logs(
    State(state): State<SharedState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>> {
    let path = state.config.read().await.logging.log_path();
    let lines = read_last_lines(&path, query.lines.min(2000)).await?;
    Ok(Json(json!({ "logs": lines })))
}

/// Last `count` lines of a file. The whole file is read; service logs are
/// size-capped by rotation so this stays small.
pub async fn read_last_lines(path: &Path, count: usize) -> Result<Vec<String>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(count);
    Ok(all[start..].iter().map(|s| s.to_string()).collect())
}

pub async fn get_log_level(State(state): State<SharedState>) -> Json<Value> {
    let level = state.log_level.read().await.clone();
    Json(json!({ "level": level }))
}

#[derive(Debug, Deserialize)]
pub struct LogLevelBody {
    pub level: String,
}

/// Change the level on both processes: the agent via its control socket and
/// the portal through its own reload handle.
pub async fn post_log_level(
    State(state): State<SharedState>,
    Json(body): Json<LogLevelBody>,
) -> Result<Json<Value>> {
    let level = body.level.to_ascii_uppercase();
    let directive = match level.as_str() {
        "WARNING" | "WARN" => "warn",
        "INFO" => "info",
        "DEBUG" => "debug",
        _ => {
            return Err(PortalError::BadRequest(format!(
                "level '{}' is not one of WARNING, INFO, DEBUG",
                body.level
            )))
        }
    };

    let socket = state.config.read().await.advanced.control_socket.clone();
    agent_client::control(&socket, agent_client::set_log_level_cmd(&level)).await?;

    if let Err(e) = state
        .filter
        .reload(tracing_subscriber::EnvFilter::new(directive))
    {
        tracing::warn!("Could not reload portal log filter: {}", e);
    }
    *state.log_level.write().await = level.clone();
    tracing::info!("Log level changed to {}", level);
    Ok(Json(json!({ "ok": true, "level": level })))
}

// ---------------------------------------------------------------------------
// Camera images and control
// ---------------------------------------------------------------------------

/// Most recent JPEG captured by one camera, searching both subtrees.
pub async fn latest_image(
    State(state): State<SharedState>,
    UrlPath(camera_id): UrlPath<String>,
) -> Result<Response> {
    if !camera_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PortalError::BadRequest("invalid camera id".to_string()));
    }

    let base = state.config.read().await.storage.base_path.clone();
    let mut newest: Option<(PathBuf, SystemTime)> = None;
    for subtree in ["pending", "uploaded"] {
        let root = base.join(subtree).join(&camera_id);
        newest_jpeg_under(&root, &mut newest).await;
    }

    let Some((path, _)) = newest else {
        return Err(PortalError::NotFound(format!(
            "no images for camera '{}'",
            camera_id
        )));
    };
    let bytes = tokio::fs::read(&path).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        bytes,
    )
        .into_response())
}

async fn newest_jpeg_under(root: &Path, newest: &mut Option<(PathBuf, SystemTime)>) {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if path.extension().map(|e| e == "jpg").unwrap_or(false) {
                if let Ok(meta) = entry.metadata().await {
                    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    if newest.as_ref().map(|(_, t)| modified > *t).unwrap_or(true) {
                        *newest = Some((path, modified));
                    }
                }
            }
        }
    }
}

pub async fn camera_capture(
    State(state): State<SharedState>,
    UrlPath(camera_id): UrlPath<String>,
) -> Result<Json<Value>> {
    let socket = state.config.read().await.advanced.control_socket.clone();
    agent_client::control(&socket, agent_client::capture_cmd(&camera_id)).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn camera_restart(
    State(state): State<SharedState>,
    UrlPath(camera_id): UrlPath<String>,
) -> Result<Json<Value>> {
    let socket = state.config.read().await.advanced.control_socket.clone();
    agent_client::control(&socket, agent_client::restart_cmd(&camera_id)).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct PositionBody {
    pub position: String,
}

pub async fn camera_position(
    State(state): State<SharedState>,
    UrlPath(camera_id): UrlPath<String>,
    Json(body): Json<PositionBody>,
) -> Result<Json<Value>> {
    let socket = state.config.read().await.advanced.control_socket.clone();
    agent_client::control(
        &socket,
        agent_client::set_position_cmd(&camera_id, &body.position),
    )
    .await?;
    Ok(Json(json!({ "ok": true, "position": body.position })))
}

// ---------------------------------------------------------------------------
// WiFi AP
// ---------------------------------------------------------------------------

pub async fn wifi_ap_enable(State(state): State<SharedState>) -> Result<Json<Value>> {
    let cfg = state.config.read().await.wifi_ap.clone();
    Ok(Json(wifi::set_enabled(&cfg, true).await?))
}

pub async fn wifi_ap_disable(State(state): State<SharedState>) -> Result<Json<Value>> {
    let cfg = state.config.read().await.wifi_ap.clone();
    Ok(Json(wifi::set_enabled(&cfg, false).await?))
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// The persisted update record plus a derived `update_available` flag.
pub fn update_info(state_path: &Path) -> Value {
    let mut doc: Value = std::fs::read(state_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_else(|| {
            json!({
                "status": "unknown",
                "current_version": "0.0.0",
                "latest_available": "",
                "consecutive_failures": 0,
                "channel": "stable",
            })
        });

    let current = doc["current_version"].as_str().unwrap_or("0.0.0");
    let latest = doc["latest_available"].as_str().unwrap_or("");
    let available = !latest.is_empty() && version_newer(current, latest);
    doc["update_available"] = Value::Bool(available);
    doc
}

/// Lenient semver comparison mirroring the updater's rules.
pub fn version_newer(current: &str, candidate: &str) -> bool {
    fn parse(raw: &str) -> Option<semver::Version> {
        let trimmed = raw.trim().trim_start_matches('v');
        if let Ok(v) = semver::Version::parse(trimmed) {
            return Some(v);
        }
        let (base, suffix) = match trimmed.find(['-', '+']) {
            Some(i) => (&trimmed[..i], &trimmed[i..]),
            None => (trimmed, ""),
        };
        let mut parts: Vec<&str> = base.split('.').collect();
        while parts.len() < 3 {
            parts.push("0");
        }
        if parts.len() > 3 {
            return None;
        }
        semver::Version::parse(&format!("{}{}", parts.join("."), suffix)).ok()
    }
    match (parse(current), parse(candidate)) {
        (Some(cur), Some(cand)) => cand > cur,
        _ => false,
    }
}

pub async fn update_status(State(state): State<SharedState>) -> Json<Value> {
    let path = state.config.read().await.updates.state_path.clone();
    Json(update_info(&path))
}

/// Run the updater in check-only mode and return the refreshed state.
pub async fn update_check(State(state): State<SharedState>) -> Result<Json<Value>> {
    let config_path = state.config_path.clone();
    let status = tokio::time::timeout(
        Duration::from_secs(90),
        tokio::process::Command::new("saicam-updater")
            .arg("--check-only")
            .arg("--config")
            .arg(&config_path)
            .status(),
    )
    .await
    .map_err(|_| PortalError::Internal("update check timed out".to_string()))?
    .map_err(|e| PortalError::Internal(format!("cannot run updater: {}", e)))?;

    if !status.success() {
        tracing::warn!("Update check exited with {}", status);
    }
    let path = state.config.read().await.updates.state_path.clone();
    Ok(Json(update_info(&path)))
}

// ---------------------------------------------------------------------------
// Sanitized configuration
// ---------------------------------------------------------------------------

/// The node configuration with secrets masked.
pub async fn api_config(State(state): State<SharedState>) -> Result<Json<Value>> {
    let text = tokio::fs::read_to_string(&state.config_path).await?;
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&text)
        .map_err(|e| PortalError::Internal(format!("config unreadable: {}", e)))?;
    mask_secrets(&mut doc);
    let json = serde_json::to_value(&doc)?;
    Ok(Json(json))
}

const SECRET_KEYS: [&str; 4] = ["password", "auth_token", "token", "rtsp_url"];

fn mask_secrets(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for (key, val) in map.iter_mut() {
                let is_secret = key
                    .as_str()
                    .map(|k| SECRET_KEYS.contains(&k))
                    .unwrap_or(false);
                if is_secret && val.is_string() {
                    *val = serde_yaml::Value::String("***".to_string());
                } else {
                    mask_secrets(val);
                }
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                mask_secrets(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_info_defaults_when_file_missing() {
        let doc = update_info(Path::new("/nonexistent/update-state.json"));
        assert_eq!(doc["status"], "unknown");
        assert_eq!(doc["update_available"], false);
    }

    #[test]
    fn update_info_flags_newer_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "status": "up_to_date",
                "current_version": "0.3.0",
                "latest_available": "0.4.0",
            }))
            .unwrap(),
        )
        .unwrap();
        let doc = update_info(&path);
        assert_eq!(doc["update_available"], true);

        std::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "status": "up_to_date",
                "current_version": "0.4.0",
                "latest_available": "0.4.0",
            }))
            .unwrap(),
        )
        .unwrap();
        assert_eq!(update_info(&path)["update_available"], false);
    }

    #[test]
    fn version_comparison_handles_prereleases() {
        assert!(version_newer("0.3.0", "0.4.0"));
        assert!(version_newer("0.3.0-beta.1", "0.3.0"));
        assert!(!version_newer("0.3.0", "0.3.0-beta.1"));
    }

    #[test]
    fn secrets_masked_recursively() {
        let mut doc: serde_yaml::Value = serde_yaml::from_str(
            r#"
server:
  url: https://inference.example/upload
  auth_token: super-secret
cameras:
  - id: cam1
    password: hunter2
    rtsp_url: rtsp://admin:pw@10.0.0.8/ch1
fleet:
  token: fleet-secret
"#,
        )
        .unwrap();
        mask_secrets(&mut doc);
        let text = serde_yaml::to_string(&doc).unwrap();
        assert!(!text.contains("super-secret"));
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("fleet-secret"));
        assert!(!text.contains("admin:pw"));
        assert!(text.contains("https://inference.example/upload"));
    }

    #[tokio::test]
    async fn last_lines_of_missing_file_is_empty() {
        let lines = read_last_lines(Path::new("/nonexistent/agent.log"), 50)
            .await
            .unwrap();
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn last_lines_returns_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let content: String = (1..=100).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, content).unwrap();
        let lines = read_last_lines(&path, 3).await.unwrap();
        assert_eq!(lines, vec!["line 98", "line 99", "line 100"]);
    }
}
