//! Fleet control API: bearer-token-guarded remote management endpoints.
//!
//! A central fleet tool can ping the node, read its status, mutate a
//! whitelisted subset of configuration keys, trigger update checks, and
//! restart the services. Without a configured token the whole surface is
//! disabled.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{PortalError, Result};
use crate::state::SharedState;

/// Config keys the agent applies on SIGHUP; everything else needs a restart.
const RUNTIME_KEY_PREFIXES: [&str; 5] = [
    "logging.level",
    "monitoring.",
    "server.url",
    "server.timeout",
    "server.auth_token",
];

/// Bearer-token guard for everything nested under `/api/fleet`.
pub async fn auth(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let expected = state.config.read().await.fleet.token.clone();
    let Some(expected) = expected else {
        return PortalError::NotFound("fleet API not configured on this node".to_string())
            .into_response();
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => PortalError::Unauthorized("invalid fleet token".to_string()).into_response(),
    }
}

pub async fn ping(State(state): State<SharedState>) -> Json<Value> {
    let cfg = state.config.read().await;
    Json(json!({
        "ok": true,
        "node_id": cfg.device.id,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started.elapsed().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConfigChange {
    pub key: String,
    pub value: serde_json::Value,
}

/// Mutate one whitelisted configuration key in the node's YAML file.
///
/// The file is edited raw (no environment expansion) so `${VAR}` references
/// survive the round trip. The portal reloads its own view; the agent picks
/// runtime keys up on SIGHUP and everything else on restart.
pub async fn set_config(
    State(state): State<SharedState>,
    Json(change): Json<ConfigChange>,
) -> Result<Json<Value>> {
    let allowed = {
        let cfg = state.config.read().await;
        key_allowed(&change.key, &cfg.fleet.allowed_config_keys)
    };
    if !allowed {
        return Err(PortalError::Unauthorized(format!(
            "config key '{}' is not in the fleet whitelist",
            change.key
        )));
    }

    let text = tokio::fs::read_to_string(&state.config_path).await?;
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&text)
        .map_err(|e| PortalError::Internal(format!("config unreadable: {}", e)))?;

    let value = serde_yaml::to_value(&change.value)
        .map_err(|e| PortalError::BadRequest(format!("unrepresentable value: {}", e)))?;
    set_nested(&mut doc, &change.key, value)?;

    let rendered = serde_yaml::to_string(&doc)
        .map_err(|e| PortalError::Internal(format!("config serialization failed: {}", e)))?;
    write_atomic(&state.config_path, rendered.as_bytes()).await?;

    // Refresh the portal's own view of the file.
    match crate::config::PortalConfig::from_yaml(&rendered) {
        Ok(newer) => *state.config.write().await = newer,
        Err(e) => tracing::warn!("Portal config refresh after fleet edit failed: {}", e),
    }

    let restart_required = !RUNTIME_KEY_PREFIXES
        .iter()
        .any(|p| change.key == p.trim_end_matches('.') || change.key.starts_with(p));
    tracing::info!(key = %change.key, restart_required, "Fleet config change applied");
    Ok(Json(json!({
        "ok": true,
        "key": change.key,
        "restart_required": restart_required,
    })))
}

/// Restart the node services through the operator-configured command.
pub async fn restart(State(state): State<SharedState>) -> Result<Json<Value>> {
    let command = state.config.read().await.fleet.restart_cmd.clone();
    let Some(command) = command else {
        return Err(PortalError::BadRequest(
            "no fleet restart command configured".to_string(),
        ));
    };
    tracing::warn!("Fleet-requested service restart: {}", command);
    tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .spawn()
        .map_err(|e| PortalError::Internal(format!("cannot run restart command: {}", e)))?;
    Ok(Json(json!({ "ok": true })))
}

/// A key is allowed when the whitelist names it exactly or names one of its
/// parent sections.
pub fn key_allowed(key: &str, whitelist: &[String]) -> bool {
    whitelist.iter().any(|entry| {
        let entry = entry.trim_end_matches('.');
        key == entry || key.starts_with(&format!("{}.", entry))
    })
}

/// Set a dotted-path key inside a YAML mapping, creating intermediate
/// mappings as needed.
fn set_nested(
    doc: &mut serde_yaml::Value,
    dotted_key: &str,
    value: serde_yaml::Value,
) -> Result<()> {
    let mut current = doc;
    let segments: Vec<&str> = dotted_key.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(PortalError::BadRequest(format!(
            "malformed config key '{}'",
            dotted_key
        )));
    }

    for (i, segment) in segments.iter().enumerate() {
        if !current.is_mapping() {
            *current = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }
        let map = current.as_mapping_mut().expect("just ensured mapping");
        let key = serde_yaml::Value::String(segment.to_string());
        if i == segments.len() - 1 {
            map.insert(key, value);
            return Ok(());
        }
        current = map
            .entry(key)
            .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    }
    unreachable!("loop always returns on the last segment");
}

async fn write_atomic(path: &std::path::Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_exact_and_section_matches() {
        let whitelist = vec!["logging.level".to_string(), "monitoring".to_string()];
        assert!(key_allowed("logging.level", &whitelist));
        assert!(key_allowed("monitoring.max_cpu_percent", &whitelist));
        assert!(key_allowed("monitoring", &whitelist));
        assert!(!key_allowed("logging.log_dir", &whitelist));
        assert!(!key_allowed("server.auth_token", &whitelist));
        assert!(!key_allowed("monitoringx.y", &whitelist));
    }

    #[test]
    fn set_nested_creates_sections() {
        let mut doc: serde_yaml::Value = serde_yaml::from_str("device: { id: n1 }").unwrap();
        set_nested(
            &mut doc,
            "monitoring.max_cpu_percent",
            serde_yaml::Value::Number(75.into()),
        )
        .unwrap();
        set_nested(
            &mut doc,
            "logging.level",
            serde_yaml::Value::String("DEBUG".into()),
        )
        .unwrap();

        assert_eq!(
            doc["monitoring"]["max_cpu_percent"],
            serde_yaml::Value::Number(75.into())
        );
        assert_eq!(doc["logging"]["level"].as_str(), Some("DEBUG"));
        assert_eq!(doc["device"]["id"].as_str(), Some("n1"));
    }

    #[test]
    fn set_nested_rejects_malformed_keys() {
        let mut doc = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        assert!(set_nested(&mut doc, "a..b", serde_yaml::Value::Null).is_err());
        assert!(set_nested(&mut doc, ".", serde_yaml::Value::Null).is_err());
    }
}
