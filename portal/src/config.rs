//! Portal-side view of the shared node configuration file.
//!
//! The portal deliberately shares no Rust code with the agent; it reads the
//! same YAML with its own narrower types and ignores the sections it does
//! not use. `${NAME}` / `${NAME:-default}` values are expanded from the
//! environment exactly like the agent does.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use crate::error::{PortalError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub id: String,
    pub location: String,
    pub description: String,
}

/// The slice of a camera entry the portal surfaces.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraSection {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub position: String,
    #[serde(default = "default_capture_interval")]
    pub capture_interval: u64,
}

fn default_capture_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub base_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/opt/sai-cam/storage"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub log_dir: PathBuf,
    pub log_file: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            log_dir: PathBuf::from("/var/log/sai-cam"),
            log_file: "agent.log".to_string(),
        }
    }
}

impl LoggingSection {
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(&self.log_file)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalSection {
    pub host: String,
    pub port: u16,
    pub assets_dir: Option<PathBuf>,
}

impl Default for PortalSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
            assets_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketsSection {
    pub health_socket: PathBuf,
    pub control_socket: PathBuf,
}

impl Default for SocketsSection {
    fn default() -> Self {
        Self {
            health_socket: PathBuf::from("/run/sai-cam/health.sock"),
            control_socket: PathBuf::from("/run/sai-cam/control.sock"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdatesSection {
    pub state_path: PathBuf,
}

impl Default for UpdatesSection {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("/var/lib/sai-cam/update-state.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    pub token: Option<String>,
    pub allowed_config_keys: Vec<String>,
    pub restart_cmd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WifiApSection {
    pub interface: String,
    pub ssid: Option<String>,
    pub enable_cmd: Option<String>,
    pub disable_cmd: Option<String>,
}

impl Default for WifiApSection {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            ssid: None,
            enable_cmd: None,
            disable_cmd: None,
        }
    }
}

/// Everything the portal needs from the node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub device: DeviceSection,
    pub cameras: Vec<CameraSection>,
    pub storage: StorageSection,
    pub logging: LoggingSection,
    pub portal: PortalSection,
    pub advanced: SocketsSection,
    pub updates: UpdatesSection,
    pub fleet: FleetSection,
    pub wifi_ap: WifiApSection,
}

impl PortalConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PortalError::Internal(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| PortalError::Internal(format!("invalid configuration: {}", e)))?;
        let value = expand_env(value);
        serde_yaml::from_value(value)
            .map_err(|e| PortalError::Internal(format!("invalid configuration: {}", e)))
    }
}

fn expand_env(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::String(s) => serde_yaml::Value::String(expand_env_str(&s)),
        serde_yaml::Value::Sequence(seq) => {
            serde_yaml::Value::Sequence(seq.into_iter().map(expand_env).collect())
        }
        serde_yaml::Value::Mapping(map) => serde_yaml::Value::Mapping(
            map.into_iter().map(|(k, v)| (k, expand_env(v))).collect(),
        ),
        other => other,
    }
}

fn expand_env_str(input: &str) -> String {
    let re = Regex::new(r"\$\{([^}]+)\}").expect("static pattern");
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let inner = &caps[1];
        let (name, default) = match inner.split_once(":-") {
            Some((n, d)) => (n, Some(d)),
            None => (inner, None),
        };
        match std::env::var(name) {
            Ok(v) => v,
            Err(_) => match default {
                Some(d) => d.to_string(),
                None => caps[0].to_string(),
            },
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_agent_only_sections() {
        let cfg = PortalConfig::from_yaml(
            r#"
device: { id: node-01, location: ridge }
cameras:
  - { id: cam1, type: rtsp, rtsp_url: "rtsp://x", capture_interval: 2 }
server: { url: "https://inference.example/upload", timeout: 30 }
advanced: { polling_interval_ms: 100 }
"#,
        )
        .unwrap();
        assert_eq!(cfg.device.id, "node-01");
        assert_eq!(cfg.cameras.len(), 1);
        assert_eq!(cfg.cameras[0].kind, "rtsp");
        assert_eq!(cfg.portal.port, 8088);
    }

    #[test]
    fn env_expansion_applies() {
        std::env::set_var("SAICAM_PORTAL_TEST_DIR", "/srv/log-test");
        let cfg = PortalConfig::from_yaml(
            r#"
logging: { log_dir: "${SAICAM_PORTAL_TEST_DIR}" }
"#,
        )
        .unwrap();
        assert_eq!(cfg.logging.log_dir, PathBuf::from("/srv/log-test"));
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = PortalConfig::from_yaml("{}").unwrap();
        assert_eq!(cfg.portal.host, "0.0.0.0");
        assert_eq!(cfg.logging.log_path(), PathBuf::from("/var/log/sai-cam/agent.log"));
    }
}
