//! WiFi access-point status and toggling.
//!
//! The AP itself is owned by the host's network stack; the portal only
//! inspects it with `iw` and invokes the operator-configured enable/disable
//! commands. Everything here is best-effort: a node without a wireless
//! interface simply reports the feature as absent.

use std::time::Duration;

use serde_json::json;

use crate::config::WifiApSection;
use crate::error::{PortalError, Result};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

async fn run_command(program: &str, args: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(
        COMMAND_TIMEOUT,
        tokio::process::Command::new(program).args(args).output(),
    )
    .await
    .ok()?
    .ok()?;
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// True when the interface is in AP mode.
pub async fn is_ap_active(interface: &str) -> bool {
    match run_command("iw", &["dev", interface, "info"]).await {
        Some(stdout) => stdout.contains("type AP"),
        None => false,
    }
}

/// AP details for the status payload; `None` when the AP is down.
pub async fn ap_info(cfg: &WifiApSection, device_id: &str) -> Option<serde_json::Value> {
    if !is_ap_active(&cfg.interface).await {
        return None;
    }

    let ssid = cfg
        .ssid
        .clone()
        .unwrap_or_else(|| format!("SAI-Node-{}", device_id));

    let connected_clients = run_command("iw", &["dev", &cfg.interface, "station", "dump"])
        .await
        .map(|out| out.matches("Station ").count())
        .unwrap_or(0);

    let channel = run_command("iw", &["dev", &cfg.interface, "info"])
        .await
        .and_then(|out| {
            out.lines()
                .find(|l| l.contains("channel"))
                .and_then(|l| l.split("channel").nth(1))
                .and_then(|rest| rest.split_whitespace().next())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "N/A".to_string());

    Some(json!({
        "ssid": ssid,
        "connected_clients": connected_clients,
        "channel": channel,
        "interface": cfg.interface,
    }))
}

/// Run the configured enable/disable command.
pub async fn set_enabled(cfg: &WifiApSection, enable: bool) -> Result<serde_json::Value> {
    let command = if enable {
        cfg.enable_cmd.as_ref()
    } else {
        cfg.disable_cmd.as_ref()
    };
    let Some(command) = command else {
        return Err(PortalError::BadRequest(
            "no wifi_ap command configured for this node".to_string(),
        ));
    };

    let status = tokio::time::timeout(
        Duration::from_secs(30),
        tokio::process::Command::new("sh").arg("-c").arg(command).status(),
    )
    .await
    .map_err(|_| PortalError::Internal("wifi_ap command timed out".to_string()))?
    .map_err(|e| PortalError::Internal(format!("wifi_ap command failed to start: {}", e)))?;

    if !status.success() {
        return Err(PortalError::Internal(format!(
            "wifi_ap command exited with {}",
            status
        )));
    }
    Ok(json!({ "ok": true, "enabled": enable }))
}
