//! Persistent update state and version comparison.
//!
//! The state file is shared between the updater (sole writer) and the portal
//! (reader). Every write goes through a same-directory temp file, fsync and
//! rename, so readers observe either the old record or the new one, never a
//! torn write.

use std::io::Write as _;
use std::path::Path;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Where the updater last left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Unknown,
    UpToDate,
    Updating,
    Updated,
    CheckFailed,
    FetchFailed,
    PreflightFailed,
    RollingBack,
    RollbackCompleted,
    RollbackFailed,
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// The on-disk update record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateState {
    pub status: UpdateStatus,
    pub current_version: String,
    pub latest_available: String,
    pub previous_version: String,
    /// RFC 3339 timestamps, empty until the first event.
    pub last_check: String,
    pub last_update: String,
    pub consecutive_failures: u32,
    pub channel: String,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self {
            status: UpdateStatus::Unknown,
            current_version: "0.0.0".to_string(),
            latest_available: String::new(),
            previous_version: String::new(),
            last_check: String::new(),
            last_update: String::new(),
            consecutive_failures: 0,
            channel: "stable".to_string(),
        }
    }
}

impl UpdateState {
    /// Read the state file, returning defaults when missing or corrupt so a
    /// damaged record never blocks an update cycle.
    pub fn read(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Atomic write: temp file in the same directory, fsync, rename.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)
            .map_err(|e| AgentError::Update(format!("cannot replace {}: {}", path.display(), e)))
    }
}

/// Parse a version string leniently: optional leading `v`, missing minor or
/// patch components padded with zeros, pre-release tags preserved.
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = Version::parse(trimmed) {
        return Some(v);
    }
    // Pad "1" or "1.2" style versions, keeping any -prerelease suffix.
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
    Version::parse(&format!("{}{}", parts.join("."), suffix)).ok()
}

/// True when `candidate` is strictly newer than `current`. Pre-release
/// ordering follows semver, so `0.3.0-beta.1 < 0.3.0`.
pub fn version_newer(current: &str, candidate: &str) -> bool {
    match (parse_version(current), parse_version(candidate)) {
        (Some(cur), Some(cand)) => cand > cur,
        // An unparseable current version never blocks an update; an
        // unparseable candidate never triggers one.
        (None, Some(_)) => true,
        _ => false,
    }
}

/// True when the version carries a pre-release tag.
pub fn is_prerelease(version: &str) -> bool {
    parse_version(version)
        .map(|v| !v.pre.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_on_missing_file() {
        let state = UpdateState::read(Path::new("/nonexistent/update-state.json"));
        assert_eq!(state.status, UpdateStatus::Unknown);
        assert_eq!(state.current_version, "0.0.0");
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn defaults_on_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let state = UpdateState::read(&path);
        assert_eq!(state.status, UpdateStatus::Unknown);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let state = UpdateState {
            status: UpdateStatus::Updated,
            current_version: "0.3.1".into(),
            latest_available: "0.3.1".into(),
            previous_version: "0.3.0".into(),
            last_check: "2026-08-01T12:00:00Z".into(),
            last_update: "2026-08-01T12:01:00Z".into(),
            consecutive_failures: 0,
            channel: "stable".into(),
        };
        state.write(&path).unwrap();

        let read = UpdateState::read(&path);
        assert_eq!(read.status, UpdateStatus::Updated);
        assert_eq!(read.current_version, "0.3.1");
        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&UpdateStatus::RollbackCompleted).unwrap();
        assert_eq!(json, "\"rollback_completed\"");
        let parsed: UpdateStatus = serde_json::from_str("\"preflight_failed\"").unwrap();
        assert_eq!(parsed, UpdateStatus::PreflightFailed);
    }

    #[test]
    fn version_comparison_basics() {
        assert!(version_newer("0.3.0", "0.3.1"));
        assert!(version_newer("0.3.0", "1.0.0"));
        assert!(!version_newer("0.3.1", "0.3.0"));
        assert!(!version_newer("0.3.0", "0.3.0"));
    }

    #[test]
    fn prerelease_sorts_before_release() {
        assert!(version_newer("0.3.0-beta.1", "0.3.0"));
        assert!(!version_newer("0.3.0", "0.3.0-beta.1"));
        assert!(version_newer("0.2.9", "0.3.0-beta.1"));
    }

    #[test]
    fn lenient_parsing() {
        assert!(version_newer("v0.3.0", "v0.4.0"));
        assert!(version_newer("1.2", "1.2.1"));
        assert!(version_newer("1", "1.0.1"));
        assert!(!version_newer("1.2.3", "garbage"));
    }

    #[test]
    fn prerelease_detection() {
        assert!(is_prerelease("0.3.0-beta.1"));
        assert!(is_prerelease("v1.0.0-rc.2"));
        assert!(!is_prerelease("0.3.0"));
        assert!(!is_prerelease("not-a-version"));
    }
}
