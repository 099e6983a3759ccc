//! The self-update controller, run as a periodic oneshot by the host timer.
//!
//! One cycle: take the on-disk lock, honor the enable flag and the
//! three-strike guard, query the release index, filter by channel, fetch and
//! pre-flight the artifacts, apply through the installer entry point in
//! preserve-configuration mode, health-verify both processes, and roll back
//! to the preserved artifact set when verification fails. Every transition
//! is recorded atomically in the update-state file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use nix::fcntl::{Flock, FlockArg};
use serde::Deserialize;
use sysinfo::{Disks, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::state::{is_prerelease, parse_version, version_newer, UpdateState, UpdateStatus};
use crate::config::{Channel, Config};
use crate::error::{AgentError, Result};

/// Failed cycles tolerated before the updater refuses to run without --force.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// One release in the index (GitHub releases API shape).
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// CLI-facing knobs for one updater run.
#[derive(Debug, Default)]
pub struct UpdaterOptions {
    /// Ignore the enable flag and the three-strike guard.
    pub force: bool,
    /// Record what is available without fetching or applying.
    pub check_only: bool,
}

pub struct UpdateController {
    config: Config,
    state_path: PathBuf,
    http: reqwest::Client,
}

impl UpdateController {
    pub fn new(config: Config) -> Result<Self> {
        let state_path = config.updates.state_path.clone();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("sai-cam-updater/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            config,
            state_path,
            http,
        })
    }

    /// Run one update cycle. Returns the process exit code: 0 when
    /// up-to-date, deferred, or successfully applied; 1 on any recorded
    /// failure.
    pub async fn run(&self, opts: &UpdaterOptions) -> i32 {
        // Exclusive on-disk lock; a concurrent cycle exits silently.
        let lock_path = self.state_path.with_extension("lock");
        let _lock = match acquire_lock(&lock_path) {
            Some(lock) => lock,
            None => {
                tracing::debug!("Another updater holds {}, exiting", lock_path.display());
                return 0;
            }
        };

        let mut state = UpdateState::read(&self.state_path);
        state.channel = self.config.updates.channel.to_string();

        if !self.config.updates.enabled && !opts.force {
            tracing::info!("Updates disabled in configuration, exiting");
            return 0;
        }
        if state.consecutive_failures >= MAX_CONSECUTIVE_FAILURES && !opts.force {
            tracing::warn!(
                "Update guard: {} consecutive failures, refusing to run (use --force or reset the state file)",
                state.consecutive_failures
            );
            return 0;
        }

        match self.cycle(&mut state, opts).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("Update cycle failed: {}", e);
                1
            }
        }
    }

    async fn cycle(&self, state: &mut UpdateState, opts: &UpdaterOptions) -> Result<i32> {
        let current = self.read_current_version(state);
        state.current_version = current.clone();
        state.last_check = Utc::now().to_rfc3339();

        // Query the release index.
        let releases = match self.fetch_release_index().await {
            Ok(releases) => releases,
            Err(e) => {
                tracing::warn!("Release index check failed: {}", e);
                state.status = UpdateStatus::CheckFailed;
                state.write(&self.state_path)?;
                return Ok(1);
            }
        };

        let candidate = select_candidate(&releases, &current, self.config.updates.channel);
        let Some(candidate) = candidate else {
            tracing::info!("Up to date at {}", current);
            state.status = UpdateStatus::UpToDate;
            state.latest_available = current.clone();
            state.write(&self.state_path)?;
            return Ok(0);
        };

        let new_version = candidate.tag_name.trim_start_matches('v').to_string();
        state.latest_available = new_version.clone();

        if opts.check_only || !self.config.updates.apply_immediately {
            tracing::info!(
                "Version {} available (current {}), apply deferred",
                new_version,
                current
            );
            state.write(&self.state_path)?;
            return Ok(0);
        }

        tracing::info!("Updating {} -> {}", current, new_version);

        // Fetch artifacts into the working directory.
        let fetch_dir = self.config.updates.work_dir.join(&new_version);
        if let Err(e) = self.fetch_artifacts(candidate, &fetch_dir).await {
            tracing::error!("Artifact fetch failed: {}", e);
            state.status = UpdateStatus::FetchFailed;
            state.consecutive_failures += 1;
            state.write(&self.state_path)?;
            return Ok(1);
        }

        // Pre-flight before touching the installation.
        if let Err(reason) = self.preflight(&fetch_dir, &new_version) {
            tracing::error!("Pre-flight failed: {}", reason);
            state.status = UpdateStatus::PreflightFailed;
            state.consecutive_failures += 1;
            state.write(&self.state_path)?;
            return Ok(1);
        }

        // Preserve rollback state, then mark the cycle in progress.
        let rollback_dir = self.config.updates.work_dir.join("rollback");
        self.snapshot_installation(&rollback_dir).await?;
        state.previous_version = current.clone();
        state.status = UpdateStatus::Updating;
        state.write(&self.state_path)?;

        // Apply through the installer entry point.
        let applied = self.run_installer(&fetch_dir).await;
        let healthy = match applied {
            Ok(()) => self.verify_health(&new_version).await,
            Err(e) => {
                tracing::error!("Installer failed: {}", e);
                false
            }
        };

        if healthy {
            tracing::info!("Update to {} verified healthy", new_version);
            state.status = UpdateStatus::Updated;
            state.current_version = new_version;
            state.last_update = Utc::now().to_rfc3339();
            state.consecutive_failures = 0;
            state.write(&self.state_path)?;
            return Ok(0);
        }

        // Roll back to the preserved artifact set.
        tracing::warn!("Health verification failed, rolling back to {}", current);
        state.status = UpdateStatus::RollingBack;
        state.write(&self.state_path)?;

        let rolled_back = self.rollback(&rollback_dir).await;
        state.consecutive_failures += 1;
        state.status = if rolled_back {
            UpdateStatus::RollbackCompleted
        } else {
            UpdateStatus::RollbackFailed
        };
        state.current_version = current;
        state.write(&self.state_path)?;
        Ok(1)
    }

    /// Version of the installed artifact set, from `<install_root>/VERSION`.
    fn read_current_version(&self, state: &UpdateState) -> String {
        let path = self.config.updates.install_root.join("VERSION");
        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => state.current_version.clone(),
        }
    }

    async fn fetch_release_index(&self) -> Result<Vec<Release>> {
        let response = self
            .http
            .get(&self.config.updates.release_url)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn fetch_artifacts(&self, release: &Release, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest).await?;
        for asset in &release.assets {
            let target = dest.join(&asset.name);
            tracing::info!("Fetching {}", asset.name);
            let bytes = self
                .http
                .get(&asset.browser_download_url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            tokio::fs::write(&target, &bytes).await?;
        }
        Ok(())
    }

    /// Required files present, declared version consistent, resources free.
    fn preflight(&self, fetch_dir: &Path, new_version: &str) -> std::result::Result<(), String> {
        for required in &self.config.updates.required_files {
            let path = fetch_dir.join(required);
            if !path.exists() {
                return Err(format!("required artifact '{}' missing", required));
            }
        }

        let declared = std::fs::read_to_string(fetch_dir.join("VERSION"))
            .map(|s| s.trim().to_string())
            .map_err(|e| format!("cannot read fetched VERSION: {}", e))?;
        if parse_version(&declared) != parse_version(new_version) {
            return Err(format!(
                "declared version '{}' does not match release tag '{}'",
                declared, new_version
            ));
        }

        let disks = Disks::new_with_refreshed_list();
        let free_disk_mb = disks
            .list()
            .iter()
            .filter(|d| self.config.updates.install_root.starts_with(d.mount_point()))
            .map(|d| d.available_space() / 1024 / 1024)
            .max()
            .unwrap_or(u64::MAX);
        if free_disk_mb < self.config.updates.min_free_disk_mb {
            return Err(format!(
                "only {} MB disk free, {} MB required",
                free_disk_mb, self.config.updates.min_free_disk_mb
            ));
        }

        let mut sys = System::new();
        sys.refresh_memory();
        let free_memory_mb = sys.available_memory() / 1024 / 1024;
        if free_memory_mb < self.config.updates.min_free_memory_mb {
            return Err(format!(
                "only {} MB memory free, {} MB required",
                free_memory_mb, self.config.updates.min_free_memory_mb
            ));
        }
        Ok(())
    }

    /// Copy the current installation aside so rollback has something to
    /// restore. Data trees living under the install root are skipped.
    async fn snapshot_installation(&self, rollback_dir: &Path) -> Result<()> {
        let _ = tokio::fs::remove_dir_all(rollback_dir).await;
        tokio::fs::create_dir_all(rollback_dir).await?;
        let source = self.config.updates.install_root.clone();
        let dest = rollback_dir.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest, &["storage", "logs"]))
            .await
            .map_err(|e| AgentError::Update(format!("snapshot task failed: {}", e)))??;
        Ok(())
    }

    async fn run_installer(&self, dir: &Path) -> Result<()> {
        let timeout = Duration::from_secs(self.config.updates.installer_timeout.max(1));
        let status = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("sh")
                .arg(dir.join("install.sh"))
                .arg("--preserve-config")
                .current_dir(dir)
                .status(),
        )
        .await
        .map_err(|_| AgentError::Update("installer timed out".to_string()))?
        .map_err(|e| AgentError::Update(format!("installer did not start: {}", e)))?;

        if !status.success() {
            return Err(AgentError::Update(format!(
                "installer exited with {}",
                status
            )));
        }
        Ok(())
    }

    /// Poll until both processes answer and the portal reports the new
    /// version, or the verification window closes.
    async fn verify_health(&self, expected_version: &str) -> bool {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.updates.health_verify_timeout.max(1));
        let poll = Duration::from_secs(self.config.updates.health_verify_poll.max(1));
        let portal_url = format!("http://127.0.0.1:{}/api/status", self.config.portal.port);

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(poll).await;

            let agent_ok = self.agent_answers().await;
            let portal_version = self.portal_version(&portal_url).await;
            tracing::debug!(
                agent_ok,
                portal_version = portal_version.as_deref().unwrap_or("-"),
                "Health verification poll"
            );
            if agent_ok
                && portal_version
                    .map(|v| parse_version(&v) == parse_version(expected_version))
                    .unwrap_or(false)
            {
                return true;
            }
        }
        false
    }

    /// One round-trip on the agent's health socket.
    async fn agent_answers(&self) -> bool {
        let path = self.config.advanced.health_socket.clone();
        let attempt = async {
            let stream = tokio::net::UnixStream::connect(&path).await.ok()?;
            let (read_half, mut write_half) = stream.into_split();
            write_half.write_all(b"system\n").await.ok()?;
            let mut reply = String::new();
            BufReader::new(read_half).read_line(&mut reply).await.ok()?;
            serde_json::from_str::<serde_json::Value>(reply.trim()).ok()
        };
        tokio::time::timeout(Duration::from_secs(5), attempt)
            .await
            .ok()
            .flatten()
            .is_some()
    }

    async fn portal_version(&self, url: &str) -> Option<String> {
        let response = self.http.get(url).send().await.ok()?;
        let doc: serde_json::Value = response.json().await.ok()?;
        doc["node"]["version"].as_str().map(str::to_string)
    }

    /// Restore the preserved artifact set and re-run its installer.
    async fn rollback(&self, rollback_dir: &Path) -> bool {
        let source = rollback_dir.to_path_buf();
        let dest = self.config.updates.install_root.clone();
        let restored = tokio::task::spawn_blocking(move || copy_tree(&source, &dest, &[]))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !restored {
            tracing::error!("Rollback restore failed");
            return false;
        }

        let install_root = self.config.updates.install_root.clone();
        if let Err(e) = self.run_installer(&install_root).await {
            tracing::error!("Rollback installer failed: {}", e);
            return false;
        }

        // Give the services a moment, then confirm the agent is back.
        tokio::time::sleep(Duration::from_secs(10)).await;
        self.agent_answers().await
    }
}

/// Take the updater lock, or return None when another cycle holds it.
fn acquire_lock(path: &Path) -> Option<Flock<std::fs::File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .ok()?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock).ok()
}

/// Pick the highest release newer than `current` that the channel accepts:
/// `stable` excludes pre-releases, `beta` accepts everything.
pub fn select_candidate<'a>(
    releases: &'a [Release],
    current: &str,
    channel: Channel,
) -> Option<&'a Release> {
    releases
        .iter()
        .filter(|r| match channel {
            Channel::Stable => !r.prerelease && !is_prerelease(&r.tag_name),
            Channel::Beta => true,
        })
        .filter(|r| version_newer(current, &r.tag_name))
        .max_by(|a, b| {
            let va = parse_version(&a.tag_name);
            let vb = parse_version(&b.tag_name);
            va.cmp(&vb)
        })
}

/// Recursive copy skipping the named top-level directories.
fn copy_tree(source: &Path, dest: &Path, skip: &[&str]) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|s| name == std::ffi::OsStr::new(s)) {
            continue;
        }
        let from = entry.path();
        let to = dest.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&from, &to, &[])?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn release(tag: &str, prerelease: bool) -> Release {
        Release {
            tag_name: tag.to_string(),
            prerelease,
            assets: vec![],
        }
    }

    #[test]
    fn stable_channel_skips_prereleases() {
        let releases = vec![
            release("v0.4.0-beta.1", true),
            release("v0.3.2", false),
            release("v0.3.1", false),
        ];
        let picked = select_candidate(&releases, "0.3.0", Channel::Stable).unwrap();
        assert_eq!(picked.tag_name, "v0.3.2");
    }

    #[test]
    fn beta_channel_accepts_prereleases() {
        let releases = vec![release("v0.4.0-beta.1", true), release("v0.3.2", false)];
        let picked = select_candidate(&releases, "0.3.0", Channel::Beta).unwrap();
        assert_eq!(picked.tag_name, "v0.4.0-beta.1");
    }

    #[test]
    fn stable_channel_filters_prerelease_tags_even_unflagged() {
        // Some release tooling forgets the prerelease flag; the tag itself
        // still keeps it off the stable channel.
        let releases = vec![release("v0.4.0-rc.1", false)];
        assert!(select_candidate(&releases, "0.3.0", Channel::Stable).is_none());
    }

    #[test]
    fn nothing_newer_yields_none() {
        let releases = vec![release("v0.2.0", false), release("v0.3.0", false)];
        assert!(select_candidate(&releases, "0.3.0", Channel::Stable).is_none());
    }

    #[test]
    fn copy_tree_skips_named_dirs() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("VERSION"), "0.3.0").unwrap();
        std::fs::create_dir_all(src.path().join("storage/pending")).unwrap();
        std::fs::write(src.path().join("storage/pending/x.jpg"), "data").unwrap();
        std::fs::create_dir_all(src.path().join("bin")).unwrap();
        std::fs::write(src.path().join("bin/agent"), "elf").unwrap();

        copy_tree(src.path(), dst.path(), &["storage"]).unwrap();
        assert!(dst.path().join("VERSION").exists());
        assert!(dst.path().join("bin/agent").exists());
        assert!(!dst.path().join("storage").exists());
    }

    fn test_config(dir: &Path, release_url: &str, state: &Path) -> Config {
        let yaml = format!(
            r#"
device: {{ id: node-test }}
cameras:
  - {{ id: cam1, type: usb }}
updates:
  release_url: {url}
  state_path: {state}
  install_root: {root}
  work_dir: {work}
"#,
            url = release_url,
            state = state.display(),
            root = dir.join("install").display(),
            work = dir.join("work").display(),
        );
        Config::from_yaml(&yaml).unwrap()
    }

    #[tokio::test]
    async fn up_to_date_recorded_when_index_has_nothing_newer() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/releases");
                then.status(200)
                    .json_body(serde_json::json!([
                        { "tag_name": "v0.1.0", "prerelease": false, "assets": [] }
                    ]));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        std::fs::create_dir_all(dir.path().join("install")).unwrap();
        std::fs::write(dir.path().join("install/VERSION"), "0.3.0").unwrap();

        let config = test_config(dir.path(), &server.url("/releases"), &state_path);
        let controller = UpdateController::new(config).unwrap();
        let code = controller.run(&UpdaterOptions::default()).await;

        assert_eq!(code, 0);
        assert_eq!(mock.hits_async().await, 1);
        let state = UpdateState::read(&state_path);
        assert_eq!(state.status, UpdateStatus::UpToDate);
        assert_eq!(state.current_version, "0.3.0");
        assert!(!state.last_check.is_empty());
    }

    #[tokio::test]
    async fn check_only_records_available_version_without_fetching() {
        let server = MockServer::start_async().await;
        let index = server
            .mock_async(|when, then| {
                when.method(GET).path("/releases");
                then.status(200).json_body(serde_json::json!([
                    {
                        "tag_name": "v9.9.9",
                        "prerelease": false,
                        "assets": [
                            { "name": "sai-cam.tar.gz",
                              "browser_download_url": server.url("/dl/sai-cam.tar.gz") }
                        ]
                    }
                ]));
            })
            .await;
        let download = server
            .mock_async(|when, then| {
                when.method(GET).path("/dl/sai-cam.tar.gz");
                then.status(200).body("tar");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        std::fs::create_dir_all(dir.path().join("install")).unwrap();
        std::fs::write(dir.path().join("install/VERSION"), "0.3.0").unwrap();

        let config = test_config(dir.path(), &server.url("/releases"), &state_path);
        let controller = UpdateController::new(config).unwrap();
        let code = controller
            .run(&UpdaterOptions {
                force: false,
                check_only: true,
            })
            .await;

        assert_eq!(code, 0);
        assert_eq!(index.hits_async().await, 1);
        assert_eq!(download.hits_async().await, 0, "check-only never fetches");
        let state = UpdateState::read(&state_path);
        assert_eq!(state.latest_available, "9.9.9");
    }

    #[tokio::test]
    async fn three_strike_guard_skips_index_entirely() {
        let server = MockServer::start_async().await;
        let index = server
            .mock_async(|when, then| {
                when.method(GET).path("/releases");
                then.status(200).json_body(serde_json::json!([]));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        UpdateState {
            consecutive_failures: 3,
            ..Default::default()
        }
        .write(&state_path)
        .unwrap();

        let config = test_config(dir.path(), &server.url("/releases"), &state_path);
        let controller = UpdateController::new(config).unwrap();
        let code = controller.run(&UpdaterOptions::default()).await;

        assert_eq!(code, 0);
        assert_eq!(index.hits_async().await, 0, "guard must not contact the index");
        // The state record is untouched.
        assert_eq!(UpdateState::read(&state_path).consecutive_failures, 3);
    }

    #[tokio::test]
    async fn check_failure_recorded_with_exit_one() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/releases");
                then.status(500);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let config = test_config(dir.path(), &server.url("/releases"), &state_path);
        let controller = UpdateController::new(config).unwrap();
        let code = controller.run(&UpdaterOptions::default()).await;

        assert_eq!(code, 1);
        let state = UpdateState::read(&state_path);
        assert_eq!(state.status, UpdateStatus::CheckFailed);
    }

    #[tokio::test]
    async fn preflight_failure_counts_against_the_guard() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/releases");
                then.status(200).json_body(serde_json::json!([
                    {
                        "tag_name": "v9.9.9",
                        "prerelease": false,
                        "assets": [
                            { "name": "only-this-file",
                              "browser_download_url": server.url("/dl/only-this-file") }
                        ]
                    }
                ]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/dl/only-this-file");
                then.status(200).body("x");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        std::fs::create_dir_all(dir.path().join("install")).unwrap();
        std::fs::write(dir.path().join("install/VERSION"), "0.3.0").unwrap();

        let config = test_config(dir.path(), &server.url("/releases"), &state_path);
        let controller = UpdateController::new(config).unwrap();
        let code = controller.run(&UpdaterOptions::default()).await;

        assert_eq!(code, 1);
        let state = UpdateState::read(&state_path);
        assert_eq!(state.status, UpdateStatus::PreflightFailed);
        assert_eq!(state.consecutive_failures, 1);
    }
}
