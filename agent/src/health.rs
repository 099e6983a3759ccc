//! Health monitoring: system metrics sampling and cached snapshots.
//!
//! Two refresh cadences feed one [`HealthState`]: a slow sampler for system
//! metrics and storage totals (`monitoring.health_check_interval`, default
//! 300 s) and a fast 1 s refresher for per-camera state. The IPC server
//! answers every request from these caches so it never blocks on sampling;
//! a snapshot older than twice its refresh interval is flagged `stale`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use sysinfo::{Components, Disks, System};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::capture::CameraRegistry;
use crate::config::{Config, MonitoringConfig};
use crate::logging::RateLimitedLogger;
use crate::storage::{StorageManager, StorageTotals};

/// Point-in-time system resource metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub disk_percent: f32,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
    pub temperature_c: Option<f32>,
    pub uptime_seconds: u64,
}

/// One camera's health as the portal sees it.
#[derive(Debug, Clone, Serialize)]
pub struct CameraHealth {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub position: String,
    pub worker_alive: bool,
    #[serde(flatten)]
    pub tracker: crate::cameras::TrackerStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub name: String,
    pub alive: bool,
}

struct Cached<T> {
    value: Option<T>,
    updated: Option<Instant>,
}

impl<T> Cached<T> {
    fn empty() -> Self {
        Self {
            value: None,
            updated: None,
        }
    }

    fn set(&mut self, value: T) {
        self.value = Some(value);
        self.updated = Some(Instant::now());
    }

    fn is_stale(&self, max_age: Duration) -> bool {
        match self.updated {
            Some(at) => at.elapsed() > max_age,
            None => true,
        }
    }
}

/// Cached health snapshots shared between the samplers and the IPC server.
pub struct HealthState {
    system: RwLock<Cached<SystemMetrics>>,
    cameras: RwLock<Cached<Vec<CameraHealth>>>,
    threads: RwLock<Cached<Vec<ThreadInfo>>>,
    storage: RwLock<Cached<StorageTotals>>,
    /// Mirror of the system cache readable from blocking capture workers.
    system_sync: std::sync::RwLock<Option<SystemMetrics>>,
    system_interval: Duration,
    camera_interval: Duration,
    started: Instant,
}

impl HealthState {
    pub fn new(monitoring: &MonitoringConfig) -> Self {
        Self {
            system: RwLock::new(Cached::empty()),
            cameras: RwLock::new(Cached::empty()),
            threads: RwLock::new(Cached::empty()),
            storage: RwLock::new(Cached::empty()),
            system_sync: std::sync::RwLock::new(None),
            system_interval: Duration::from_secs(monitoring.health_check_interval.max(1)),
            camera_interval: Duration::from_secs(1),
            started: Instant::now(),
        }
    }

    /// Last sampled system metrics, if any. Used by capture workers for the
    /// metadata sidecar; callable from blocking threads.
    pub fn latest_system_metrics(&self) -> Option<SystemMetrics> {
        self.system_sync.read().unwrap().clone()
    }

    /// Serve one IPC request kind from cache.
    pub async fn snapshot(&self, kind: &str) -> serde_json::Value {
        match kind {
            "system" => {
                let cached = self.system.read().await;
                json!({
                    "system": cached.value,
                    "stale": cached.is_stale(self.system_interval * 2),
                })
            }
            "cameras" => {
                let cached = self.cameras.read().await;
                json!({
                    "cameras": cached.value.clone().unwrap_or_default(),
                    "stale": cached.is_stale(self.camera_interval * 2),
                })
            }
            "threads" => {
                let cached = self.threads.read().await;
                json!({
                    "threads": cached.value.clone().unwrap_or_default(),
                    "stale": cached.is_stale(self.camera_interval * 2),
                })
            }
            "full" => {
                let system = self.system.read().await;
                let cameras = self.cameras.read().await;
                let threads = self.threads.read().await;
                let storage = self.storage.read().await;
                json!({
                    "agent": {
                        "version": env!("CARGO_PKG_VERSION"),
                        "uptime_seconds": self.started.elapsed().as_secs(),
                    },
                    "system": system.value,
                    "cameras": cameras.value.clone().unwrap_or_default(),
                    "threads": threads.value.clone().unwrap_or_default(),
                    "storage": storage.value,
                    "stale": system.is_stale(self.system_interval * 2)
                        || cameras.is_stale(self.camera_interval * 2),
                })
            }
            other => json!({ "error": format!("unknown request '{}'", other) }),
        }
    }
}

/// Slow loop: system metrics, storage totals, threshold warnings.
pub async fn run_system_sampler(
    state: Arc<HealthState>,
    config: Arc<RwLock<Config>>,
    storage: Arc<StorageManager>,
    cancel: CancellationToken,
) {
    let mut sys = System::new_all();
    let rl = RateLimitedLogger::new(Duration::from_secs(300));
    let storage_path = { config.read().await.storage.base_path.clone() };

    loop {
        let monitoring = { config.read().await.monitoring.clone() };

        sys.refresh_cpu_all();
        sys.refresh_memory();
        let metrics = sample_system(&sys, &storage_path, state.started);
        check_thresholds(&metrics, &monitoring, &rl);
        *state.system_sync.write().unwrap() = Some(metrics.clone());
        state.system.write().await.set(metrics);

        let totals = storage.totals().await;
        state.storage.write().await.set(totals);

        let interval = Duration::from_secs(monitoring.health_check_interval.max(1));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Fast loop: per-camera tracker snapshots and the thread census.
pub async fn run_camera_refresher(
    state: Arc<HealthState>,
    registry: CameraRegistry,
    cancel: CancellationToken,
) {
    loop {
        let mut cameras = Vec::new();
        let mut threads = vec![
            ThreadInfo {
                name: "upload-worker".to_string(),
                alive: true,
            },
            ThreadInfo {
                name: "storage-cleaner".to_string(),
                alive: true,
            },
            ThreadInfo {
                name: "health-monitor".to_string(),
                alive: true,
            },
            ThreadInfo {
                name: "ipc-server".to_string(),
                alive: true,
            },
        ];

        {
            let reg = registry.read().await;
            let mut ids: Vec<_> = reg.keys().cloned().collect();
            ids.sort();
            for id in ids {
                let cam = &reg[&id];
                let alive = cam.alive.load(std::sync::atomic::Ordering::Relaxed);
                let tracker = cam.tracker.lock().unwrap().status();
                let position = cam.position.lock().unwrap().clone();
                cameras.push(CameraHealth {
                    id: id.clone(),
                    kind: cam.spec.kind.to_string(),
                    position,
                    worker_alive: alive,
                    tracker,
                });
                threads.push(ThreadInfo {
                    name: format!("camera-{}", id),
                    alive,
                });
            }
        }

        state.cameras.write().await.set(cameras);
        state.threads.write().await.set(threads);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(state.camera_interval) => {}
        }
    }
}

fn sample_system(sys: &System, storage_path: &PathBuf, started: Instant) -> SystemMetrics {
    let cpu_percent = sys.global_cpu_usage();

    let memory_total = sys.total_memory();
    let memory_used = sys.used_memory();
    let memory_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    // Pick the disk whose mount point is the longest prefix of the storage
    // root, falling back to '/'.
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(&sysinfo::Disk, usize)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if storage_path.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(_, d)| depth > d).unwrap_or(true) {
                best = Some((disk, depth));
            }
        }
    }
    let (disk_used, disk_total) = match best {
        Some((disk, _)) => (disk.total_space() - disk.available_space(), disk.total_space()),
        None => (0, 0),
    };
    let disk_percent = if disk_total > 0 {
        (disk_used as f64 / disk_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let components = Components::new_with_refreshed_list();
    let temperature_c = components
        .list()
        .iter()
        .filter_map(|c| c.temperature())
        .fold(None, |max: Option<f32>, t| {
            Some(max.map(|m| m.max(t)).unwrap_or(t))
        });

    SystemMetrics {
        cpu_percent,
        memory_percent,
        memory_used_mb: memory_used / 1024 / 1024,
        memory_total_mb: memory_total / 1024 / 1024,
        disk_percent,
        disk_used_gb: disk_used as f64 / 1024.0 / 1024.0 / 1024.0,
        disk_total_gb: disk_total as f64 / 1024.0 / 1024.0 / 1024.0,
        temperature_c,
        uptime_seconds: started.elapsed().as_secs(),
    }
}

fn check_thresholds(metrics: &SystemMetrics, cfg: &MonitoringConfig, rl: &RateLimitedLogger) {
    if metrics.cpu_percent > cfg.max_cpu_percent {
        rl.warn(
            "high_cpu",
            &format!("High CPU usage: {:.1}%", metrics.cpu_percent),
        );
    }
    if metrics.memory_percent > cfg.max_memory_percent {
        rl.warn(
            "high_memory",
            &format!("High memory usage: {:.1}%", metrics.memory_percent),
        );
    }
    if metrics.disk_percent > cfg.max_disk_percent {
        rl.warn(
            "high_disk",
            &format!("High disk usage: {:.1}%", metrics.disk_percent),
        );
    }
    if let Some(temp) = metrics.temperature_c {
        if temp > cfg.max_temperature_c {
            rl.warn("high_temp", &format!("High temperature: {:.1}C", temp));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_snapshots_are_stale() {
        let state = HealthState::new(&MonitoringConfig::default());
        let snap = state.snapshot("system").await;
        assert_eq!(snap["stale"], true);
        assert!(snap["system"].is_null());
    }

    #[tokio::test]
    async fn fresh_system_snapshot_not_stale() {
        let state = HealthState::new(&MonitoringConfig::default());
        state.system.write().await.set(SystemMetrics {
            cpu_percent: 10.0,
            memory_percent: 20.0,
            memory_used_mb: 100,
            memory_total_mb: 1000,
            disk_percent: 30.0,
            disk_used_gb: 1.0,
            disk_total_gb: 10.0,
            temperature_c: Some(45.0),
            uptime_seconds: 5,
        });
        let snap = state.snapshot("system").await;
        assert_eq!(snap["stale"], false);
        assert_eq!(snap["system"]["memory_total_mb"], 1000);
    }

    #[tokio::test]
    async fn unknown_kind_reports_error() {
        let state = HealthState::new(&MonitoringConfig::default());
        let snap = state.snapshot("bogus").await;
        assert!(snap["error"].as_str().unwrap().contains("bogus"));
    }

    #[tokio::test]
    async fn full_snapshot_includes_version_and_sections() {
        let state = HealthState::new(&MonitoringConfig::default());
        let snap = state.snapshot("full").await;
        assert_eq!(snap["agent"]["version"], env!("CARGO_PKG_VERSION"));
        assert!(snap["cameras"].is_array());
        assert!(snap["threads"].is_array());
    }
}
