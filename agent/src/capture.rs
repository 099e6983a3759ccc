//! Capture coordinator: per-camera worker lifecycle, supervision, retry.
//!
//! The coordinator exclusively owns the camera runtimes. Each camera gets a
//! blocking worker (OpenCV capture is synchronous) that cooperates through
//! its state tracker and a bounded frame channel; nothing else mutates
//! camera state. A supervision tick respawns crashed workers, a retry ladder
//! brings up cameras that failed at startup, and one cancellation token
//! drives graceful shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cameras::{CameraDriver, CameraStateTracker, DriverTuning};
use crate::config::{CameraSpec, Config, DeviceConfig};
use crate::error::FailureClass;
use crate::health::HealthState;
use crate::logging::RateLimitedLogger;

/// Backoff ladder shared by capture retries and setup retries.
const BACKOFF_LADDER: [u32; 5] = [1, 2, 4, 8, 12];

/// Window over which worker respawns are counted against the limit.
const RESTART_WINDOW: Duration = Duration::from_secs(3600);

/// Commands the control socket can send to one camera worker.
#[derive(Debug)]
pub enum CameraCommand {
    /// Capture now, ignoring interval and backoff.
    ForceCapture,
    /// Tear down and re-open the camera connection.
    Restart,
    /// Update the free-form position label.
    SetPosition(String),
}

/// One captured, encoded image on its way to storage.
pub struct CapturedFrame {
    pub camera_id: String,
    pub jpeg: Vec<u8>,
    pub metadata: serde_json::Value,
    pub captured_at: DateTime<Utc>,
}

/// The share of a camera runtime other subsystems may see: the health
/// monitor reads tracker snapshots and liveness, the control socket sends
/// commands. Workers remain the only writers of tracker state.
#[derive(Clone)]
pub struct CameraPublic {
    pub spec: CameraSpec,
    pub tracker: Arc<StdMutex<CameraStateTracker>>,
    pub alive: Arc<AtomicBool>,
    pub position: Arc<StdMutex<String>>,
    pub command_tx: mpsc::Sender<CameraCommand>,
}

pub type CameraRegistry = Arc<RwLock<HashMap<String, CameraPublic>>>;

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    /// Cancelled or deliberately stopped.
    Clean,
    /// Initial device setup failed; the retry supervisor takes over.
    SetupFailed,
}

enum SetupState {
    Running,
    /// Waiting for the next setup retry.
    Retrying { attempts: u32, next_retry: Instant },
    /// Restart limit hit; left alone for the rest of the run.
    Abandoned,
}

struct CameraRuntime {
    public: CameraPublic,
    handle: Option<JoinHandle<WorkerExit>>,
    setup_state: SetupState,
    /// Consecutive failed setup attempts, for the retry ladder.
    setup_attempts: u32,
    /// Crash-respawn timestamps within the counting window.
    restarts: VecDeque<Instant>,
}

/// Static snapshot of the knobs a worker needs; taken at spawn time.
#[derive(Clone)]
struct WorkerKnobs {
    tuning: DriverTuning,
    polling_interval: Duration,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    jpeg_quality: i32,
    device: DeviceConfig,
    setup_retry_base: Duration,
    max_worker_restarts: u32,
}

pub struct CaptureCoordinator {
    config: Arc<RwLock<Config>>,
    registry: CameraRegistry,
    health: Arc<HealthState>,
    frame_tx: mpsc::Sender<CapturedFrame>,
    cancel: CancellationToken,
    runtimes: HashMap<String, CameraRuntime>,
}

impl CaptureCoordinator {
    pub fn new(
        config: Arc<RwLock<Config>>,
        registry: CameraRegistry,
        health: Arc<HealthState>,
        frame_tx: mpsc::Sender<CapturedFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            health,
            frame_tx,
            cancel,
            runtimes: HashMap::new(),
        }
    }

    /// Start all configured cameras, then supervise until shutdown.
    ///
    /// A camera that cannot come up never prevents the others from starting;
    /// it lands on the setup-retry ladder instead.
    pub async fn run(mut self) {
        let (specs, knobs) = {
            let cfg = self.config.read().await;
            (cfg.cameras.clone(), knobs_from(&cfg))
        };

        for spec in specs {
            self.spawn_camera(spec, &knobs, true).await;
        }
        tracing::info!("Capture coordinator started {} cameras", self.runtimes.len());

        let supervision = {
            let cfg = self.config.read().await;
            Duration::from_secs(cfg.advanced.supervision_interval.max(1))
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(supervision) => {}
            }
            let knobs = {
                let cfg = self.config.read().await;
                knobs_from(&cfg)
            };
            self.supervise(&knobs).await;
        }

        self.shutdown().await;
    }

    /// Spawn (or respawn) the worker for one camera.
    async fn spawn_camera(&mut self, spec: CameraSpec, knobs: &WorkerKnobs, fresh: bool) {
        let id = spec.id.clone();
        let (command_tx, command_rx) = mpsc::channel(8);

        let (tracker, alive, position, restarts, setup_attempts) = match self.runtimes.remove(&id) {
            Some(existing) if !fresh => (
                existing.public.tracker,
                existing.public.alive,
                existing.public.position,
                existing.restarts,
                existing.setup_attempts,
            ),
            _ => (
                Arc::new(StdMutex::new(CameraStateTracker::new(
                    &id,
                    Duration::from_secs(spec.capture_interval),
                ))),
                Arc::new(AtomicBool::new(false)),
                Arc::new(StdMutex::new(spec.position.clone())),
                VecDeque::new(),
                0,
            ),
        };

        let public = CameraPublic {
            spec: spec.clone(),
            tracker: tracker.clone(),
            alive: alive.clone(),
            position: position.clone(),
            command_tx,
        };

        let ctx = WorkerContext {
            spec,
            knobs: knobs.clone(),
            tracker,
            alive,
            position,
            command_rx,
            frame_tx: self.frame_tx.clone(),
            health: self.health.clone(),
            cancel: self.cancel.clone(),
        };
        let handle = tokio::task::spawn_blocking(move || worker_loop(ctx));

        self.registry.write().await.insert(id.clone(), public.clone());
        self.runtimes.insert(
            id,
            CameraRuntime {
                public,
                handle: Some(handle),
                setup_state: SetupState::Running,
                setup_attempts,
                restarts,
            },
        );
    }

    /// One supervision pass: reap finished workers, schedule or perform
    /// respawns, enforce the restart limit.
    async fn supervise(&mut self, knobs: &WorkerKnobs) {
        enum Action {
            Nothing,
            Respawn(CameraSpec),
            Reap(JoinHandle<WorkerExit>),
        }

        let now = Instant::now();
        let ids: Vec<String> = self.runtimes.keys().cloned().collect();

        for id in ids {
            let action = {
                let runtime = self.runtimes.get_mut(&id).expect("runtime exists");
                match runtime.setup_state {
                    SetupState::Abandoned => Action::Nothing,
                    SetupState::Retrying { attempts, next_retry } => {
                        if now >= next_retry {
                            tracing::info!(
                                "Camera {}: retrying initial setup (attempt {})",
                                id,
                                attempts + 1
                            );
                            Action::Respawn(runtime.public.spec.clone())
                        } else {
                            Action::Nothing
                        }
                    }
                    SetupState::Running => {
                        let finished = runtime
                            .handle
                            .as_ref()
                            .map(|h| h.is_finished())
                            .unwrap_or(false);
                        if !finished {
                            // A worker that survived past its setup phase
                            // clears the setup-retry ladder.
                            runtime.setup_attempts = 0;
                            Action::Nothing
                        } else {
                            match runtime.handle.take() {
                                Some(handle) => Action::Reap(handle),
                                None => Action::Nothing,
                            }
                        }
                    }
                }
            };

            match action {
                Action::Nothing => {}
                Action::Respawn(spec) => {
                    self.spawn_camera(spec, knobs, false).await;
                }
                Action::Reap(handle) => {
                    let exit = match handle.await {
                        Ok(exit) => Ok(exit),
                        Err(e) if e.is_panic() => Err(format!("worker panicked: {:?}", e)),
                        Err(e) => Err(format!("worker join error: {}", e)),
                    };
                    self.handle_worker_exit(&id, exit, knobs, now).await;
                }
            }
        }
    }

    async fn handle_worker_exit(
        &mut self,
        id: &str,
        exit: std::result::Result<WorkerExit, String>,
        knobs: &WorkerKnobs,
        now: Instant,
    ) {
        let respawn_spec = {
            let Some(runtime) = self.runtimes.get_mut(id) else {
                return;
            };
            match exit {
                Ok(WorkerExit::Clean) => {
                    // Clean exits only happen on shutdown.
                    None
                }
                Ok(WorkerExit::SetupFailed) => {
                    let attempts = runtime.setup_attempts + 1;
                    runtime.setup_attempts = attempts;
                    let multiplier =
                        BACKOFF_LADDER[(attempts as usize - 1).min(BACKOFF_LADDER.len() - 1)];
                    let delay = knobs.setup_retry_base() * multiplier;
                    tracing::warn!(
                        "Camera {}: setup failed, next attempt in {}s",
                        id,
                        delay.as_secs()
                    );
                    runtime.setup_state = SetupState::Retrying {
                        attempts,
                        next_retry: now + delay,
                    };
                    None
                }
                Err(reason) => {
                    tracing::error!("Camera {}: {}", id, reason);
                    while let Some(front) = runtime.restarts.front() {
                        if now.duration_since(*front) > RESTART_WINDOW {
                            runtime.restarts.pop_front();
                        } else {
                            break;
                        }
                    }
                    runtime.restarts.push_back(now);
                    if runtime.restarts.len() as u32 > knobs.max_worker_restarts() {
                        runtime
                            .public
                            .tracker
                            .lock()
                            .unwrap()
                            .mark_permanently_failed("worker restart limit exceeded");
                        runtime.setup_state = SetupState::Abandoned;
                        None
                    } else {
                        Some(runtime.public.spec.clone())
                    }
                }
            }
        };

        if let Some(spec) = respawn_spec {
            self.spawn_camera(spec, knobs, false).await;
        }
    }

    /// Wait for workers to finish their current operation, bounded by the
    /// configured grace period.
    async fn shutdown(&mut self) {
        let grace = {
            let cfg = self.config.read().await;
            Duration::from_secs(cfg.advanced.shutdown_grace.max(1))
        };
        tracing::info!("Capture coordinator shutting down, waiting up to {:?}", grace);
        let deadline = Instant::now() + grace;
        for (id, runtime) in self.runtimes.iter_mut() {
            if let Some(handle) = runtime.handle.take() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if tokio::time::timeout(remaining, handle).await.is_err() {
                    tracing::warn!("Camera {}: worker did not stop within grace period", id);
                }
            }
        }
    }
}

impl WorkerKnobs {
    fn setup_retry_base(&self) -> Duration {
        self.setup_retry_base
    }

    fn max_worker_restarts(&self) -> u32 {
        self.max_worker_restarts
    }
}

fn knobs_from(cfg: &Config) -> WorkerKnobs {
    WorkerKnobs {
        tuning: DriverTuning::from(&cfg.advanced),
        polling_interval: Duration::from_millis(cfg.advanced.polling_interval_ms.max(10)),
        reconnect_attempts: cfg.advanced.reconnect_attempts,
        reconnect_delay: Duration::from_secs(cfg.advanced.reconnect_delay),
        jpeg_quality: cfg.advanced.jpeg_quality,
        device: cfg.device.clone(),
        setup_retry_base: Duration::from_secs(cfg.advanced.setup_retry_base.max(1)),
        max_worker_restarts: cfg.advanced.max_worker_restarts,
    }
}

/// Everything a blocking worker owns for its lifetime.
struct WorkerContext {
    spec: CameraSpec,
    knobs: WorkerKnobs,
    tracker: Arc<StdMutex<CameraStateTracker>>,
    alive: Arc<AtomicBool>,
    position: Arc<StdMutex<String>>,
    command_rx: mpsc::Receiver<CameraCommand>,
    frame_tx: mpsc::Sender<CapturedFrame>,
    health: Arc<HealthState>,
    cancel: CancellationToken,
}

/// Flips the liveness flag back off when the worker ends, panics included.
struct AliveGuard(Arc<AtomicBool>);

impl AliveGuard {
    fn new(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::Relaxed);
        Self(flag)
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Synchronous per-camera loop. Captures are strictly serialized within one
/// camera; across cameras, workers are independent.
fn worker_loop(mut ctx: WorkerContext) -> WorkerExit {
    let _guard = AliveGuard::new(ctx.alive.clone());
    let rl = RateLimitedLogger::new(Duration::from_secs(60));

    let mut driver = CameraDriver::open(&ctx.spec, &ctx.knobs.tuning);
    if let Err(e) = driver.setup() {
        ctx.tracker
            .lock()
            .unwrap()
            .record_failure(&format!("setup: {}", e));
        return WorkerExit::SetupFailed;
    }

    let interval = Duration::from_secs(ctx.spec.capture_interval);
    let poll = ctx.knobs.polling_interval;
    let mut last_capture: Option<Instant> = None;
    let mut force = false;

    while !ctx.cancel.is_cancelled() {
        while let Ok(cmd) = ctx.command_rx.try_recv() {
            match cmd {
                CameraCommand::ForceCapture => {
                    tracing::info!("Camera {}: capture forced", ctx.spec.id);
                    force = true;
                }
                CameraCommand::Restart => {
                    tracing::info!("Camera {}: restart requested", ctx.spec.id);
                    driver.cleanup();
                    if let Err(e) = driver.setup() {
                        ctx.tracker
                            .lock()
                            .unwrap()
                            .record_failure(&format!("restart: {}", e));
                    }
                }
                CameraCommand::SetPosition(p) => {
                    *ctx.position.lock().unwrap() = p;
                }
            }
        }

        if !force {
            let (permanent, due) = {
                let tracker = ctx.tracker.lock().unwrap();
                (
                    tracker.permanent_failure().map(str::to_string),
                    tracker.should_attempt_capture(),
                )
            };

            if let Some(reason) = permanent {
                rl.warn_every(
                    "permanent",
                    Some(Duration::from_secs(60)),
                    &format!("Camera {}: disabled for this run: {}", ctx.spec.id, reason),
                );
                std::thread::sleep(poll);
                continue;
            }

            if !due {
                driver.keep_alive();
                std::thread::sleep(poll);
                continue;
            }

            if let Some(last) = last_capture {
                if last.elapsed() < interval {
                    std::thread::sleep(poll);
                    continue;
                }
            }
        }
        force = false;

        match capture_and_package(&mut driver, &ctx) {
            Ok(captured) => {
                ctx.tracker.lock().unwrap().record_success();
                last_capture = Some(Instant::now());
                if let Err(e) = ctx.frame_tx.try_send(captured) {
                    // Nothing is on disk yet; the frame is lost rather than
                    // blocking the capture loop behind a slow disk.
                    rl.warn(
                        "frame_queue_full",
                        &format!("Camera {}: frame queue full, frame dropped ({})", ctx.spec.id, e),
                    );
                }
            }
            Err(e) => {
                let class = e.class();
                ctx.tracker.lock().unwrap().record_failure(&e.to_string());
                match class {
                    FailureClass::Permanent => {
                        ctx.tracker
                            .lock()
                            .unwrap()
                            .mark_permanently_failed(&e.to_string());
                    }
                    FailureClass::Fatal => {
                        reconnect_with_backoff(&mut driver, &ctx);
                    }
                    FailureClass::Transient => {}
                }
            }
        }
    }

    driver.cleanup();
    WorkerExit::Clean
}

/// Bounded reconnect attempts with linear backoff between them.
fn reconnect_with_backoff(driver: &mut CameraDriver, ctx: &WorkerContext) {
    for attempt in 1..=ctx.knobs.reconnect_attempts {
        if ctx.cancel.is_cancelled() {
            return;
        }
        if attempt > 1 {
            std::thread::sleep(ctx.knobs.reconnect_delay * (attempt - 1));
        }
        tracing::warn!(
            "Camera {}: reconnect attempt {}/{}",
            ctx.spec.id,
            attempt,
            ctx.knobs.reconnect_attempts
        );
        match driver.reconnect() {
            Ok(()) => {
                tracing::info!("Camera {}: reconnected", ctx.spec.id);
                return;
            }
            Err(e) => {
                tracing::debug!("Camera {}: reconnect failed: {}", ctx.spec.id, e);
            }
        }
    }
}

/// Capture, validate, annotate, encode, and wrap with sidecar metadata.
fn capture_and_package(
    driver: &mut CameraDriver,
    ctx: &WorkerContext,
) -> Result<CapturedFrame, crate::error::CaptureError> {
    let mut frame = driver.capture_frame()?;
    let brightness = frame.validate(&ctx.spec.id)?;
    frame.annotate(&ctx.spec.id)?;
    let jpeg = frame.encode_jpeg(ctx.knobs.jpeg_quality)?;

    let position = ctx.position.lock().unwrap().clone();
    let system = ctx
        .health
        .latest_system_metrics()
        .and_then(|m| serde_json::to_value(m).ok());

    let metadata = json!({
        "camera_id": ctx.spec.id,
        "device_id": ctx.knobs.device.id,
        "location": ctx.knobs.device.location,
        "position": position,
        "captured_at": frame.captured_at.to_rfc3339(),
        "agent_version": env!("CARGO_PKG_VERSION"),
        "camera": driver.describe(),
        "system": system,
        "brightness_mean": brightness,
    });

    Ok(CapturedFrame {
        camera_id: ctx.spec.id.clone(),
        jpeg,
        metadata,
        captured_at: frame.captured_at,
    })
}

/// Initialize every configured camera once, print a summary, release them.
/// Drives the `--dry-run` CLI flag.
pub async fn dry_run(config: &Config) -> bool {
    let tuning = DriverTuning::from(&config.advanced);
    let mut all_ok = true;
    for spec in &config.cameras {
        let spec = spec.clone();
        let tuning = tuning.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut driver = CameraDriver::open(&spec, &tuning);
            let outcome = driver.setup();
            let description = driver.describe();
            driver.cleanup();
            (spec.id, outcome, description)
        })
        .await;
        match result {
            Ok((id, Ok(()), description)) => {
                tracing::info!("Camera {}: OK {}", id, description);
            }
            Ok((id, Err(e), _)) => {
                tracing::error!("Camera {}: {}", id, e);
                all_ok = false;
            }
            Err(e) => {
                tracing::error!("Dry-run worker failed: {}", e);
                all_ok = false;
            }
        }
    }
    all_ok
}
