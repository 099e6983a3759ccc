//! Per-camera health state machine with capped exponential backoff.
//!
//! Each worker owns the tracker for its camera and is its only writer; the
//! health monitor reads point-in-time copies via [`CameraStateTracker::status`].

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::logging::RateLimitedLogger;

/// Health state of one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    Healthy,
    Failing,
    Offline,
}

impl std::fmt::Display for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraState::Healthy => write!(f, "healthy"),
            CameraState::Failing => write!(f, "failing"),
            CameraState::Offline => write!(f, "offline"),
        }
    }
}

/// Failures tolerated before a camera is declared offline.
const OFFLINE_AFTER_FAILURES: u32 = 3;

/// Cap for the backoff multiplier ladder 1, 2, 4, 8, 12.
const MAX_BACKOFF_MULTIPLIER: u32 = 12;

/// Serializable point-in-time view of a tracker.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    pub state: CameraState,
    pub consecutive_failures: u32,
    pub backoff_multiplier: u32,
    pub current_backoff_seconds: u64,
    pub seconds_until_next_attempt: u64,
    pub last_success_age_seconds: Option<u64>,
    pub last_error: Option<String>,
    pub permanent_failure: Option<String>,
}

pub struct CameraStateTracker {
    camera_id: String,
    capture_interval: Duration,
    state: CameraState,
    consecutive_failures: u32,
    backoff_multiplier: u32,
    next_attempt: Option<Instant>,
    last_success: Option<Instant>,
    last_error: Option<String>,
    /// Set when retrying is pointless for the rest of the run (bad
    /// credentials, restart storm). Clears only on restart/config reload.
    permanent_failure: Option<String>,
    rl: RateLimitedLogger,
}

impl CameraStateTracker {
    pub fn new(camera_id: &str, capture_interval: Duration) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            capture_interval,
            state: CameraState::Healthy,
            consecutive_failures: 0,
            backoff_multiplier: 1,
            next_attempt: None,
            last_success: None,
            last_error: None,
            permanent_failure: None,
            rl: RateLimitedLogger::new(capture_interval.max(Duration::from_secs(60))),
        }
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn backoff_multiplier(&self) -> u32 {
        self.backoff_multiplier
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn permanent_failure(&self) -> Option<&str> {
        self.permanent_failure.as_deref()
    }

    /// Current retry spacing: multiplier x capture interval.
    pub fn current_backoff(&self) -> Duration {
        self.capture_interval * self.backoff_multiplier
    }

    /// True when a capture attempt is due.
    pub fn should_attempt_capture(&self) -> bool {
        self.should_attempt_capture_at(Instant::now())
    }

    pub fn should_attempt_capture_at(&self, now: Instant) -> bool {
        if self.permanent_failure.is_some() {
            return false;
        }
        match self.state {
            CameraState::Healthy => true,
            _ => self.next_attempt.map(|t| now >= t).unwrap_or(true),
        }
    }

    /// Record a successful capture: back to healthy, counters reset.
    pub fn record_success(&mut self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(&mut self, now: Instant) {
        if self.state != CameraState::Healthy {
            tracing::info!(
                "Camera {}: recovered after {} failures",
                self.camera_id,
                self.consecutive_failures
            );
            self.rl.clear(&format!("{}_offline", self.camera_id));
            self.rl.clear(&format!("{}_failure", self.camera_id));
        }
        self.state = CameraState::Healthy;
        self.consecutive_failures = 0;
        self.backoff_multiplier = 1;
        self.next_attempt = None;
        self.last_success = Some(now);
        self.last_error = None;
    }

    /// Record a failed capture and schedule the next attempt.
    pub fn record_failure(&mut self, error: &str) {
        self.record_failure_at(Instant::now(), error);
    }

    pub fn record_failure_at(&mut self, now: Instant, error: &str) {
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());

        let new_state = if self.consecutive_failures >= OFFLINE_AFTER_FAILURES {
            CameraState::Offline
        } else {
            CameraState::Failing
        };

        if new_state == CameraState::Offline {
            // Double on every offline failure, capped so a dead camera is
            // still retried at least every 12x its interval.
            self.backoff_multiplier =
                (self.backoff_multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
        }

        if new_state != self.state {
            if new_state == CameraState::Offline {
                self.rl.warn(
                    &format!("{}_offline", self.camera_id),
                    &format!(
                        "Camera {}: marked offline after {} consecutive failures, retrying every {}s",
                        self.camera_id,
                        self.consecutive_failures,
                        self.current_backoff().as_secs()
                    ),
                );
            } else {
                tracing::warn!(
                    "Camera {}: {} (failure {})",
                    self.camera_id,
                    error,
                    self.consecutive_failures
                );
            }
            self.state = new_state;
        } else if self.state == CameraState::Offline {
            self.rl.warn_every(
                &format!("{}_failure", self.camera_id),
                Some(self.current_backoff()),
                &format!(
                    "Camera {}: still offline, next retry in {}s",
                    self.camera_id,
                    self.current_backoff().as_secs()
                ),
            );
        } else {
            tracing::warn!(
                "Camera {}: {} (failure {})",
                self.camera_id,
                error,
                self.consecutive_failures
            );
        }

        self.next_attempt = Some(now + self.current_backoff());
    }

    /// Stop all further attempts for this run.
    pub fn mark_permanently_failed(&mut self, reason: &str) {
        if self.permanent_failure.is_none() {
            tracing::warn!(
                "Camera {}: permanently failed for this run: {}",
                self.camera_id,
                reason
            );
        }
        self.permanent_failure = Some(reason.to_string());
        self.state = CameraState::Offline;
    }

    /// Point-in-time copy for the health monitor.
    pub fn status(&self) -> TrackerStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> TrackerStatus {
        TrackerStatus {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            backoff_multiplier: self.backoff_multiplier,
            current_backoff_seconds: self.current_backoff().as_secs(),
            seconds_until_next_attempt: self
                .next_attempt
                .map(|t| t.saturating_duration_since(now).as_secs())
                .unwrap_or(0),
            last_success_age_seconds: self
                .last_success
                .map(|t| now.saturating_duration_since(t).as_secs()),
            last_error: self.last_error.clone(),
            permanent_failure: self.permanent_failure.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(interval_secs: u64) -> CameraStateTracker {
        CameraStateTracker::new("cam-test", Duration::from_secs(interval_secs))
    }

    #[test]
    fn three_failures_reach_offline() {
        let mut t = tracker(10);
        let now = Instant::now();
        t.record_failure_at(now, "timeout");
        assert_eq!(t.state(), CameraState::Failing);
        t.record_failure_at(now, "timeout");
        assert_eq!(t.state(), CameraState::Failing);
        t.record_failure_at(now, "timeout");
        assert_eq!(t.state(), CameraState::Offline);
    }

    #[test]
    fn multiplier_stays_on_the_ladder() {
        let mut t = tracker(10);
        let now = Instant::now();
        for _ in 0..20 {
            t.record_failure_at(now, "unreachable");
            if t.state() == CameraState::Offline {
                assert!(
                    [1, 2, 4, 8, 12].contains(&t.backoff_multiplier()),
                    "multiplier {} off the ladder",
                    t.backoff_multiplier()
                );
            }
        }
        assert_eq!(t.backoff_multiplier(), 12);
    }

    #[test]
    fn multiplier_monotonic_while_offline() {
        let mut t = tracker(5);
        let now = Instant::now();
        let mut last = 0;
        for _ in 0..10 {
            t.record_failure_at(now, "unreachable");
            if t.state() == CameraState::Offline {
                assert!(t.backoff_multiplier() >= last);
                last = t.backoff_multiplier();
            }
        }
    }

    #[test]
    fn success_resets_everything() {
        let mut t = tracker(10);
        let now = Instant::now();
        for _ in 0..7 {
            t.record_failure_at(now, "timeout");
        }
        t.record_success_at(now);
        assert_eq!(t.state(), CameraState::Healthy);
        assert_eq!(t.consecutive_failures(), 0);
        assert_eq!(t.backoff_multiplier(), 1);
        assert!(t.should_attempt_capture_at(now));
    }

    #[test]
    fn backoff_delays_next_attempt() {
        let mut t = tracker(10);
        let now = Instant::now();
        for _ in 0..3 {
            t.record_failure_at(now, "unreachable");
        }
        // Entered offline with multiplier doubled to 2: next attempt 20s out.
        assert!(!t.should_attempt_capture_at(now));
        assert!(!t.should_attempt_capture_at(now + Duration::from_secs(19)));
        assert!(t.should_attempt_capture_at(now + Duration::from_secs(20)));
    }

    #[test]
    fn healthy_always_attempts() {
        let t = tracker(300);
        assert!(t.should_attempt_capture_at(Instant::now()));
    }

    #[test]
    fn permanent_failure_stops_attempts() {
        let mut t = tracker(10);
        t.mark_permanently_failed("authentication rejected");
        assert!(!t.should_attempt_capture_at(Instant::now()));
        assert_eq!(t.state(), CameraState::Offline);
        assert!(t.status().permanent_failure.is_some());
    }

    #[test]
    fn status_reflects_counters() {
        let mut t = tracker(10);
        let now = Instant::now();
        t.record_failure_at(now, "empty frame");
        let s = t.status_at(now);
        assert_eq!(s.state, CameraState::Failing);
        assert_eq!(s.consecutive_failures, 1);
        assert_eq!(s.last_error.as_deref(), Some("empty frame"));
        assert_eq!(s.seconds_until_next_attempt, 10);
    }
}
