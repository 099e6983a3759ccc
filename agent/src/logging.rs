//! Tracing initialization and log rate limiting.
//!
//! Both processes log to stdout and to a file under `logging.log_dir`; the
//! file is what the portal tails for the `log` event stream. The level filter
//! sits behind a reload handle so `POST /api/log_level` can change it without
//! a restart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::{parse_level, LoggingConfig};
use crate::error::{AgentError, Result};

/// Handle for swapping the level filter at runtime.
pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Keeps the reload handle and the non-blocking writer alive.
pub struct Logging {
    pub filter: FilterHandle,
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Initialize the global subscriber: reloadable filter, stdout layer, file layer.
pub fn init(cfg: &LoggingConfig) -> Result<Logging> {
    std::fs::create_dir_all(&cfg.log_dir)?;

    let file_appender = tracing_appender::rolling::never(&cfg.log_dir, &cfg.log_file);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let directive = parse_level(&cfg.level).unwrap_or("info");
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let (filter_layer, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(Logging {
        filter: handle,
        _guard: guard,
    })
}

/// Swap the active level. Accepts the operator names WARNING/INFO/DEBUG.
pub fn set_level(handle: &FilterHandle, level: &str) -> Result<()> {
    let directive = parse_level(level)
        .ok_or_else(|| AgentError::Config(format!("unknown log level '{}'", level)))?;
    handle
        .reload(EnvFilter::new(directive))
        .map_err(|e| AgentError::Internal(format!("failed to reload log filter: {}", e)))?;
    tracing::info!(level = directive, "Log level changed");
    Ok(())
}

/// Collapses repeated keyed messages so an offline camera cannot dominate
/// disk I/O. The first occurrence is logged; repeats within the interval are
/// counted and summarized on the next emission.
pub struct RateLimitedLogger {
    default_interval: Duration,
    state: Mutex<HashMap<String, RateState>>,
}

struct RateState {
    last: Instant,
    suppressed: u32,
}

impl RateLimitedLogger {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Some(suppressed_count)` when the message should be emitted.
    fn check(&self, key: &str, interval: Option<Duration>) -> Option<u32> {
        let interval = interval.unwrap_or(self.default_interval);
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        match state.get_mut(key) {
            Some(entry) if now.duration_since(entry.last) < interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                state.insert(
                    key.to_string(),
                    RateState {
                        last: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    fn format(msg: &str, suppressed: u32) -> String {
        if suppressed > 0 {
            format!("{} (repeated {}x since last log)", msg, suppressed)
        } else {
            msg.to_string()
        }
    }

    pub fn warn(&self, key: &str, msg: &str) {
        self.warn_every(key, None, msg);
    }

    pub fn warn_every(&self, key: &str, interval: Option<Duration>, msg: &str) {
        if let Some(suppressed) = self.check(key, interval) {
            tracing::warn!("{}", Self::format(msg, suppressed));
        }
    }

    pub fn info(&self, key: &str, msg: &str) {
        if let Some(suppressed) = self.check(key, None) {
            tracing::info!("{}", Self::format(msg, suppressed));
        }
    }

    pub fn debug(&self, key: &str, msg: &str) {
        if let Some(suppressed) = self.check(key, None) {
            tracing::debug!("{}", Self::format(msg, suppressed));
        }
    }

    /// Drop the rate state for a key so the next error after recovery is
    /// logged immediately.
    pub fn clear(&self, key: &str) {
        self.state.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_emission_passes_then_suppresses() {
        let rl = RateLimitedLogger::new(Duration::from_secs(60));
        assert_eq!(rl.check("k", None), Some(0));
        assert_eq!(rl.check("k", None), None);
        assert_eq!(rl.check("k", None), None);
    }

    #[test]
    fn suppressed_count_reported_after_interval() {
        let rl = RateLimitedLogger::new(Duration::from_millis(1));
        assert_eq!(rl.check("k", None), Some(0));
        assert_eq!(rl.check("k", None), None);
        assert_eq!(rl.check("k", None), None);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(rl.check("k", None), Some(2));
    }

    #[test]
    fn keys_are_independent() {
        let rl = RateLimitedLogger::new(Duration::from_secs(60));
        assert_eq!(rl.check("a", None), Some(0));
        assert_eq!(rl.check("b", None), Some(0));
        assert_eq!(rl.check("a", None), None);
    }

    #[test]
    fn clear_resets_a_key() {
        let rl = RateLimitedLogger::new(Duration::from_secs(60));
        assert_eq!(rl.check("k", None), Some(0));
        assert_eq!(rl.check("k", None), None);
        rl.clear("k");
        assert_eq!(rl.check("k", None), Some(0));
    }

    #[test]
    fn suffix_formatting() {
        assert_eq!(RateLimitedLogger::format("msg", 0), "msg");
        assert_eq!(
            RateLimitedLogger::format("msg", 3),
            "msg (repeated 3x since last log)"
        );
    }
}
