//! Server-sent events: tiered status stream plus live log tailing.
//!
//! Each browser holds one `/api/events` connection. Three timers feed it at
//! different cadences (`health` ~1 s, `status` ~20 s, `slow` ~500 s) and a
//! broadcast channel delivers freshly appended log lines. Health events are
//! coalesced: identical consecutive payloads are suppressed.

use std::collections::hash_map::DefaultHasher;
use std::convert::Infallible;
use std::hash::{Hash, Hasher};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{AppendHeaders, IntoResponse};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agent_client;
use crate::handlers;
use crate::state::SharedState;
use crate::wifi;

const HEALTH_PERIOD: Duration = Duration::from_secs(1);
const STATUS_PERIOD: Duration = Duration::from_secs(20);
const SLOW_PERIOD: Duration = Duration::from_secs(500);

/// `GET /api/events`
pub async fn sse_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(event_pump(state, tx));

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    (
        AppendHeaders([
            ("Cache-Control", "no-cache"),
            // Keep reverse proxies from buffering the stream.
            ("X-Accel-Buffering", "no"),
        ]),
        Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))),
    )
}

/// Feeds one browser connection until it goes away.
async fn event_pump(state: SharedState, tx: mpsc::Sender<Event>) {
    let mut log_rx = state.log_tx.subscribe();

    let mut health_tick = tokio::time::interval(HEALTH_PERIOD);
    let mut status_tick = tokio::time::interval(STATUS_PERIOD);
    let mut slow_tick = tokio::time::interval(SLOW_PERIOD);
    health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    slow_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_health_hash: Option<u64> = None;

    loop {
        tokio::select! {
            _ = health_tick.tick() => {
                let payload = health_payload(&state).await;
                let hash = hash_payload(&payload);
                if last_health_hash == Some(hash) {
                    continue;
                }
                last_health_hash = Some(hash);
                if send_event(&tx, "health", payload).await.is_err() {
                    break;
                }
            }
            _ = status_tick.tick() => {
                let payload = status_payload(&state).await;
                if send_event(&tx, "status", payload).await.is_err() {
                    break;
                }
            }
            _ = slow_tick.tick() => {
                let payload = slow_payload(&state).await;
                if send_event(&tx, "slow", payload).await.is_err() {
                    break;
                }
            }
            line = log_rx.recv() => match line {
                Ok(line) => {
                    if send_event(&tx, "log", json!({ "log": line })).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("SSE log subscriber lagged, skipped {} lines", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn send_event(
    tx: &mpsc::Sender<Event>,
    kind: &str,
    payload: serde_json::Value,
) -> Result<(), ()> {
    tx.send(Event::default().event(kind).data(payload.to_string()))
        .await
        .map_err(|_| ())
}

fn hash_payload(payload: &serde_json::Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Fast tier: cached system metrics and per-camera state.
async fn health_payload(state: &SharedState) -> serde_json::Value {
    let socket = state.config.read().await.advanced.health_socket.clone();
    match agent_client::health(&socket, "full").await {
        Ok(full) => json!({
            "system": full["system"],
            "cameras": full["cameras"],
            "stale": full["stale"],
        }),
        Err(e) => json!({ "agent_error": e.to_string() }),
    }
}

/// Medium tier: network, AP and update state.
async fn status_payload(state: &SharedState) -> serde_json::Value {
    let cfg = state.config.read().await.clone();
    json!({
        "network": handlers::network_info().await,
        "wifi_ap": wifi::ap_info(&cfg.wifi_ap, &cfg.device.id).await,
        "update": handlers::update_info(&cfg.updates.state_path),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

/// Slow tier: storage totals.
async fn slow_payload(state: &SharedState) -> serde_json::Value {
    let socket = state.config.read().await.advanced.health_socket.clone();
    match agent_client::health(&socket, "full").await {
        Ok(full) => json!({ "storage": full["storage"] }),
        Err(e) => json!({ "agent_error": e.to_string() }),
    }
}

// ---------------------------------------------------------------------------
// Log tailer
// ---------------------------------------------------------------------------

/// Tail the agent's log file into the broadcast channel, surviving rotation.
///
/// Rotation is detected by inode change or truncation; the tailer then
/// re-opens from the start of the new file so no post-rotation lines are
/// lost. On startup it seeks to the end, tail -f style.
pub async fn run_log_tailer(
    path: PathBuf,
    tx: broadcast::Sender<String>,
    cancel: CancellationToken,
) {
    let mut tracked: Option<(u64, u64)> = None; // (inode, offset)
    let mut partial = String::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }

        let Ok(meta) = tokio::fs::metadata(&path).await else {
            // File not there (yet, or mid-rotation); forget state so the new
            // file is read from the start once it appears.
            tracked = None;
            continue;
        };
        let inode = meta.ino();
        let len = meta.len();

        let offset = match tracked {
            None => {
                // First sighting: only stream lines appended from now on.
                tracked = Some((inode, len));
                continue;
            }
            Some((seen_inode, offset)) if seen_inode != inode || len < offset => {
                // Rotated or truncated: start over on the new file.
                partial.clear();
                0
            }
            Some((_, offset)) => offset,
        };

        if len == offset {
            tracked = Some((inode, offset));
            continue;
        }

        let Ok(mut file) = tokio::fs::File::open(&path).await else {
            continue;
        };
        if file
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .is_err()
        {
            continue;
        }
        let mut buf = String::new();
        let Ok(_) = file.read_to_string(&mut buf).await else {
            continue;
        };
        tracked = Some((inode, len));

        partial.push_str(&buf);
        while let Some(newline) = partial.find('\n') {
            let line: String = partial.drain(..=newline).collect();
            let line = line.trim_end().to_string();
            if !line.is_empty() {
                // No subscribers is fine; send only fails then.
                let _ = tx.send(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    async fn wait_for_line(rx: &mut broadcast::Receiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .and_then(|r| r.ok())
    }

    #[tokio::test]
    async fn tailer_streams_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, "old line\n").unwrap();

        let (tx, mut rx) = broadcast::channel(64);
        let cancel = CancellationToken::new();
        let tailer = tokio::spawn(run_log_tailer(path.clone(), tx, cancel.clone()));

        // Let the tailer take its initial position past the old content.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "fresh line").unwrap();
        }

        let line = wait_for_line(&mut rx).await.expect("line streamed");
        assert_eq!(line, "fresh line");

        cancel.cancel();
        let _ = tailer.await;
    }

    #[tokio::test]
    async fn tailer_survives_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, "pre-rotation\n").unwrap();

        let (tx, mut rx) = broadcast::channel(64);
        let cancel = CancellationToken::new();
        let tailer = tokio::spawn(run_log_tailer(path.clone(), tx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(1200)).await;

        // Rotate: move the file aside and create a fresh one (new inode).
        std::fs::rename(&path, dir.path().join("agent.log.1")).unwrap();
        std::fs::write(&path, "after rotation\n").unwrap();

        let line = wait_for_line(&mut rx).await.expect("line after rotation");
        assert_eq!(line, "after rotation");

        cancel.cancel();
        let _ = tailer.await;
    }

    #[test]
    fn identical_payloads_hash_equal() {
        let a = json!({ "system": { "cpu": 10 }, "cameras": [] });
        let b = json!({ "system": { "cpu": 10 }, "cameras": [] });
        let c = json!({ "system": { "cpu": 11 }, "cameras": [] });
        assert_eq!(hash_payload(&a), hash_payload(&b));
        assert_ne!(hash_payload(&a), hash_payload(&c));
    }
}
