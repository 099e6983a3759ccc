//! Upload worker: drains the pending-image queue to the inference server.
//!
//! Single consumer, multiple producers. Retryable failures (network, 5xx,
//! 429) are re-queued on a capped backoff schedule; other 4xx responses are
//! permanent and recorded in the image's sidecar. Items still in flight when
//! the shutdown grace expires stay in `pending/` and are rehydrated on the
//! next start.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::logging::RateLimitedLogger;
use crate::storage::{PendingRef, StorageManager};

/// Delays before each scheduled retry of a retryable upload failure.
const RETRY_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(4),
    Duration::from_secs(16),
    Duration::from_secs(64),
    Duration::from_secs(256),
];

/// What happened to one upload attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    /// Transient server or network trouble; try again later.
    Retry(String),
    /// The server will never accept this item (4xx other than 429).
    Permanent(String),
    /// The file vanished before we could read it (raced with cleanup).
    Skipped,
}

/// Classify an HTTP status the way the retry loop needs it.
pub fn classify_status(status: u16) -> UploadOutcome {
    match status {
        200..=299 => UploadOutcome::Uploaded,
        429 => UploadOutcome::Retry(format!("HTTP {}", status)),
        400..=499 => UploadOutcome::Permanent(format!("HTTP {}", status)),
        _ => UploadOutcome::Retry(format!("HTTP {}", status)),
    }
}

struct ScheduledRetry {
    due: Instant,
    item: PendingRef,
}

impl PartialEq for ScheduledRetry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for ScheduledRetry {}
impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due)
    }
}

pub struct UploadWorker {
    storage: Arc<StorageManager>,
    config: Arc<RwLock<Config>>,
    client: reqwest::Client,
    schedule: Vec<Duration>,
    rl: RateLimitedLogger,
    /// Local save mode: consume the queue without contacting the server.
    upload_enabled: bool,
}

impl UploadWorker {
    pub fn new(
        storage: Arc<StorageManager>,
        config: Arc<RwLock<Config>>,
        server_cfg: &crate::config::ServerConfig,
        upload_enabled: bool,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(server_cfg.timeout.max(1)));
        if !server_cfg.ssl_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(cert_path) = &server_cfg.cert_path {
            let pem = std::fs::read(cert_path)?;
            let cert = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(cert);
        }
        Ok(Self {
            storage,
            config,
            client: builder.build()?,
            schedule: RETRY_SCHEDULE.to_vec(),
            rl: RateLimitedLogger::new(Duration::from_secs(60)),
            upload_enabled,
        })
    }

    /// Shrink the retry schedule (used by tests).
    #[cfg(test)]
    pub fn with_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.schedule = schedule;
        self
    }

    /// Run until cancelled, then drain within the grace period.
    ///
    /// `backlog` is the restart rehydration scan of `pending/`.
    pub async fn run(
        mut self,
        backlog: Vec<PendingRef>,
        mut rx: mpsc::Receiver<PendingRef>,
        cancel: CancellationToken,
        grace: Duration,
    ) {
        if !backlog.is_empty() {
            tracing::info!("Rehydrated {} pending uploads from disk", backlog.len());
        }
        let mut retries: BinaryHeap<Reverse<ScheduledRetry>> = BinaryHeap::new();
        for item in backlog {
            retries.push(Reverse(ScheduledRetry {
                due: Instant::now(),
                item,
            }));
        }

        loop {
            let next_due = retries.peek().map(|Reverse(r)| r.due);
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(item) => self.process(item, &mut retries).await,
                    None => break,
                },
                _ = sleep_until_opt(next_due) => {
                    if let Some(Reverse(retry)) = retries.pop() {
                        self.process(retry.item, &mut retries).await;
                    }
                }
            }
        }

        // Drain what is already queued, bounded by the grace period. Anything
        // left is safe on disk.
        let deadline = Instant::now() + grace;
        let mut abandoned = retries.len();
        while let Ok(item) = rx.try_recv() {
            if Instant::now() >= deadline {
                abandoned += 1;
                continue;
            }
            let mut no_retries = BinaryHeap::new();
            self.process(item, &mut no_retries).await;
            abandoned += no_retries.len();
        }
        if abandoned > 0 {
            tracing::info!(
                "Shutdown: abandoned {} queued uploads, they remain in pending/",
                abandoned
            );
        }
    }

    async fn process(
        &mut self,
        mut item: PendingRef,
        retries: &mut BinaryHeap<Reverse<ScheduledRetry>>,
    ) {
        if !self.upload_enabled {
            // Local-save mode keeps images in pending/ untouched.
            return;
        }

        item.attempts += 1;
        let outcome = match self.upload_one(&item).await {
            Ok(outcome) => outcome,
            Err(e) => UploadOutcome::Retry(e.to_string()),
        };

        match outcome {
            UploadOutcome::Uploaded => {
                if let Err(e) = self.storage.mark_uploaded(&item).await {
                    tracing::warn!("Uploaded {} but could not move it: {}", item.file_name, e);
                } else {
                    tracing::debug!("Uploaded {}", item.file_name);
                }
            }
            UploadOutcome::Skipped => {
                tracing::debug!("Upload source {} vanished, skipping", item.file_name);
            }
            UploadOutcome::Permanent(reason) => {
                self.rl.warn(
                    "upload_permanent",
                    &format!(
                        "Upload of {} rejected permanently ({}), not retrying",
                        item.file_name, reason
                    ),
                );
                if let Err(e) = self.storage.mark_failed_permanent(&item, &reason).await {
                    tracing::warn!("Cannot record permanent failure: {}", e);
                }
            }
            UploadOutcome::Retry(reason) => {
                // One immediate attempt plus one scheduled retry per
                // schedule entry, then the item parks on disk.
                let max_retries = self.schedule.len() as u32;
                if item.attempts > max_retries {
                    tracing::warn!(
                        "Upload of {} failed {} times ({}), leaving it in pending/ for the next run",
                        item.file_name,
                        item.attempts,
                        reason
                    );
                } else {
                    let delay = self.schedule[(item.attempts - 1) as usize];
                    tracing::debug!(
                        "Upload of {} failed ({}), retry {} in {:?}",
                        item.file_name,
                        reason,
                        item.attempts + 1,
                        delay
                    );
                    retries.push(Reverse(ScheduledRetry {
                        due: Instant::now() + delay,
                        item,
                    }));
                }
            }
        }
    }

    async fn upload_one(&self, item: &PendingRef) -> Result<UploadOutcome> {
        let image = match tokio::fs::read(&item.image_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(UploadOutcome::Skipped)
            }
            Err(e) => return Err(e.into()),
        };

        let metadata_json = match tokio::fs::read_to_string(&item.sidecar_path).await {
            Ok(text) => text,
            Err(_) => serde_json::json!({ "camera_id": item.camera_id }).to_string(),
        };

        let (url, token, timeout) = {
            let cfg = self.config.read().await;
            (
                cfg.server.url.clone(),
                cfg.server.auth_token.clone(),
                Duration::from_secs(cfg.server.timeout.max(1)),
            )
        };

        let form = reqwest::multipart::Form::new()
            .part(
                "image",
                reqwest::multipart::Part::bytes(image)
                    .file_name(item.file_name.clone())
                    .mime_str("image/jpeg")
                    .map_err(crate::error::AgentError::Http)?,
            )
            .part(
                "metadata",
                reqwest::multipart::Part::text(metadata_json)
                    .file_name("metadata.json")
                    .mime_str("application/json")
                    .map_err(crate::error::AgentError::Http)?,
            );

        let mut request = self.client.post(&url).multipart(form).timeout(timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => Ok(classify_status(response.status().as_u16())),
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                Ok(UploadOutcome::Retry(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(t) => tokio::time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}
