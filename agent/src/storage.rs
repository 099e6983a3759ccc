//! Local image storage: pending/uploaded subtrees, retention, and
//! disk-pressure cleanup.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/
//!   pending/<camera_id>/<yyyy-mm-dd>/<camera>_<timestamp>.jpg
//!   pending/metadata/<filename>.json
//!   uploaded/<camera_id>/<yyyy-mm-dd>/...
//!   uploaded/metadata/...
//! ```
//!
//! Every file under `pending/` is implicitly queued for upload; restart
//! recovery is a directory scan. Cleanup tolerates files vanishing under it
//! (a concurrent pass or an uploader move), logging those at debug only.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::config::StorageConfig;
use crate::error::{AgentError, Result};

/// Fraction of the size cap cleanup shrinks to once the cap is exceeded.
const CLEANUP_TARGET_RATIO: f64 = 0.8;

/// Reference to one stored image awaiting upload.
#[derive(Debug, Clone)]
pub struct PendingRef {
    pub camera_id: String,
    pub file_name: String,
    pub image_path: PathBuf,
    pub sidecar_path: PathBuf,
    /// Upload attempts so far; maintained by the upload worker.
    pub attempts: u32,
}

/// Counters returned by a cleanup pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupStats {
    pub files_removed: u64,
    pub bytes_freed: u64,
}

/// Storage totals surfaced through the health snapshot and the portal.
#[derive(Debug, Clone, Serialize)]
pub struct StorageTotals {
    pub pending_images: u64,
    pub uploaded_images: u64,
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
}

pub struct StorageManager {
    pending: PathBuf,
    uploaded: PathBuf,
    max_size_bytes: u64,
    threshold_bytes: u64,
    retention: Duration,
    total_size: AtomicU64,
}

impl StorageManager {
    /// Create the directory layout and take stock of what is already there.
    pub async fn new(cfg: &StorageConfig) -> Result<Self> {
        let base = cfg.base_path.clone();
        let pending = base.join("pending");
        let uploaded = base.join("uploaded");

        for dir in [
            pending.clone(),
            pending.join("metadata"),
            uploaded.clone(),
            uploaded.join("metadata"),
        ] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                AgentError::Storage(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        let manager = Self {
            pending,
            uploaded,
            max_size_bytes: gb_to_bytes(cfg.max_size_gb),
            threshold_bytes: gb_to_bytes(cfg.cleanup_threshold_gb),
            retention: Duration::from_secs(cfg.retention_days * 24 * 3600),
            total_size: AtomicU64::new(0),
        };

        let initial = manager.scan_total_size().await;
        manager.total_size.store(initial, Ordering::Relaxed);
        tracing::info!(
            "Storage ready at {} ({:.1} MB used)",
            base.display(),
            initial as f64 / 1024.0 / 1024.0
        );
        Ok(manager)
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    fn file_name(camera_id: &str, captured_at: DateTime<Utc>) -> String {
        format!(
            "{}_{}.jpg",
            camera_id,
            captured_at.format("%Y-%m-%d_%H-%M-%S-%3f")
        )
    }

    /// Write the JPEG and its metadata sidecar, returning the queued ref.
    ///
    /// Triggers an immediate cleanup when the new file would push usage past
    /// the cap, and fails with disk-full when cleanup cannot make room.
    pub async fn store(
        &self,
        camera_id: &str,
        jpeg: &[u8],
        metadata: &serde_json::Value,
        captured_at: DateTime<Utc>,
    ) -> Result<PendingRef> {
        let incoming = jpeg.len() as u64;
        if self.total_size_bytes() + incoming > self.max_size_bytes {
            tracing::warn!("Storage cap reached, forcing cleanup before store");
            self.cleanup().await?;
            if self.total_size_bytes() + incoming > self.max_size_bytes {
                return Err(AgentError::DiskFull(format!(
                    "{} bytes needed, {} in use of {} cap",
                    incoming,
                    self.total_size_bytes(),
                    self.max_size_bytes
                )));
            }
        }

        let file_name = Self::file_name(camera_id, captured_at);
        let day = captured_at.format("%Y-%m-%d").to_string();
        let dir = self.pending.join(camera_id).join(&day);
        tokio::fs::create_dir_all(&dir).await?;

        let image_path = dir.join(&file_name);
        write_atomic(&image_path, jpeg).await?;

        let sidecar_path = self.pending.join("metadata").join(format!("{}.json", file_name));
        let mut sidecar = metadata.clone();
        sidecar["upload"] = serde_json::json!({
            "status": "pending",
            "attempts": 0,
        });
        write_atomic(&sidecar_path, serde_json::to_string_pretty(&sidecar)?.as_bytes()).await?;

        self.total_size.fetch_add(incoming, Ordering::Relaxed);
        tracing::debug!("Stored image {}", image_path.display());

        Ok(PendingRef {
            camera_id: camera_id.to_string(),
            file_name,
            image_path,
            sidecar_path,
            attempts: 0,
        })
    }

    /// Move an image and its sidecar into the uploaded subtree.
    ///
    /// Idempotent: a missing source means another call already moved it, and
    /// is logged at debug only.
    pub async fn mark_uploaded(&self, pending: &PendingRef) -> Result<()> {
        let rel = pending
            .image_path
            .strip_prefix(&self.pending)
            .map_err(|_| AgentError::Storage("ref outside pending subtree".to_string()))?;
        let dest = self.uploaded.join(rel);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::rename(&pending.image_path, &dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    "mark_uploaded: {} already moved",
                    pending.image_path.display()
                );
            }
            Err(e) => return Err(e.into()),
        }

        // Rewrite the sidecar with its final status on the uploaded side.
        let dest_sidecar = self
            .uploaded
            .join("metadata")
            .join(format!("{}.json", pending.file_name));
        match tokio::fs::read(&pending.sidecar_path).await {
            Ok(bytes) => {
                let mut doc: serde_json::Value =
                    serde_json::from_slice(&bytes).unwrap_or_else(|_| serde_json::json!({}));
                doc["upload"] = serde_json::json!({
                    "status": "uploaded",
                    "attempts": pending.attempts,
                    "uploaded_at": Utc::now().to_rfc3339(),
                });
                write_atomic(&dest_sidecar, serde_json::to_string_pretty(&doc)?.as_bytes())
                    .await?;
                if let Err(e) = tokio::fs::remove_file(&pending.sidecar_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(
                            "mark_uploaded: cannot remove sidecar {}: {}",
                            pending.sidecar_path.display(),
                            e
                        );
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    "mark_uploaded: sidecar {} already moved",
                    pending.sidecar_path.display()
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Record a permanent upload failure in the sidecar. The image stays in
    /// `pending/` until retention removes it.
    pub async fn mark_failed_permanent(&self, pending: &PendingRef, error: &str) -> Result<()> {
        let mut doc: serde_json::Value = match tokio::fs::read(&pending.sidecar_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| serde_json::json!({})),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::json!({}),
            Err(e) => return Err(e.into()),
        };
        doc["upload"] = serde_json::json!({
            "status": "failed-permanent",
            "attempts": pending.attempts,
            "last_error": error,
            "failed_at": Utc::now().to_rfc3339(),
        });
        write_atomic(
            &pending.sidecar_path,
            serde_json::to_string_pretty(&doc)?.as_bytes(),
        )
        .await
    }

    /// Retention pass plus size-cap pass. Invoked hourly and on disk pressure.
    pub async fn cleanup(&self) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();
        let cutoff = SystemTime::now()
            .checked_sub(self.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        // Retention: uploaded first, then pending, oldest first.
        for root in [&self.uploaded, &self.pending] {
            let files = self.collect_images(root).await;
            for entry in files {
                if entry.modified < cutoff {
                    self.remove_image(root, &entry, &mut stats).await;
                }
            }
        }

        // Size cap: shrink to 80% of the cap, oldest first, sparing
        // pending/ for as long as uploaded/ has anything to give.
        if self.total_size_bytes() > self.threshold_bytes {
            let target =
                ((self.max_size_bytes as f64 * CLEANUP_TARGET_RATIO) as u64).min(self.threshold_bytes);
            tracing::info!(
                "Storage over threshold ({} bytes), shrinking to {} bytes",
                self.total_size_bytes(),
                target
            );
            'roots: for root in [&self.uploaded, &self.pending] {
                let files = self.collect_images(root).await;
                for entry in files {
                    if self.total_size_bytes() <= target {
                        break 'roots;
                    }
                    self.remove_image(root, &entry, &mut stats).await;
                }
            }
        }

        if stats.files_removed > 0 {
            tracing::info!(
                "Cleanup removed {} files ({} bytes), {} bytes in use",
                stats.files_removed,
                stats.bytes_freed,
                self.total_size_bytes()
            );
        }
        Ok(stats)
    }

    /// Everything currently queued on disk, oldest first. Used to rehydrate
    /// the upload queue after a restart.
    pub async fn scan_pending(&self) -> Vec<PendingRef> {
        let mut files = self.collect_images(&self.pending).await;
        files.sort_by_key(|f| f.modified);
        files
            .into_iter()
            .filter_map(|f| {
                let file_name = f.path.file_name()?.to_str()?.to_string();
                // Layout is pending/<camera_id>/<yyyy-mm-dd>/<file>.
                let camera_id = f
                    .path
                    .parent()?
                    .parent()?
                    .file_name()?
                    .to_str()?
                    .to_string();
                let sidecar_path = self.pending.join("metadata").join(format!("{}.json", file_name));
                Some(PendingRef {
                    camera_id,
                    file_name,
                    image_path: f.path,
                    sidecar_path,
                    attempts: 0,
                })
            })
            .collect()
    }

    pub async fn totals(&self) -> StorageTotals {
        let pending = self.collect_images(&self.pending).await.len() as u64;
        let uploaded = self.collect_images(&self.uploaded).await.len() as u64;
        StorageTotals {
            pending_images: pending,
            uploaded_images: uploaded,
            total_size_bytes: self.total_size_bytes(),
            max_size_bytes: self.max_size_bytes,
        }
    }

    async fn scan_total_size(&self) -> u64 {
        let mut total = 0;
        for root in [&self.pending, &self.uploaded] {
            for entry in self.collect_images(root).await {
                total += entry.size;
            }
        }
        total
    }

    /// All image files under a subtree with mtime and size, oldest first.
    /// The metadata directories are skipped; sidecars ride along with their
    /// image on deletion.
    async fn collect_images(&self, root: &Path) -> Vec<ImageEntry> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!("cleanup: cannot read {}: {}", dir.display(), e);
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    if path.file_name().map(|n| n == "metadata").unwrap_or(false) {
                        continue;
                    }
                    stack.push(path);
                } else if path.extension().map(|e| e == "jpg").unwrap_or(false) {
                    if let Ok(meta) = entry.metadata().await {
                        out.push(ImageEntry {
                            path,
                            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                            size: meta.len(),
                        });
                    }
                }
            }
        }
        out.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.path.cmp(&b.path)));
        out
    }

    /// Delete one image plus its sidecar. A file that vanished under us was
    /// raced by the uploader or a concurrent cleanup pass, which is routine,
    /// not an error.
    async fn remove_image(&self, root: &Path, entry: &ImageEntry, stats: &mut CleanupStats) {
        match tokio::fs::remove_file(&entry.path).await {
            Ok(()) => {
                stats.files_removed += 1;
                stats.bytes_freed += entry.size;
                sub_saturating(&self.total_size, entry.size);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("cleanup: {} already gone", entry.path.display());
                return;
            }
            Err(e) => {
                tracing::warn!("cleanup: cannot remove {}: {}", entry.path.display(), e);
                return;
            }
        }

        if let Some(name) = entry.path.file_name().and_then(|n| n.to_str()) {
            let sidecar = root.join("metadata").join(format!("{}.json", name));
            if let Err(e) = tokio::fs::remove_file(&sidecar).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("cleanup: cannot remove {}: {}", sidecar.display(), e);
                }
            }
        }
    }
}

struct ImageEntry {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

fn gb_to_bytes(gb: f64) -> u64 {
    (gb * 1024.0 * 1024.0 * 1024.0) as u64
}

fn sub_saturating(counter: &AtomicU64, amount: u64) {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_sub(amount);
        match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

/// Write via a same-directory temp file, fsync, rename.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
