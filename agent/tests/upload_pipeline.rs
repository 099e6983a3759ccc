//! End-to-end storage/upload pipeline tests against a mock inference server.
//!
//! Cameras are not involved: images enter the pipeline through the storage
//! manager exactly as the capture workers hand them over.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use httpmock::prelude::*;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use sai_cam_agent::config::{Config, StorageConfig};
use sai_cam_agent::storage::StorageManager;
use sai_cam_agent::upload::UploadWorker;

fn node_config(upload_url: &str) -> Config {
    Config::from_yaml(&format!(
        r#"
device: {{ id: node-it, location: test rig }}
cameras:
  - {{ id: cam1, type: rtsp, rtsp_url: "rtsp://127.0.0.1/stream", capture_interval: 2 }}
server:
  url: {}
  timeout: 5
  auth_token: it-token
"#,
        upload_url
    ))
    .unwrap()
}

async fn storage_at(dir: &Path) -> Arc<StorageManager> {
    Arc::new(
        StorageManager::new(&StorageConfig {
            base_path: dir.to_path_buf(),
            max_size_gb: 1.0,
            cleanup_threshold_gb: 0.8,
            retention_days: 7,
        })
        .await
        .unwrap(),
    )
}

#[tokio::test]
async fn pending_images_drain_to_uploaded() {
    let server = MockServer::start_async().await;
    let upload = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/upload")
                .header("authorization", "Bearer it-token")
                .header_exists("content-type");
            then.status(200);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let storage = storage_at(dir.path()).await;
    let config = Arc::new(RwLock::new(node_config(&server.url("/upload"))));

    // Four captures land before the worker starts: the restart-rehydration
    // path picks them up from disk.
    for i in 0..4 {
        storage
            .store(
                "cam1",
                format!("jpeg-bytes-{}", i).as_bytes(),
                &serde_json::json!({ "camera_id": "cam1", "seq": i }),
                Utc::now(),
            )
            .await
            .unwrap();
    }
    let backlog = storage.scan_pending().await;
    assert_eq!(backlog.len(), 4);

    let worker = UploadWorker::new(
        storage.clone(),
        config.clone(),
        &config.read().await.server,
        true,
    )
    .unwrap();

    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.run(backlog, rx, cancel.clone(), Duration::from_secs(5)));

    // One more image arrives live through the queue.
    let live = storage
        .store(
            "cam1",
            b"jpeg-bytes-live",
            &serde_json::json!({ "camera_id": "cam1", "seq": 99 }),
            Utc::now(),
        )
        .await
        .unwrap();
    tx.send(live).await.unwrap();

    // Wait for the uploads to complete.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let totals = storage.totals().await;
        if totals.uploaded_images == 5 && totals.pending_images == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "uploads did not drain: {:?}",
            totals
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(upload.hits_async().await, 5);
    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn server_rejection_keeps_file_with_permanent_marker() {
    let server = MockServer::start_async().await;
    let upload = server
        .mock_async(|when, then| {
            when.method(POST).path("/upload");
            then.status(403);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let storage = storage_at(dir.path()).await;
    let config = Arc::new(RwLock::new(node_config(&server.url("/upload"))));

    let item = storage
        .store(
            "cam1",
            b"jpeg-bytes",
            &serde_json::json!({ "camera_id": "cam1" }),
            Utc::now(),
        )
        .await
        .unwrap();
    let sidecar_path = item.sidecar_path.clone();
    let image_path = item.image_path.clone();

    let worker = UploadWorker::new(
        storage.clone(),
        config.clone(),
        &config.read().await.server,
        true,
    )
    .unwrap();
    let (_tx, rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.run(vec![item], rx, cancel.clone(), Duration::from_secs(2)));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if upload.hits_async().await >= 1 {
            let doc: serde_json::Value =
                serde_json::from_slice(&std::fs::read(&sidecar_path).unwrap()).unwrap();
            if doc["upload"]["status"] == "failed-permanent" {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "permanent failure never recorded"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Exactly one attempt: 403 is never retried.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(upload.hits_async().await, 1);
    assert!(image_path.exists(), "image stays in pending/ until retention");
    assert_eq!(storage.totals().await.uploaded_images, 0);

    cancel.cancel();
    let _ = handle.await;
}
