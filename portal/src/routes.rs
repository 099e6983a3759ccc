//! Route definitions for the portal API.

use std::path::PathBuf;

use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;
use crate::{events, fleet, handlers};

/// Build the portal router. `assets_dir` serves a packaged dashboard when
/// configured; otherwise a minimal inline page answers at `/`.
pub fn build_router(state: SharedState, assets_dir: Option<PathBuf>) -> Router {
    let fleet_routes = Router::new()
        .route("/ping", get(fleet::ping))
        .route("/status", get(handlers::api_status))
        .route("/config", post(fleet::set_config))
        .route("/update_check", post(handlers::update_check))
        .route("/restart", post(fleet::restart))
        .layer(middleware::from_fn_with_state(state.clone(), fleet::auth));

    let mut router = Router::new()
        .route("/api/status", get(handlers::api_status))
        .route("/api/health", get(handlers::api_health))
        .route("/api/status/cameras", get(handlers::api_status_cameras))
        .route("/api/status/system", get(handlers::api_status_system))
        .route("/api/status/network", get(handlers::api_status_network))
        .route("/api/logs", get(handlers::api_logs))
        .route(
            "/api/log_level",
            get(handlers::get_log_level).post(handlers::post_log_level),
        )
        .route("/api/events", get(events::sse_handler))
        .route("/api/images/:camera_id/latest", get(handlers::latest_image))
        .route("/api/cameras/:camera_id/capture", post(handlers::camera_capture))
        .route("/api/cameras/:camera_id/restart", post(handlers::camera_restart))
        .route("/api/cameras/:camera_id/position", post(handlers::camera_position))
        .route("/api/wifi_ap/enable", post(handlers::wifi_ap_enable))
        .route("/api/wifi_ap/disable", post(handlers::wifi_ap_disable))
        .route("/api/update/status", get(handlers::update_status))
        .route("/api/update/check", post(handlers::update_check))
        .route("/api/config", get(handlers::api_config))
        .nest("/api/fleet", fleet_routes);

    router = match assets_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router.route("/", get(handlers::index)),
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::PortalConfig;
    use crate::state::PortalState;

    fn test_state(yaml: &str, dir: &std::path::Path) -> SharedState {
        let config = PortalConfig::from_yaml(yaml).unwrap();
        let config_path = dir.join("config.yaml");
        std::fs::write(&config_path, yaml).unwrap();
        let (_layer, filter) =
            tracing_subscriber::reload::Layer::new(tracing_subscriber::EnvFilter::new("info"));
        PortalState::new(config, config_path, filter)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn index_serves_inline_page() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state("device: { id: n1 }", dir.path());
        let router = build_router(state, None);
        let response = router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn update_status_works_without_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state("device: { id: n1 }", dir.path());
        let router = build_router(state, None);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/update/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc = body_json(response).await;
        assert_eq!(doc["status"], "unknown");
        assert_eq!(doc["update_available"], false);
    }

    #[tokio::test]
    async fn logs_endpoint_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "device: {{ id: n1 }}\nlogging: {{ log_dir: {}, log_file: missing.log }}\n",
            dir.path().display()
        );
        let state = test_state(&yaml, dir.path());
        let router = build_router(state, None);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/logs?lines=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc = body_json(response).await;
        assert_eq!(doc["logs"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn bad_log_level_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state("device: { id: n1 }", dir.path());
        let router = build_router(state, None);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/log_level")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"level":"TRACE"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn fleet_disabled_without_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state("device: { id: n1 }", dir.path());
        let router = build_router(state, None);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/fleet/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fleet_requires_matching_token() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "device: { id: n1 }\nfleet: { token: sekrit }\n";
        let state = test_state(yaml, dir.path());
        let router = build_router(state, None);

        let denied = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/fleet/ping")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = router
            .oneshot(
                Request::builder()
                    .uri("/api/fleet/ping")
                    .header("authorization", "Bearer sekrit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        let doc = body_json(allowed).await;
        assert_eq!(doc["node_id"], "n1");
    }

    #[tokio::test]
    async fn fleet_config_honors_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = concat!(
            "device: { id: n1 }\n",
            "fleet:\n",
            "  token: sekrit\n",
            "  allowed_config_keys: [\"logging.level\"]\n",
        );
        let state = test_state(yaml, dir.path());
        let config_path = state.config_path.clone();
        let router = build_router(state, None);

        // Whitelisted key is applied to the file.
        let ok = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/fleet/config")
                    .header("authorization", "Bearer sekrit")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"key":"logging.level","value":"DEBUG"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let doc = body_json(ok).await;
        assert_eq!(doc["restart_required"], false);
        let written = std::fs::read_to_string(&config_path).unwrap();
        assert!(written.contains("DEBUG"));

        // Non-whitelisted key is refused.
        let denied = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/fleet/config")
                    .header("authorization", "Bearer sekrit")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"key":"server.auth_token","value":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn camera_commands_fail_cleanly_without_agent() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state("device: { id: n1 }", dir.path());
        let router = build_router(state, None);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/cameras/cam1/capture")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
