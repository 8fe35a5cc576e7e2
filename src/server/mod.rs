//! HTTP and WebSocket surface over the tracker core.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::TrackerConfig;
use crate::events::{Broadcaster, EventBus, install_audit_log};
use crate::hub::Hub;
use crate::hub::liveness::spawn_heartbeat;
use crate::store::SqliteStore;

pub use api::{AppState, SharedState};

/// Build the full application router: REST API plus the `/ws` endpoint.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Wire the core together over the configured database.
pub fn build_state(config: &TrackerConfig) -> Result<SharedState> {
    if let Some(parent) = config.server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let sqlite = SqliteStore::open(&config.server.db_path)
        .context("Failed to initialize tracker database")?;

    let hub = Hub::shared(config.hub_settings());
    let bus = Arc::new(EventBus::new());
    install_audit_log(&bus);
    let broadcaster = Broadcaster::new(hub, bus);

    Ok(Arc::new(AppState::new(
        sqlite,
        broadcaster,
        config.lifecycle.max_commit_attempts,
    )))
}

/// Run the server until Ctrl-C.
pub async fn start_server(config: TrackerConfig) -> Result<()> {
    for warning in config.validate() {
        warn!("{warning}");
    }

    let state = build_state(&config)?;
    let heartbeat = spawn_heartbeat(Arc::clone(state.hub()), state.shutdown.clone());
    let app = build_router(Arc::clone(&state), config.server.dev_mode);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, db = %config.server.db_path.display(), "Twin Fix listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    state.shutdown.cancel();
    if let Err(e) = heartbeat.await {
        warn!(error = %e, "Heartbeat task ended abnormally");
    }
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn config_in(dir: &std::path::Path) -> TrackerConfig {
        let mut config = TrackerConfig::default();
        config.server.db_path = dir.join("data").join("twinfix.db");
        config
    }

    #[tokio::test]
    async fn test_build_state_creates_database() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let state = build_state(&config).unwrap();
        assert!(config.server.db_path.exists());
        assert_eq!(state.hub().settings().outbound_buffer, 64);
        assert_eq!(state.broadcaster.bus().subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let dir = tempdir().unwrap();
        let state = build_state(&config_in(dir.path())).unwrap();
        let app = build_router(state, true);

        let req = Request::builder()
            .method("POST")
            .uri("/api/issues")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"title": "Router test"}).to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = Request::builder().uri("/api/issues").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let issues: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(issues[0]["title"], "Router test");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let dir = tempdir().unwrap();
        let app = build_router(build_state(&config_in(dir.path())).unwrap(), false);
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
