//! HTTP and WebSocket surface

pub mod api;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Settings;
use crate::knowledge::KnowledgeService;
use crate::supervisor::SessionSupervisor;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub settings: Arc<Settings>,
    pub supervisor: Arc<SessionSupervisor>,
    pub knowledge: Arc<KnowledgeService>,
}

impl ServerState {
    pub fn new(settings: Settings) -> Self {
        let knowledge = Arc::new(KnowledgeService::new(settings.workspaces_dir.clone()));
        Self {
            settings: Arc::new(settings),
            supervisor: Arc::new(SessionSupervisor::new()),
            knowledge,
        }
    }
}

/// Assemble the application router.
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .route(
            "/api/workspaces",
            post(api::create_workspace).get(api::list_workspaces),
        )
        .route("/api/workspaces/{name}/stats", get(api::workspace_stats))
        .route(
            "/api/workspaces/{name}/files",
            post(api::upload_file).get(api::list_files),
        )
        .route(
            "/api/workspaces/{name}/files/{filename}",
            delete(api::delete_file),
        )
        .route("/api/session", get(api::session_info))
        .route("/api/config", get(api::config_info))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and block until shutdown.
pub async fn start(settings: Settings) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.server_host, settings.server_port)
        .parse()
        .context("invalid server address")?;

    let state = ServerState::new(settings);
    let supervisor = state.supervisor.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down");
    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "version": crate::VERSION }))
}
