//! Workspace and session REST surface
//!
//! Manages the markdown workspaces behind the retrieval index (create,
//! list, upload, delete) and exposes read-only session and config info.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{FRAME_DURATION_MS, SAMPLE_RATE_CLIENT};

use super::ServerState;

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceParams {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceInfo {
    pub name: String,
    pub file_count: usize,
    pub total_size: u64,
}

#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceStats {
    pub name: String,
    pub file_count: usize,
    pub total_size: u64,
    pub files: Vec<FileInfo>,
}

fn error_response(status: StatusCode, detail: &str) -> axum::response::Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

/// Reject names that could escape the workspaces directory.
fn safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && name != "."
        && name != ".."
}

fn workspace_files(path: &std::path::Path) -> Vec<FileInfo> {
    let mut files: Vec<FileInfo> = std::fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    let p = e.path();
                    p.is_file() && p.extension().is_some_and(|ext| ext == "md")
                })
                .map(|e| FileInfo {
                    filename: e.file_name().to_string_lossy().into_owned(),
                    size: e.metadata().map(|m| m.len()).unwrap_or(0),
                })
                .collect()
        })
        .unwrap_or_default();
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    files
}

pub async fn create_workspace(
    State(state): State<ServerState>,
    Query(params): Query<CreateWorkspaceParams>,
) -> impl IntoResponse {
    if !safe_name(&params.name) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid workspace name");
    }

    let path = state.knowledge.workspace_path(&params.name);
    if path.exists() {
        return error_response(StatusCode::BAD_REQUEST, "Workspace already exists");
    }
    if let Err(e) = std::fs::create_dir_all(&path) {
        warn!("failed to create workspace: {}", e);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create workspace");
    }

    info!(workspace = %params.name, "workspace created");
    Json(WorkspaceInfo {
        name: params.name,
        file_count: 0,
        total_size: 0,
    })
    .into_response()
}

pub async fn list_workspaces(State(state): State<ServerState>) -> impl IntoResponse {
    let root = &state.settings.workspaces_dir;
    if !root.exists() {
        if let Err(e) = std::fs::create_dir_all(root) {
            warn!("failed to create workspaces dir: {}", e);
        }
        return Json(Vec::<WorkspaceInfo>::new()).into_response();
    }

    let mut workspaces: Vec<WorkspaceInfo> = std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .map(|e| {
                    let files = workspace_files(&e.path());
                    WorkspaceInfo {
                        name: e.file_name().to_string_lossy().into_owned(),
                        file_count: files.len(),
                        total_size: files.iter().map(|f| f.size).sum(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    workspaces.sort_by(|a, b| a.name.cmp(&b.name));

    Json(workspaces).into_response()
}

pub async fn workspace_stats(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if !safe_name(&name) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid workspace name");
    }
    let path = state.knowledge.workspace_path(&name);
    if !path.is_dir() {
        return error_response(StatusCode::NOT_FOUND, "Workspace not found");
    }

    let files = workspace_files(&path);
    Json(WorkspaceStats {
        name,
        file_count: files.len(),
        total_size: files.iter().map(|f| f.size).sum(),
        files,
    })
    .into_response()
}

pub async fn upload_file(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    if !safe_name(&name) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid workspace name");
    }
    let workspace = state.knowledge.workspace_path(&name);
    if !workspace.exists() {
        if let Err(e) = std::fs::create_dir_all(&workspace) {
            warn!("failed to create workspace: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create workspace");
        }
    }

    while let Ok(Some(field)) = multipart.next_field().await {
        let Some(filename) = field.file_name().map(|n| n.to_string()) else {
            continue;
        };
        if !safe_name(&filename) {
            return error_response(StatusCode::BAD_REQUEST, "Invalid filename");
        }
        if !filename.ends_with(".md") {
            return error_response(StatusCode::BAD_REQUEST, "Only .md files are allowed");
        }

        let content = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("upload read failed: {}", e);
                return error_response(StatusCode::BAD_REQUEST, "Failed to read upload");
            }
        };
        if let Err(e) = tokio::fs::write(workspace.join(&filename), &content).await {
            warn!("upload write failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store file");
        }

        info!(workspace = %name, filename = %filename, size = content.len(), "file uploaded");
        return Json(json!({ "filename": filename, "size": content.len() })).into_response();
    }

    error_response(StatusCode::BAD_REQUEST, "No file in request")
}

pub async fn list_files(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if !safe_name(&name) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid workspace name");
    }
    let path = state.knowledge.workspace_path(&name);
    if !path.is_dir() {
        return error_response(StatusCode::NOT_FOUND, "Workspace not found");
    }
    Json(workspace_files(&path)).into_response()
}

pub async fn delete_file(
    State(state): State<ServerState>,
    Path((name, filename)): Path<(String, String)>,
) -> impl IntoResponse {
    if !safe_name(&name) || !safe_name(&filename) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid path");
    }
    let path = state.knowledge.workspace_path(&name).join(&filename);
    if !path.is_file() {
        return error_response(StatusCode::NOT_FOUND, "File not found");
    }
    if let Err(e) = std::fs::remove_file(&path) {
        warn!("delete failed: {}", e);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete file");
    }

    info!(workspace = %name, filename = %filename, "file deleted");
    Json(json!({ "deleted": filename })).into_response()
}

pub async fn session_info(State(state): State<ServerState>) -> impl IntoResponse {
    match state.supervisor.current_session().await {
        Some(session) => Json(session.snapshot().await).into_response(),
        None => Json(json!({ "session": null })).into_response(),
    }
}

/// Non-sensitive configuration for the client.
pub async fn config_info(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "ollama_model": state.settings.ollama_model,
        "sample_rate": SAMPLE_RATE_CLIENT,
        "frame_duration_ms": FRAME_DURATION_MS,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_rejects_traversal() {
        assert!(safe_name("notes"));
        assert!(safe_name("my-notes_2"));
        assert!(!safe_name(""));
        assert!(!safe_name(".."));
        assert!(!safe_name("a/b"));
        assert!(!safe_name("a\\b"));
    }
}
