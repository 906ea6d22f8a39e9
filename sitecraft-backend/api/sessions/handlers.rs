use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{sandbox_error, ApiError, AppState};
use crate::apply::checkpoint::Checkpoint;
use crate::sandbox::{CommandResult, SandboxInfo, SandboxProvider};
use crate::sessions::SessionStatus;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct CreateSessionBody {
    pub existing_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CommandBody {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PackagesBody {
    pub packages: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct FilesQuery {
    pub dir: String,
}

/// Provider for `id`, reconnecting when this process does not hold it yet.
pub(crate) async fn provider_for(state: &AppState, id: &str) -> Result<Arc<dyn SandboxProvider>, ApiError> {
    state
        .registry
        .get_or_create_provider(id)
        .await
        .map_err(sandbox_error)
}

/// GET /api/sessions — ids held by this process.
pub(crate) async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "sessions": state.registry.session_ids().await,
        "active": state.registry.active_session_id().await,
    }))
}

/// POST /api/sessions — reconnect to `existing_id` or provision a new session.
pub(crate) async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<SandboxInfo>, ApiError> {
    let info = state
        .registry
        .create_session(body.existing_id.as_deref())
        .await
        .map_err(sandbox_error)?;
    tracing::info!(session_id = %info.session_id, "session ready");
    Ok(Json(info))
}

/// GET /api/sessions/{id}
pub(crate) async fn session_status(State(state): State<AppState>, Path(id): Path<String>) -> Json<SessionStatus> {
    Json(state.registry.check_session_status(&id).await)
}

/// DELETE /api/sessions/{id}
pub(crate) async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.registry.terminate_session(&id).await {
        Ok(true) => {
            state.checkpoints.remove(&id).await;
            Ok(Json(json!({ "status": "terminated", "session_id": id })))
        }
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("session {id} is not held by this server") })),
        )),
        Err(e) => Err(sandbox_error(e)),
    }
}

/// POST /api/sessions/{id}/commands
pub(crate) async fn run_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CommandBody>,
) -> Result<Json<CommandResult>, ApiError> {
    if body.command.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, Json(json!({ "error": "command is empty" }))));
    }
    let provider = provider_for(&state, &id).await?;
    let result = provider.run_command(&body.command).await.map_err(sandbox_error)?;
    Ok(Json(result))
}

/// POST /api/sessions/{id}/packages
pub(crate) async fn install_packages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PackagesBody>,
) -> Result<Json<CommandResult>, ApiError> {
    let provider = provider_for(&state, &id).await?;
    let result = provider
        .install_packages(&body.packages)
        .await
        .map_err(sandbox_error)?;
    if !result.success {
        tracing::warn!(session_id = %id, packages = ?body.packages, exit_code = result.exit_code, "package install failed");
    }
    Ok(Json(result))
}

/// POST /api/sessions/{id}/restart
pub(crate) async fn restart_dev_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let provider = provider_for(&state, &id).await?;
    provider.restart_dev_server().await.map_err(sandbox_error)?;
    let url = provider.sandbox_info().await.and_then(|i| i.url);
    Ok(Json(json!({ "status": "restarted", "url": url })))
}

/// GET /api/sessions/{id}/files?dir=
pub(crate) async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<Value>, ApiError> {
    let provider = provider_for(&state, &id).await?;
    let files = provider.list_files(&query.dir).await.map_err(sandbox_error)?;
    Ok(Json(json!({ "files": files })))
}

/// GET /api/sessions/{id}/checkpoints
pub(crate) async fn list_checkpoints(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    Json(json!({ "checkpoints": state.checkpoints.list(&id).await }))
}

/// GET /api/sessions/{id}/checkpoints/{checkpoint_id}
pub(crate) async fn get_checkpoint(
    State(state): State<AppState>,
    Path((id, checkpoint_id)): Path<(String, String)>,
) -> Result<Json<Checkpoint>, ApiError> {
    state
        .checkpoints
        .get(&id, &checkpoint_id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, Json(json!({ "error": "checkpoint not found" }))))
}
