pub mod apply;
pub mod middleware;
mod routes;
pub mod sessions;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::apply::checkpoint::CheckpointLog;
use crate::apply::ApplyEngine;
use crate::config::Config;
use crate::preview::{ReachabilityProbe, ReadinessPolicy};
use crate::sandbox::SandboxError;
use crate::sessions::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub engine: Arc<ApplyEngine>,
    pub checkpoints: CheckpointLog,
    /// Used by preview verification to ping dev servers.
    pub probe: Arc<dyn ReachabilityProbe>,
    pub readiness: ReadinessPolicy,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}

pub(crate) type ApiError = (StatusCode, Json<Value>);

/// Status code a sandbox failure is reported with.
pub(crate) fn status_for(err: &SandboxError) -> StatusCode {
    match err {
        SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::NoActiveSandbox => StatusCode::CONFLICT,
        SandboxError::Provision(_) | SandboxError::Backend(_) => StatusCode::BAD_GATEWAY,
        SandboxError::Transport { .. } => StatusCode::GATEWAY_TIMEOUT,
        SandboxError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        SandboxError::Exec(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SandboxError::Cancelled(_) | SandboxError::Io(_) | SandboxError::Serde(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub(crate) fn sandbox_error(err: SandboxError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "sandbox request failed");
    } else {
        tracing::warn!(error = %err, "sandbox request rejected");
    }
    (status, Json(json!({ "error": err.to_string() })))
}
