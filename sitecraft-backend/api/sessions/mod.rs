pub mod handlers;

use axum::routing::{get, post};
use axum::Router;

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(handlers::list_sessions).post(handlers::create_session))
        .route(
            "/sessions/{id}",
            get(handlers::session_status).delete(handlers::terminate_session),
        )
        .route("/sessions/{id}/commands", post(handlers::run_command))
        .route("/sessions/{id}/packages", post(handlers::install_packages))
        .route("/sessions/{id}/restart", post(handlers::restart_dev_server))
        .route("/sessions/{id}/files", get(handlers::list_files))
        .route("/sessions/{id}/checkpoints", get(handlers::list_checkpoints))
        .route(
            "/sessions/{id}/checkpoints/{checkpoint_id}",
            get(handlers::get_checkpoint),
        )
}
