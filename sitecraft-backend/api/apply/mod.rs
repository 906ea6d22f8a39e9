pub mod handlers;

use axum::routing::post;
use axum::Router;

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions/{id}/apply", post(handlers::apply_response))
        .route("/sessions/{id}/apply/stream", post(handlers::apply_stream))
        .route("/sessions/{id}/preview/verify", post(handlers::verify_preview))
}
