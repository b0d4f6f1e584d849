pub mod routes;
pub mod state;

use axum::{extract::DefaultBodyLimit, routing::{get, post}, Router};
use tower_http::trace::TraceLayer;
use crate::adapters::http::state::HttpState;

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/config", get(routes::get_config))
        .route("/api/detect", post(routes::detect))
        .route("/api/examples/:index", post(routes::run_example))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
