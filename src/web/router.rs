//! Axum router construction.

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::web::handlers;
use crate::web::{AppState, MAX_UPLOAD_SIZE};

/// Build the complete router for the HTTP surface.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/files", get(handlers::list_files_handler))
        .route("/upload", post(handlers::upload_handler))
        .route("/download/:filename", get(handlers::download_handler))
        .route("/api/delete/:filename", delete(handlers::delete_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE))
        .with_state(state)
}
