use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/probe", get(handlers::probe))
        // Objects
        .route("/check/:algorithm/:digest", get(handlers::check))
        .route("/get/:algorithm/:digest", get(handlers::download))
        // Bodies are streamed and bounded by Content-Length, not buffered.
        .route(
            "/set/:algorithm/:digest",
            post(handlers::upload).layer(DefaultBodyLimit::disable()),
        )
        // Internal
        .route("/_internal/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
