use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::api::response::{Empty, Success};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<Success<HealthResponse>> {
    Success::json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Liveness probe for clients; answers after the configured delay.
pub async fn probe(State(state): State<Arc<AppState>>) -> Json<Success<Empty>> {
    if state.config.probe_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.config.probe_delay_ms)).await;
    }
    Success::json(Empty {})
}
