use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe with server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = if state.hub.is_running() { "ok" } else { "stopping" };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.hub.client_count(),
        "push": state.pusher.metrics(),
    }))
}
