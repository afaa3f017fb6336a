use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /stats: registry counters, per-topic subscriber counts and the
/// dispatcher backlog.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "hub": state.hub.stats(),
        "subscriptions": {
            "topics": state.index.topic_count(),
            "clients": state.index.client_count(),
            "by_topic": state.index.stats(),
        },
        "pusher": {
            "running": state.pusher.is_running(),
            "queue_len": state.pusher.queue_len(),
            "queue_size": state.config.pusher.queue_size,
            "workers": state.config.pusher.worker_count,
            "metrics": state.pusher.metrics(),
        },
    }))
}
