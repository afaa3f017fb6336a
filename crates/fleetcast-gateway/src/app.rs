use axum::{
    routing::{get, post},
    Router,
};
use fleetcast_core::{ConnectionConfig, FleetcastConfig};
use fleetcast_hub::{Hub, Pusher, SubscriptionIndex};
use std::sync::Arc;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: FleetcastConfig,
    /// Per-connection settings with hub-level overrides already applied.
    pub connection: ConnectionConfig,
    pub hub: Hub,
    pub index: Arc<SubscriptionIndex>,
    pub pusher: Pusher,
}

impl AppState {
    pub fn new(
        config: FleetcastConfig,
        hub: Hub,
        index: Arc<SubscriptionIndex>,
        pusher: Pusher,
    ) -> Self {
        Self {
            connection: config.effective_connection(),
            config,
            hub,
            index,
            pusher,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/stats", get(crate::http::stats::stats_handler))
        .route("/publish", post(crate::http::publish::publish_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
