use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleetcast_hub::Connection;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::ws::transport::{WsSink, WsSource};

/// Identity a client declares when it connects.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Connection id. A fresh UUID is assigned when absent.
    pub id: Option<String>,
    #[serde(default)]
    pub device_sn: String,
    #[serde(default)]
    pub user_id: String,
}

impl ConnectParams {
    fn conn_id(&self) -> String {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Axum handler, upgrades HTTP to WebSocket at GET /ws.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if !state.hub.is_running() {
        warn!("WS upgrade refused: hub is not running");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "hub is not running"})),
        )
            .into_response();
    }

    ws.max_message_size(state.connection.max_message_size)
        .on_upgrade(move |socket| attach(socket, params, state))
        .into_response()
}

/// Hand the upgraded socket to the hub. The connection's own tasks take over
/// from here; this future returns immediately.
async fn attach(socket: WebSocket, params: ConnectParams, state: Arc<AppState>) {
    let conn_id = params.conn_id();
    info!(conn_id = %conn_id, device_sn = %params.device_sn, "new WS connection");

    let (tx, rx) = socket.split();
    let conn = Connection::new(
        conn_id,
        params.device_sn,
        params.user_id,
        WsSource::new(rx),
        WsSink::new(tx),
        state.connection.clone(),
    );
    state.hub.register(conn.clone());
    conn.start(state.hub.clone());
}
