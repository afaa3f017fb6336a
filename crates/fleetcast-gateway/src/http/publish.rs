//! Publisher entry point for trusted internal producers: POST /publish.

use axum::{extract::State, http::StatusCode, Json};
use fleetcast_hub::PushJob;
use fleetcast_protocol::{Message, MessageType};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::app::AppState;

/// Body of a publish request. Exactly one of `topic`, `pattern` or `clients`
/// selects the audience.
#[derive(Debug, Default, Deserialize)]
pub struct PublishRequest {
    pub topic: Option<String>,
    pub pattern: Option<String>,
    pub clients: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Event name on the wire; defaults to `topic`.
    pub event: Option<String>,
    pub data: Option<Value>,
    #[serde(default)]
    pub trace_id: String,
}

impl PublishRequest {
    fn into_job(self) -> Result<PushJob, String> {
        let event = self
            .event
            .or_else(|| self.topic.clone())
            .unwrap_or_default();
        let message = Message {
            event,
            data: self.data,
            trace_id: self.trace_id,
            ..Message::new(MessageType::Event)
        };

        let job = match (self.topic, self.pattern, self.clients) {
            (Some(topic), None, None) if !topic.is_empty() => PushJob::topic(topic, message),
            (None, Some(pattern), None) if !pattern.is_empty() => {
                PushJob::pattern(pattern, message)
            }
            (None, None, Some(clients)) if !clients.is_empty() => {
                PushJob::clients(clients, message)
            }
            _ => {
                return Err(
                    "exactly one non-empty audience is required: topic, pattern or clients"
                        .to_string(),
                )
            }
        };
        Ok(job.excluding(self.exclude))
    }
}

/// POST /publish
///
/// Returns 202 when the job is queued, 400 on a malformed audience and 503
/// when the dispatcher is stopped or its queue is full.
pub async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PublishRequest>,
) -> (StatusCode, Json<Value>) {
    let job = match req.into_job() {
        Ok(job) => job,
        Err(e) => {
            warn!(error = %e, "rejected publish request");
            return (StatusCode::BAD_REQUEST, Json(json!({"error": e})));
        }
    };

    debug!(audience = ?job.audience, event = %job.message.event, "publish request");
    if state.pusher.push(job) {
        (StatusCode::ACCEPTED, Json(json!({"accepted": true})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "accepted": false,
                "error": "dispatcher unavailable or queue full",
            })),
        )
    }
}
