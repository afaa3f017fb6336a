use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator carried in the `type` field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Event,
    Subscribe,
    Unsubscribe,
    Ping,
    Pong,
    Error,
    Ack,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Event => "event",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::Ack => "ack",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message exchanged with a client, in either direction.
///
/// Wire: `{ "type": "event", "event": "device.telemetry", "data": {...}, "trace_id": "t-1" }`
///
/// `event` carries the topic for `event`, `subscribe`, `unsubscribe` and `ack`.
/// `data` is opaque to the hub and passed through untouched. Every field except
/// `type` is omitted from the wire when empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            event: String::new(),
            data: None,
            error: String::new(),
            trace_id: String::new(),
        }
    }

    /// Server → client push on `topic`.
    pub fn event(topic: impl Into<String>, data: Value) -> Self {
        Self {
            event: topic.into(),
            data: Some(data),
            ..Self::new(MessageType::Event)
        }
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            event: topic.into(),
            ..Self::new(MessageType::Subscribe)
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            event: topic.into(),
            ..Self::new(MessageType::Unsubscribe)
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong)
    }

    /// Confirms a subscribe or unsubscribe for `topic`.
    pub fn ack(topic: impl Into<String>) -> Self {
        Self {
            event: topic.into(),
            ..Self::new(MessageType::Ack)
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            error: reason.into(),
            ..Self::new(MessageType::Error)
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Parse one text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
