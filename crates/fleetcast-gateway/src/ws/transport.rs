//! Adapts the halves of an axum WebSocket to the hub's frame transport.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use fleetcast_hub::{Frame, FrameSink, FrameSource, TransportError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

pub struct WsSource {
    rx: SplitStream<WebSocket>,
}

impl WsSource {
    pub fn new(rx: SplitStream<WebSocket>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        let msg = self.rx.next().await?;
        Some(
            msg.map(into_frame)
                .map_err(|e| TransportError::Io(e.to_string())),
        )
    }
}

pub struct WsSink {
    tx: SplitSink<WebSocket, WsMessage>,
}

impl WsSink {
    pub fn new(tx: SplitSink<WebSocket, WsMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let Some(msg) = outbound(frame) else {
            return Ok(());
        };
        self.tx
            .send(msg)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

fn into_frame(msg: WsMessage) -> Frame {
    match msg {
        WsMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
        WsMessage::Binary(bytes) => Frame::Binary(bytes.to_vec()),
        WsMessage::Ping(bytes) => Frame::Ping(bytes.to_vec()),
        WsMessage::Pong(bytes) => Frame::Pong(bytes.to_vec()),
        WsMessage::Close(_) => Frame::Close,
    }
}

/// `None` for pongs: the websocket layer already answers every inbound ping,
/// so a second reply from the connection loop is skipped.
fn outbound(frame: Frame) -> Option<WsMessage> {
    match frame {
        Frame::Text(text) => Some(WsMessage::Text(text.into())),
        Frame::Binary(bytes) => Some(WsMessage::Binary(bytes.into())),
        Frame::Ping(bytes) => Some(WsMessage::Ping(bytes.into())),
        Frame::Pong(_) => None,
        Frame::Close => Some(WsMessage::Close(None)),
    }
}
