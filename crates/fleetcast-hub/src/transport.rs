//! Framed transport boundary.
//!
//! A connection is handed an already-established transport split into a read
//! half ([`FrameSource`]) and a write half ([`FrameSink`]) so the inbound and
//! outbound loops can own one each. Deadlines are applied by the loops, not by
//! the transport.

use async_trait::async_trait;
use fleetcast_protocol::Message;
use tokio::sync::mpsc;

use crate::error::{Result, TransportError};

/// One transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    /// Payload size in bytes, used for the inbound size limit.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) | Frame::Ping(bytes) | Frame::Pong(bytes) => bytes.len(),
            Frame::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. `None` means the peer is gone.
    ///
    /// Must be cancel-safe: the inbound loop drops this future when the
    /// connection closes or the read deadline passes.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<()>;

    /// Flush and release the underlying transport.
    async fn close(&mut self) -> Result<()>;
}

/// Build an in-process transport backed by bounded channels.
///
/// Returns the two halves to hand to a [`Connection`](crate::Connection) and
/// the [`ChannelPeer`] that plays the remote client. Used by tests and by
/// embedders that want to attach a local consumer to the hub.
pub fn channel_transport(capacity: usize) -> (ChannelSource, ChannelSink, ChannelPeer) {
    let (to_server, from_peer) = mpsc::channel(capacity);
    let (to_peer, from_server) = mpsc::channel(capacity);
    (
        ChannelSource { rx: from_peer },
        ChannelSink { tx: Some(to_peer) },
        ChannelPeer {
            tx: Some(to_server),
            rx: from_server,
        },
    )
}

pub struct ChannelSource {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await.map(Ok)
    }
}

pub struct ChannelSink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender ends the peer's receive stream.
        self.tx.take();
        Ok(())
    }
}

/// Remote end of a [`channel_transport`].
pub struct ChannelPeer {
    tx: Option<mpsc::Sender<Frame>>,
    rx: mpsc::Receiver<Frame>,
}

impl ChannelPeer {
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Serialize `msg` and send it as a text frame.
    pub async fn send_message(&self, msg: &Message) -> Result<()> {
        let text = msg
            .to_json()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.send(Frame::Text(text)).await
    }

    /// Next raw frame from the server, `None` once the server closed the sink.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next decoded message, skipping control frames.
    pub async fn recv_message(&mut self) -> Option<Message> {
        while let Some(frame) = self.rx.recv().await {
            if let Frame::Text(text) = frame {
                return Message::from_json(&text).ok();
            }
        }
        None
    }

    /// Non-blocking check for an already-delivered frame.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Simulate the client going away without a close frame.
    pub fn disconnect(&mut self) {
        self.tx.take();
    }
}
