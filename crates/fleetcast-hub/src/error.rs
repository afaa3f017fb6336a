use thiserror::Error;

/// Failures reported by a [`FrameSource`](crate::transport::FrameSource) or
/// [`FrameSink`](crate::transport::FrameSink). Every variant is fatal to the
/// loop that observes it.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer or the local side already closed the transport.
    #[error("Transport closed")]
    Closed,

    /// The underlying socket reported an error.
    #[error("Transport I/O error: {0}")]
    Io(String),

    /// A read or write did not complete within its deadline.
    #[error("Transport deadline exceeded after {ms}ms")]
    Timeout { ms: u64 },

    /// An inbound frame exceeded the configured size limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, TransportError>;
