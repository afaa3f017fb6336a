//! Real-time fan-out for device telemetry.
//!
//! A [`Hub`] tracks live [`Connection`]s, a [`SubscriptionIndex`] maps topics
//! to subscribers, and a [`Pusher`] resolves each published message to its
//! audience and enqueues it on every matching connection without blocking the
//! publisher.

pub mod connection;
pub mod error;
pub mod hooks;
pub mod hub;
pub mod pusher;
pub mod subscription;
pub mod transport;

pub use connection::{ConnState, Connection};
pub use error::TransportError;
pub use hooks::{HubHooks, IndexSync, NoopHooks};
pub use hub::{Hub, HubStats};
pub use pusher::{Audience, PushJob, PushMetrics, Pusher};
pub use subscription::{topic_matches, SubscriptionIndex, TopicStats};
pub use transport::{
    channel_transport, ChannelPeer, ChannelSink, ChannelSource, Frame, FrameSink, FrameSource,
};
