//! Signaling endpoint.
//!
//! Peers connect over WebSocket at `/?roomId=<id>`. Each connection is
//! served by a [`ConnectionActor`](crate::actors::ConnectionActor) reading
//! and writing text frames through the [`SignalingStream`] abstraction, so
//! the same actor runs over a real socket or an in-memory channel.

pub mod stream;
pub mod ws;

pub use stream::{
    channel_pair, ChannelClient, ChannelStream, SignalingStream, StreamError, StreamFrame,
};
pub use ws::{signaling_router, SignalingState, WsStream};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server going away (shutdown or eviction).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Missing room id or malformed frame.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Room could not be created.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Room full or server draining.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
