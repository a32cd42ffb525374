//! Error types for the session client.

use signaling_protocol::{CodecError, ErrorBody};
use thiserror::Error;

/// Failure reported by the local media stack.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not loaded with router capabilities")]
    NotLoaded,

    #[error("no {0} transport")]
    TransportMissing(&'static str),

    #[error("no codec for {0}")]
    UnsupportedCodec(String),

    #[error("track unavailable: {0}")]
    Track(String),

    #[error("device error: {0}")]
    Other(String),
}

/// Errors returned by [`NegotiatorHandle`](crate::NegotiatorHandle) and
/// raised inside the negotiator.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The operation needs a negotiation step that has not completed.
    #[error("not ready: {0}")]
    NotReady(&'static str),

    #[error("no local {0} track")]
    NoSuchTrack(&'static str),

    #[error("screen share already active")]
    AlreadySharing,

    /// The server refused a negotiation step the session cannot do without.
    #[error("{action} rejected: {}", .error.message)]
    Rejected {
        action: &'static str,
        error: ErrorBody,
    },

    #[error("expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: String,
    },

    /// Outbound channel to the signaling connection is gone.
    #[error("signaling connection closed")]
    ConnectionClosed,

    #[error("internal error: {0}")]
    Internal(String),
}
