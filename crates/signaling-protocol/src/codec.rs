//! Text codec for signaling envelopes.

use crate::envelope::{Envelope, ErrorBody, ErrorCode};

/// Largest text frame accepted on the signaling channel.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame exceeds [`MAX_FRAME_LEN`]
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame is not a JSON envelope
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Envelope action is not recognized
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Payload does not match the action's schema
    #[error("Invalid data for {action}: {reason}")]
    InvalidData { action: String, reason: String },

    /// Outbound payload could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl CodecError {
    /// Whether the peer broke framing badly enough that the connection
    /// should be closed rather than answered.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, CodecError::FrameTooLarge(_) | CodecError::Malformed(_))
    }

    /// Error body reported to the peer.
    #[must_use]
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            CodecError::Serialization(_) => {
                ErrorBody::new(ErrorCode::InternalError, "An internal error occurred")
            }
            other => ErrorBody::new(ErrorCode::BadRequest, other.to_string()),
        }
    }
}

/// Decode one text frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` or `Malformed`.
pub fn decode_envelope(text: &str) -> Result<Envelope, CodecError> {
    if text.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(text.len()));
    }
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Encode one envelope as a text frame.
///
/// # Errors
///
/// Returns `Serialization` if the envelope cannot be written.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(|e| CodecError::Serialization(e.to_string()))
}
