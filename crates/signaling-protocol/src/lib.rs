//! Signaling protocol for Huddle rooms.
//!
//! Every frame on the signaling channel is a JSON envelope:
//!
//! ```text
//! { "action": "produce", "data": { ... }, "requestId": 7 }
//! { "action": "produceResponse", "data": { "id": "..." }, "requestId": 7 }
//! { "action": "consumeResponse", "requestId": 9,
//!   "error": { "code": "NOT_FOUND", "message": "Producer not found" } }
//! ```
//!
//! Requests carry a client-chosen `requestId` which the server echoes on the
//! matching response. Broadcasts (`newProducerAvailable`, `producerClosed`,
//! `dominantSpeaker`, ...) carry no request id.
//!
//! - [`envelope`] - the untyped frame and error body
//! - [`messages`] - typed client requests and server messages
//! - [`rtp`] - RTP capability/parameter and transport descriptor payloads
//! - [`codec`] - text encoding with size limits

#![warn(clippy::pedantic)]

pub mod codec;
pub mod envelope;
pub mod messages;
pub mod rtp;

pub use codec::{decode_envelope, encode_envelope, CodecError};
pub use envelope::{Envelope, ErrorBody, ErrorCode};
pub use messages::{ClientRequest, ServerMessage};
