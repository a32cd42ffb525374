//! Session Client
//!
//! Client side of the Huddle room signaling protocol. A
//! [`SessionNegotiator`] takes a participant from an open signaling
//! connection to a steady state where it publishes its local tracks and
//! receives every other participant's tracks, and keeps that state in sync
//! as producers come and go.
//!
//! # Architecture
//!
//! ```text
//! application ──commands──> NegotiatorHandle ──> SessionNegotiator ──> Device
//!      ^                                            │    ^
//!      └────────────── SessionEvent ────────────────┘    │
//!                              outbound Envelope <───────┴───> inbound Envelope
//! ```
//!
//! The negotiator does not own a socket. The caller pumps decoded server
//! envelopes into [`NegotiatorHandle::deliver`] and writes whatever arrives
//! on the outbound channel.
//!
//! # Modules
//!
//! - [`negotiator`] - The negotiator actor and its handle
//! - [`correlation`] - Request id to continuation table
//! - [`queue`] - Producers waiting for the receive transport
//! - [`device`] - The local media stack seam
//! - [`events`] - Events published to the application
//! - [`state`] - Negotiation state and local tracks
//! - [`errors`] - Error types

pub mod correlation;
pub mod device;
pub mod errors;
pub mod events;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod negotiator;
pub mod queue;
pub mod state;

pub use device::Device;
pub use errors::{ClientError, DeviceError};
pub use events::SessionEvent;
pub use negotiator::{LocalProducer, NegotiatorHandle, NegotiatorStatus, SessionNegotiator};
pub use queue::PendingConsumeQueue;
pub use state::{LocalTrack, NegotiatorState, TrackSource};
