//! # RC Test Utilities
//!
//! Shared fixtures for room controller and session client tests.
//!
//! - [`rtp`] - RTP parameters, capabilities and DTLS parameters a browser
//!   endpoint would send
//! - [`tokens`] - Admin bearer token builder
//! - [`eventual`] - Polling assertion for state that settles asynchronously
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rc_test_utils::rtp::{audio_parameters, device_capabilities};
//! use rc_test_utils::tokens::AdminTokenBuilder;
//!
//! let token = AdminTokenBuilder::new("secret").build();
//! let request = ProduceRequest {
//!     kind: MediaKind::Audio,
//!     rtp_parameters: audio_parameters(),
//!     app_data: source("mic"),
//! };
//! ```

pub mod eventual;
pub mod rtp;
pub mod tokens;

pub use eventual::assert_eventually;
pub use rtp::*;
pub use tokens::AdminTokenBuilder;

/// Room id unique to one test.
#[must_use]
pub fn random_room_id() -> String {
    format!("room-{}", uuid::Uuid::new_v4().simple())
}
