//! Negotiation state and local track descriptions.

use common::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outer negotiation state.
///
/// ```text
/// Connecting -> CapabilitiesExchanged -> SendTransportReady -> Producing
///            -> RecvTransportReady -> ConsumingSteadyState
/// ```
///
/// `ConsumingSteadyState` is not terminal: producers keep appearing and
/// disappearing without changing it. `Closed` and `Failed` are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiatorState {
    Connecting,
    CapabilitiesExchanged,
    SendTransportReady,
    Producing,
    RecvTransportReady,
    ConsumingSteadyState,
    Closed,
    Failed,
}

impl NegotiatorState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NegotiatorState::Connecting => "CONNECTING",
            NegotiatorState::CapabilitiesExchanged => "CAPABILITIES_EXCHANGED",
            NegotiatorState::SendTransportReady => "SEND_TRANSPORT_READY",
            NegotiatorState::Producing => "PRODUCING",
            NegotiatorState::RecvTransportReady => "RECV_TRANSPORT_READY",
            NegotiatorState::ConsumingSteadyState => "CONSUMING_STEADY_STATE",
            NegotiatorState::Closed => "CLOSED",
            NegotiatorState::Failed => "FAILED",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, NegotiatorState::Closed | NegotiatorState::Failed)
    }
}

impl fmt::Display for NegotiatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a local track comes from. Sent to the server as `appData.source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Mic,
    Webcam,
    Screen,
}

impl TrackSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrackSource::Mic => "mic",
            TrackSource::Webcam => "webcam",
            TrackSource::Screen => "screen",
        }
    }

    /// Kind of media the source produces.
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            TrackSource::Mic => MediaKind::Audio,
            TrackSource::Webcam | TrackSource::Screen => MediaKind::Video,
        }
    }
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local track to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub source: TrackSource,
}

impl LocalTrack {
    #[must_use]
    pub const fn microphone() -> Self {
        Self {
            kind: MediaKind::Audio,
            source: TrackSource::Mic,
        }
    }

    #[must_use]
    pub const fn camera() -> Self {
        Self {
            kind: MediaKind::Video,
            source: TrackSource::Webcam,
        }
    }

    #[must_use]
    pub const fn screen() -> Self {
        Self {
            kind: MediaKind::Video,
            source: TrackSource::Screen,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_match_wire_style() {
        assert_eq!(
            NegotiatorState::ConsumingSteadyState.to_string(),
            "CONSUMING_STEADY_STATE"
        );
        assert_eq!(
            serde_json::to_value(NegotiatorState::SendTransportReady).unwrap(),
            "SEND_TRANSPORT_READY"
        );
        assert!(!NegotiatorState::ConsumingSteadyState.is_terminal());
        assert!(NegotiatorState::Failed.is_terminal());
    }

    #[test]
    fn test_track_sources() {
        assert_eq!(LocalTrack::screen().source.kind(), MediaKind::Video);
        assert_eq!(LocalTrack::microphone().source.as_str(), "mic");
    }
}
