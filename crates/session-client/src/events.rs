//! Events published by the negotiator.

use crate::state::{NegotiatorState, TrackSource};
use common::types::{ConsumerId, PeerId, ProducerId};
use signaling_protocol::messages::{ConsumerInfo, DominantSpeakerInfo, ProducerStateChange};
use signaling_protocol::ErrorBody;

/// Something the application may want to render.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(NegotiatorState),

    /// Our peer id and whether we administer the room. Sent again on
    /// promotion.
    AdminInfo { peer_id: PeerId, is_admin: bool },

    /// The server accepted one of our tracks.
    ProducerCreated {
        source: TrackSource,
        producer_id: ProducerId,
    },

    /// A remote track is attached locally and resuming.
    ConsumerAdded(ConsumerInfo),

    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },

    RemoteProducerStateChanged(ProducerStateChange),

    DominantSpeakerChanged(DominantSpeakerInfo),

    /// Presence of another peer. Only the administrator receives these.
    PeerStatusUpdated {
        peer_id: PeerId,
        status: serde_json::Value,
    },

    /// A request was answered with an error.
    RequestFailed {
        action: String,
        error: ErrorBody,
    },
}
