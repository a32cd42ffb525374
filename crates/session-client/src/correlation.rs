//! Request/response correlation.
//!
//! Every outbound request gets a fresh `requestId`. The server echoes it on
//! the response, which resolves exactly one entry here. Two requests of the
//! same action can be in flight at once.

use crate::state::LocalTrack;
use common::types::{ConsumerId, ProducerId};
use signaling_protocol::messages::{actions, ProducerInfo};
use std::collections::HashMap;

/// What the negotiator does when a response arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    LoadDevice,
    CreateSendTransport,
    SendTransportConnected,
    /// `initial` produces gate `deviceReady`.
    Produced { track: LocalTrack, initial: bool },
    ExistingProducers,
    CreateRecvTransport,
    RecvTransportConnected,
    Consumed { producer: ProducerInfo },
    ConsumerResumed { consumer_id: ConsumerId },
    ProducerStateChanged { producer_id: ProducerId, paused: bool },
    ProducerClosed { producer_id: ProducerId },
}

impl Continuation {
    /// Response action the server answers with.
    #[must_use]
    pub fn expected_action(&self) -> &'static str {
        match self {
            Continuation::LoadDevice => actions::RTP_CAPABILITIES,
            Continuation::CreateSendTransport => actions::CREATE_TRANSPORT_RESPONSE,
            Continuation::SendTransportConnected => actions::TRANSPORT_CONNECTED,
            Continuation::Produced { .. } => actions::PRODUCE_RESPONSE,
            Continuation::ExistingProducers => actions::EXISTING_PRODUCERS,
            Continuation::CreateRecvTransport => actions::CREATE_CONSUMER_TRANSPORT_RESPONSE,
            Continuation::RecvTransportConnected => actions::CONSUMER_TRANSPORT_CONNECTED,
            Continuation::Consumed { .. } => actions::CONSUME_RESPONSE,
            Continuation::ConsumerResumed { .. } => actions::RESUME_CONSUMER_RESPONSE,
            Continuation::ProducerStateChanged { .. } => actions::CHANGE_PRODUCER_STATE_RESPONSE,
            Continuation::ProducerClosed { .. } => actions::CLOSE_PRODUCER_RESPONSE,
        }
    }
}

/// In-flight requests keyed by request id.
#[derive(Debug)]
pub struct PendingRequests {
    next_id: u64,
    pending: HashMap<u64, Continuation>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Register a continuation and return the id to send with the request.
    pub fn register(&mut self, continuation: Continuation) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, continuation);
        id
    }

    /// Take the continuation for `request_id`, if it is still pending.
    pub fn resolve(&mut self, request_id: u64) -> Option<Continuation> {
        self.pending.remove(&request_id)
    }

    /// Whether a consume for `producer_id` is awaiting its response.
    #[must_use]
    pub fn is_consuming(&self, producer_id: ProducerId) -> bool {
        self.pending.values().any(|c| {
            matches!(c, Continuation::Consumed { producer } if producer.producer_id == producer_id)
        })
    }

    /// Drop every pending entry, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
