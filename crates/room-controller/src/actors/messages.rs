//! Message types for actor communication.
//!
//! Request/response pairs carry a `oneshot` sender for the reply. Messages
//! the room actor sends to itself (engine completions, transport state
//! changes) travel through the same mailbox so they are ordered with every
//! other mutation of the room.

use super::connection::ConnectionActorHandle;
use super::room::RoomActorHandle;
use crate::errors::RcError;
use crate::media::{
    EngineError, MediaConsumer, MediaProducer, MediaTransport, RouterAssignment, TransportState,
};
use chrono::{DateTime, Utc};
use common::types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, RouterId, TransportId};
use serde::Serialize;
use serde_json::Value;
use signaling_protocol::messages::DominantSpeakerInfo;
use signaling_protocol::rtp::{AppData, RtpCapabilities};
use signaling_protocol::ClientRequest;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

// ============================================================================
// Registry
// ============================================================================

/// Messages handled by the `RoomRegistryActor`.
pub enum RegistryMessage {
    /// Admit a peer into a room, creating the room if needed.
    Join {
        room_id: RoomId,
        join: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinAccepted, RcError>>,
    },

    /// Router assignment for a room being created finished.
    RouterAssigned {
        room_id: RoomId,
        result: Result<RouterAssignment, EngineError>,
    },

    /// A room actor reports that its last peer left.
    RoomEmptied { room_id: RoomId },

    /// Result of asking an emptied room to close.
    CloseChecked { room_id: RoomId, closed: bool },

    /// Session dump of one room.
    GetRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomSnapshot, RcError>>,
    },

    /// Peer counts of every open room.
    ListRooms {
        respond_to: oneshot::Sender<Vec<RoomSummary>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop admitting peers and close every room.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), RcError>>,
    },
}

/// Registry status snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub peer_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Peer count of one room, for per-tenant aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub peers: usize,
}

// ============================================================================
// Room
// ============================================================================

/// A connection asking to join a room.
pub struct JoinRequest {
    pub peer_id: PeerId,
    pub connection: ConnectionActorHandle,
}

/// Result of a successful join.
#[derive(Clone)]
pub struct JoinAccepted {
    pub peer_id: PeerId,
    pub is_admin: bool,
    pub rtp_capabilities: RtpCapabilities,
    pub room: RoomActorHandle,
}

/// Messages handled by a `RoomActor`.
pub enum RoomMessage {
    Join {
        join: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinAccepted, RcError>>,
    },

    /// A signaling request from one of the room's peers. The reply goes to
    /// the peer's outbound queue, not back to the caller.
    Signal {
        peer_id: PeerId,
        request_id: Option<u64>,
        request: ClientRequest,
    },

    /// The peer's connection ended.
    Disconnect { peer_id: PeerId },

    /// A media engine call started by this room finished.
    Completed {
        ctx: RequestContext,
        completion: EngineCompletion,
    },

    /// A transport owned by one of the room's peers changed state.
    TransportStateChanged {
        peer_id: PeerId,
        transport_id: TransportId,
        state: TransportState,
    },

    GetSnapshot {
        respond_to: oneshot::Sender<RoomSnapshot>,
    },

    /// Close the router and stop if the room still has no peers.
    CloseIfEmpty { respond_to: oneshot::Sender<bool> },
}

/// The request a completion answers.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub peer_id: PeerId,
    pub request_id: Option<u64>,
    pub action: &'static str,
    pub started: Instant,
}

/// Which slot of a peer a transport fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "receive",
        }
    }
}

/// Outcome of an asynchronous media engine call.
pub enum EngineCompletion {
    TransportCreated {
        direction: TransportDirection,
        result: Result<Arc<dyn MediaTransport>, EngineError>,
    },
    TransportConnected {
        direction: TransportDirection,
        transport_id: TransportId,
        result: Result<(), EngineError>,
    },
    Produced {
        transport_id: TransportId,
        app_data: AppData,
        result: Result<Arc<dyn MediaProducer>, EngineError>,
    },
    Consumed {
        transport_id: TransportId,
        producer_id: ProducerId,
        result: Result<Arc<dyn MediaConsumer>, EngineError>,
    },
    ConsumerResumed {
        consumer_id: ConsumerId,
        result: Result<(), EngineError>,
    },
    ProducerPaused {
        producer_id: ProducerId,
        paused: bool,
        result: Result<(), EngineError>,
    },
}

impl EngineCompletion {
    /// Close whatever the call created. Used when the room can no longer
    /// take delivery of the result.
    pub async fn discard(self) {
        match self {
            EngineCompletion::TransportCreated {
                result: Ok(transport),
                ..
            } => transport.close().await,
            EngineCompletion::Produced {
                result: Ok(producer),
                ..
            } => producer.close().await,
            EngineCompletion::Consumed {
                result: Ok(consumer),
                ..
            } => consumer.close().await,
            _ => {}
        }
    }
}

// ============================================================================
// Session dump
// ============================================================================

/// Full state of one room, served by the admin API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub router_id: RouterId,
    pub worker_index: usize,
    pub created_at: DateTime<Utc>,
    pub dominant_speaker: DominantSpeakerInfo,
    pub peers: Vec<PeerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub is_admin: bool,
    pub joined_at: DateTime<Utc>,
    pub status: Value,
    pub send_transport: Option<TransportSnapshot>,
    pub recv_transport: Option<TransportSnapshot>,
    pub producers: Vec<ProducerSnapshot>,
    pub consumers: Vec<ConsumerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSnapshot {
    pub id: TransportId,
    pub state: TransportState,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSnapshot {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
    pub app_data: AppData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSnapshot {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub producer_peer_id: PeerId,
    pub kind: MediaKind,
    pub paused: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_labels() {
        assert_eq!(TransportDirection::Send.as_str(), "send");
        assert_eq!(TransportDirection::Recv.as_str(), "receive");
    }

    #[test]
    fn test_peer_snapshot_serializes_camel_case() {
        let snapshot = PeerSnapshot {
            peer_id: PeerId::new(),
            is_admin: true,
            joined_at: Utc::now(),
            status: serde_json::json!({"attentive": true}),
            send_transport: Some(TransportSnapshot {
                id: TransportId::new(),
                state: TransportState::Connected,
                connected: true,
            }),
            recv_transport: None,
            producers: Vec::new(),
            consumers: Vec::new(),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["isAdmin"], true);
        assert_eq!(json["sendTransport"]["state"], "connected");
        assert!(json["recvTransport"].is_null());
        assert_eq!(json["status"]["attentive"], true);
    }
}
