//! Typed signaling messages.
//!
//! [`ClientRequest`] is what a participant sends to the room controller,
//! [`ServerMessage`] is everything the controller sends back (responses
//! and room broadcasts). Both convert to and from [`Envelope`].

use crate::codec::CodecError;
use crate::envelope::Envelope;
use crate::rtp::{AppData, DtlsParameters, RtpCapabilities, RtpParameters, TransportDescriptor};
use common::types::{ConsumerId, MediaKind, PeerId, ProducerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire action names.
pub mod actions {
    pub const GET_RTP_CAPABILITIES: &str = "getRtpCapabilities";
    pub const RTP_CAPABILITIES: &str = "rtpCapabilities";
    pub const CREATE_TRANSPORT: &str = "createTransport";
    pub const CREATE_TRANSPORT_RESPONSE: &str = "createTransportResponse";
    pub const CREATE_CONSUMER_TRANSPORT: &str = "createConsumerTransport";
    pub const CREATE_CONSUMER_TRANSPORT_RESPONSE: &str = "createConsumerTransportResponse";
    pub const CONNECT_TRANSPORT: &str = "connectTransport";
    pub const TRANSPORT_CONNECTED: &str = "transportConnected";
    pub const CONNECT_CONSUMER_TRANSPORT: &str = "connectConsumerTransport";
    pub const CONSUMER_TRANSPORT_CONNECTED: &str = "consumerTransportConnected";
    pub const DEVICE_READY: &str = "deviceReady";
    pub const EXISTING_PRODUCERS: &str = "existingProducers";
    pub const PRODUCE: &str = "produce";
    pub const PRODUCE_RESPONSE: &str = "produceResponse";
    pub const NEW_PRODUCER_AVAILABLE: &str = "newProducerAvailable";
    pub const CONSUME: &str = "consume";
    pub const CONSUME_RESPONSE: &str = "consumeResponse";
    pub const RESUME_CONSUMER: &str = "resumeConsumer";
    pub const RESUME_CONSUMER_RESPONSE: &str = "resumeConsumerResponse";
    pub const CHANGE_PRODUCER_STATE: &str = "changeProducerState";
    pub const CHANGE_PRODUCER_STATE_RESPONSE: &str = "changeProducerStateResponse";
    pub const PRODUCER_STATE_CHANGED: &str = "producerStateChanged";
    pub const CLOSE_PRODUCER: &str = "closeProducer";
    pub const CLOSE_PRODUCER_RESPONSE: &str = "closeProducerResponse";
    pub const PRODUCER_CLOSED: &str = "producerClosed";
    pub const ADMIN_INFO: &str = "adminInfo";
    pub const DOMINANT_SPEAKER: &str = "dominantSpeaker";
    pub const UPDATE_PEER_STATUS: &str = "updatePeerStatus";
    pub const PEER_STATUS_UPDATED: &str = "peerStatusUpdated";
}

/// Response action the server uses to answer a request action.
///
/// Returns `None` for fire-and-forget requests and unknown actions.
#[must_use]
pub fn response_action_for(request_action: &str) -> Option<&'static str> {
    use actions::*;
    let response = match request_action {
        GET_RTP_CAPABILITIES => RTP_CAPABILITIES,
        CREATE_TRANSPORT => CREATE_TRANSPORT_RESPONSE,
        CREATE_CONSUMER_TRANSPORT => CREATE_CONSUMER_TRANSPORT_RESPONSE,
        CONNECT_TRANSPORT => TRANSPORT_CONNECTED,
        CONNECT_CONSUMER_TRANSPORT => CONSUMER_TRANSPORT_CONNECTED,
        DEVICE_READY => EXISTING_PRODUCERS,
        PRODUCE => PRODUCE_RESPONSE,
        CONSUME => CONSUME_RESPONSE,
        RESUME_CONSUMER => RESUME_CONSUMER_RESPONSE,
        CHANGE_PRODUCER_STATE => CHANGE_PRODUCER_STATE_RESPONSE,
        CLOSE_PRODUCER => CLOSE_PRODUCER_RESPONSE,
        _ => return None,
    };
    Some(response)
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: AppData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerPauseState {
    pub producer_id: ProducerId,
    pub paused: bool,
}

/// A producer visible to other peers of the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    #[serde(default)]
    pub app_data: AppData,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducedInfo {
    pub id: ProducerId,
}

/// Consumer created on the requester's receive transport, paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: AppData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosedInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerStateChange {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminInfo {
    pub peer_id: PeerId,
    pub is_admin: bool,
}

/// Current loudest speaker; both fields are `null` on silence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DominantSpeakerInfo {
    pub producer_id: Option<ProducerId>,
    pub peer_id: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub status: Value,
}

// ============================================================================
// Client -> server
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    GetRtpCapabilities,
    CreateTransport,
    CreateConsumerTransport,
    ConnectTransport(ConnectTransportRequest),
    ConnectConsumerTransport(ConnectTransportRequest),
    DeviceReady,
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
    ResumeConsumer(ConsumerRef),
    ChangeProducerState(ProducerPauseState),
    CloseProducer(ProducerRef),
    /// Presence/attention signal, relayed to the room administrator.
    UpdatePeerStatus(Value),
}

impl ClientRequest {
    #[must_use]
    pub fn action(&self) -> &'static str {
        use actions::*;
        match self {
            ClientRequest::GetRtpCapabilities => GET_RTP_CAPABILITIES,
            ClientRequest::CreateTransport => CREATE_TRANSPORT,
            ClientRequest::CreateConsumerTransport => CREATE_CONSUMER_TRANSPORT,
            ClientRequest::ConnectTransport(_) => CONNECT_TRANSPORT,
            ClientRequest::ConnectConsumerTransport(_) => CONNECT_CONSUMER_TRANSPORT,
            ClientRequest::DeviceReady => DEVICE_READY,
            ClientRequest::Produce(_) => PRODUCE,
            ClientRequest::Consume(_) => CONSUME,
            ClientRequest::ResumeConsumer(_) => RESUME_CONSUMER,
            ClientRequest::ChangeProducerState(_) => CHANGE_PRODUCER_STATE,
            ClientRequest::CloseProducer(_) => CLOSE_PRODUCER,
            ClientRequest::UpdatePeerStatus(_) => UPDATE_PEER_STATUS,
        }
    }

    /// Action of the server reply, `None` when no reply is sent.
    #[must_use]
    pub fn response_action(&self) -> Option<&'static str> {
        response_action_for(self.action())
    }

    /// Parse a request out of a decoded envelope.
    ///
    /// # Errors
    ///
    /// `UnknownAction` when the action is not a client request,
    /// `InvalidData` when the payload does not match the action.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, CodecError> {
        use actions::*;
        let Envelope { action, data, .. } = envelope;
        let request = match action.as_str() {
            GET_RTP_CAPABILITIES => ClientRequest::GetRtpCapabilities,
            CREATE_TRANSPORT => ClientRequest::CreateTransport,
            CREATE_CONSUMER_TRANSPORT => ClientRequest::CreateConsumerTransport,
            CONNECT_TRANSPORT => ClientRequest::ConnectTransport(payload(&action, data)?),
            CONNECT_CONSUMER_TRANSPORT => {
                ClientRequest::ConnectConsumerTransport(payload(&action, data)?)
            }
            DEVICE_READY => ClientRequest::DeviceReady,
            PRODUCE => ClientRequest::Produce(payload(&action, data)?),
            CONSUME => ClientRequest::Consume(payload(&action, data)?),
            RESUME_CONSUMER => ClientRequest::ResumeConsumer(payload(&action, data)?),
            CHANGE_PRODUCER_STATE => ClientRequest::ChangeProducerState(payload(&action, data)?),
            CLOSE_PRODUCER => ClientRequest::CloseProducer(payload(&action, data)?),
            UPDATE_PEER_STATUS => ClientRequest::UpdatePeerStatus(data),
            _ => return Err(CodecError::UnknownAction(action)),
        };
        Ok(request)
    }

    /// Build the envelope for this request.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if a payload cannot be represented as JSON.
    pub fn into_envelope(self, request_id: Option<u64>) -> Result<Envelope, CodecError> {
        let action = self.action();
        let data = match self {
            ClientRequest::GetRtpCapabilities
            | ClientRequest::CreateTransport
            | ClientRequest::CreateConsumerTransport
            | ClientRequest::DeviceReady => Value::Null,
            ClientRequest::ConnectTransport(p) | ClientRequest::ConnectConsumerTransport(p) => {
                to_data(&p)?
            }
            ClientRequest::Produce(p) => to_data(&p)?,
            ClientRequest::Consume(p) => to_data(&p)?,
            ClientRequest::ResumeConsumer(p) => to_data(&p)?,
            ClientRequest::ChangeProducerState(p) => to_data(&p)?,
            ClientRequest::CloseProducer(p) => to_data(&p)?,
            ClientRequest::UpdatePeerStatus(status) => status,
        };
        Ok(Envelope::new(action, data).with_request_id(request_id))
    }
}

// ============================================================================
// Server -> client
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    RtpCapabilities(RtpCapabilities),
    CreateTransportResponse(TransportDescriptor),
    CreateConsumerTransportResponse(TransportDescriptor),
    TransportConnected,
    ConsumerTransportConnected,
    ExistingProducers(Vec<ProducerInfo>),
    ProduceResponse(ProducedInfo),
    NewProducerAvailable(ProducerInfo),
    ConsumeResponse(ConsumerInfo),
    ResumeConsumerResponse(ConsumerRef),
    ChangeProducerStateResponse(ProducerPauseState),
    CloseProducerResponse(ProducerRef),
    ProducerClosed(ProducerClosedInfo),
    ProducerStateChanged(ProducerStateChange),
    AdminInfo(AdminInfo),
    DominantSpeaker(DominantSpeakerInfo),
    PeerStatusUpdated(PeerStatus),
}

impl ServerMessage {
    #[must_use]
    pub fn action(&self) -> &'static str {
        use actions::*;
        match self {
            ServerMessage::RtpCapabilities(_) => RTP_CAPABILITIES,
            ServerMessage::CreateTransportResponse(_) => CREATE_TRANSPORT_RESPONSE,
            ServerMessage::CreateConsumerTransportResponse(_) => CREATE_CONSUMER_TRANSPORT_RESPONSE,
            ServerMessage::TransportConnected => TRANSPORT_CONNECTED,
            ServerMessage::ConsumerTransportConnected => CONSUMER_TRANSPORT_CONNECTED,
            ServerMessage::ExistingProducers(_) => EXISTING_PRODUCERS,
            ServerMessage::ProduceResponse(_) => PRODUCE_RESPONSE,
            ServerMessage::NewProducerAvailable(_) => NEW_PRODUCER_AVAILABLE,
            ServerMessage::ConsumeResponse(_) => CONSUME_RESPONSE,
            ServerMessage::ResumeConsumerResponse(_) => RESUME_CONSUMER_RESPONSE,
            ServerMessage::ChangeProducerStateResponse(_) => CHANGE_PRODUCER_STATE_RESPONSE,
            ServerMessage::CloseProducerResponse(_) => CLOSE_PRODUCER_RESPONSE,
            ServerMessage::ProducerClosed(_) => PRODUCER_CLOSED,
            ServerMessage::ProducerStateChanged(_) => PRODUCER_STATE_CHANGED,
            ServerMessage::AdminInfo(_) => ADMIN_INFO,
            ServerMessage::DominantSpeaker(_) => DOMINANT_SPEAKER,
            ServerMessage::PeerStatusUpdated(_) => PEER_STATUS_UPDATED,
        }
    }

    /// Build the envelope for this message.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if a payload cannot be represented as JSON.
    pub fn into_envelope(self, request_id: Option<u64>) -> Result<Envelope, CodecError> {
        let action = self.action();
        let data = match self {
            ServerMessage::TransportConnected | ServerMessage::ConsumerTransportConnected => {
                Value::Null
            }
            ServerMessage::RtpCapabilities(p) => to_data(&p)?,
            ServerMessage::CreateTransportResponse(p)
            | ServerMessage::CreateConsumerTransportResponse(p) => to_data(&p)?,
            ServerMessage::ExistingProducers(p) => to_data(&p)?,
            ServerMessage::ProduceResponse(p) => to_data(&p)?,
            ServerMessage::NewProducerAvailable(p) => to_data(&p)?,
            ServerMessage::ConsumeResponse(p) => to_data(&p)?,
            ServerMessage::ResumeConsumerResponse(p) => to_data(&p)?,
            ServerMessage::ChangeProducerStateResponse(p) => to_data(&p)?,
            ServerMessage::CloseProducerResponse(p) => to_data(&p)?,
            ServerMessage::ProducerClosed(p) => to_data(&p)?,
            ServerMessage::ProducerStateChanged(p) => to_data(&p)?,
            ServerMessage::AdminInfo(p) => to_data(&p)?,
            ServerMessage::DominantSpeaker(p) => to_data(&p)?,
            ServerMessage::PeerStatusUpdated(p) => to_data(&p)?,
        };
        Ok(Envelope::new(action, data).with_request_id(request_id))
    }

    /// Parse a successful (non-error) server envelope.
    ///
    /// # Errors
    ///
    /// `UnknownAction` for actions the server never sends,
    /// `InvalidData` when the payload does not match the action.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, CodecError> {
        use actions::*;
        let Envelope { action, data, .. } = envelope;
        let message = match action.as_str() {
            RTP_CAPABILITIES => ServerMessage::RtpCapabilities(payload(&action, data)?),
            CREATE_TRANSPORT_RESPONSE => {
                ServerMessage::CreateTransportResponse(payload(&action, data)?)
            }
            CREATE_CONSUMER_TRANSPORT_RESPONSE => {
                ServerMessage::CreateConsumerTransportResponse(payload(&action, data)?)
            }
            TRANSPORT_CONNECTED => ServerMessage::TransportConnected,
            CONSUMER_TRANSPORT_CONNECTED => ServerMessage::ConsumerTransportConnected,
            EXISTING_PRODUCERS => ServerMessage::ExistingProducers(payload(&action, data)?),
            PRODUCE_RESPONSE => ServerMessage::ProduceResponse(payload(&action, data)?),
            NEW_PRODUCER_AVAILABLE => ServerMessage::NewProducerAvailable(payload(&action, data)?),
            CONSUME_RESPONSE => ServerMessage::ConsumeResponse(payload(&action, data)?),
            RESUME_CONSUMER_RESPONSE => {
                ServerMessage::ResumeConsumerResponse(payload(&action, data)?)
            }
            CHANGE_PRODUCER_STATE_RESPONSE => {
                ServerMessage::ChangeProducerStateResponse(payload(&action, data)?)
            }
            CLOSE_PRODUCER_RESPONSE => {
                ServerMessage::CloseProducerResponse(payload(&action, data)?)
            }
            PRODUCER_CLOSED => ServerMessage::ProducerClosed(payload(&action, data)?),
            PRODUCER_STATE_CHANGED => ServerMessage::ProducerStateChanged(payload(&action, data)?),
            ADMIN_INFO => ServerMessage::AdminInfo(payload(&action, data)?),
            DOMINANT_SPEAKER => ServerMessage::DominantSpeaker(payload(&action, data)?),
            PEER_STATUS_UPDATED => ServerMessage::PeerStatusUpdated(payload(&action, data)?),
            _ => return Err(CodecError::UnknownAction(action)),
        };
        Ok(message)
    }
}

fn payload<T: DeserializeOwned>(action: &str, data: Value) -> Result<T, CodecError> {
    serde_json::from_value(data).map_err(|e| CodecError::InvalidData {
        action: action.to_string(),
        reason: e.to_string(),
    })
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> Envelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_produce_request() {
        let env = envelope(json!({
            "action": "produce",
            "requestId": 3,
            "data": {
                "kind": "video",
                "rtpParameters": {
                    "codecs": [{"mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000}]
                },
                "appData": {"source": "webcam"}
            }
        }));

        let request = ClientRequest::from_envelope(env).unwrap();
        let ClientRequest::Produce(produce) = request else {
            panic!("expected produce, got {request:?}");
        };
        assert_eq!(produce.kind, MediaKind::Video);
        assert_eq!(produce.app_data["source"], "webcam");
    }

    #[test]
    fn test_produce_without_app_data_defaults_empty() {
        let env = envelope(json!({
            "action": "produce",
            "data": {"kind": "audio", "rtpParameters": {"codecs": []}}
        }));
        let ClientRequest::Produce(produce) = ClientRequest::from_envelope(env).unwrap() else {
            panic!("expected produce");
        };
        assert!(produce.app_data.is_empty());
    }

    #[test]
    fn test_dataless_requests_ignore_payload() {
        let env = envelope(json!({"action": "deviceReady", "data": {"ignored": true}}));
        assert_eq!(
            ClientRequest::from_envelope(env).unwrap(),
            ClientRequest::DeviceReady
        );
    }

    #[test]
    fn test_unknown_action_is_reported() {
        let env = envelope(json!({"action": "teleport"}));
        let err = ClientRequest::from_envelope(env).unwrap_err();
        assert!(matches!(err, CodecError::UnknownAction(a) if a == "teleport"));
    }

    #[test]
    fn test_invalid_consume_payload_names_action() {
        let env = envelope(json!({"action": "consume", "data": {"producerId": "nope"}}));
        let err = ClientRequest::from_envelope(env).unwrap_err();
        assert!(matches!(err, CodecError::InvalidData { ref action, .. } if action == "consume"));
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn test_response_action_mapping() {
        assert_eq!(
            ClientRequest::CreateTransport.response_action(),
            Some("createTransportResponse")
        );
        assert_eq!(
            response_action_for("connectConsumerTransport"),
            Some("consumerTransportConnected")
        );
        assert_eq!(response_action_for("deviceReady"), Some("existingProducers"));
        assert_eq!(
            ClientRequest::UpdatePeerStatus(json!({"isPresent": true})).response_action(),
            None
        );
        assert_eq!(response_action_for("bogus"), None);
    }

    #[test]
    fn test_request_envelope_carries_request_id() {
        let env = ClientRequest::ResumeConsumer(ConsumerRef {
            consumer_id: ConsumerId::new(),
        })
        .into_envelope(Some(11))
        .unwrap();
        assert_eq!(env.action, "resumeConsumer");
        assert_eq!(env.request_id, Some(11));
        assert!(env.data.get("consumerId").is_some());
    }

    #[test]
    fn test_silence_dominant_speaker_serializes_nulls() {
        let env = ServerMessage::DominantSpeaker(DominantSpeakerInfo::default())
            .into_envelope(None)
            .unwrap();
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"action": "dominantSpeaker", "data": {"producerId": null, "peerId": null}})
        );
    }

    #[test]
    fn test_new_producer_broadcast_shape() {
        let producer_id = ProducerId::new();
        let peer_id = PeerId::new();
        let mut app_data = AppData::new();
        app_data.insert("source".to_string(), json!("screen"));
        app_data.insert("peerId".to_string(), json!(peer_id));

        let env = ServerMessage::NewProducerAvailable(ProducerInfo {
            producer_id,
            peer_id,
            kind: MediaKind::Video,
            app_data,
            paused: false,
        })
        .into_envelope(None)
        .unwrap();

        assert_eq!(env.action, "newProducerAvailable");
        assert_eq!(env.data["producerId"], json!(producer_id));
        assert_eq!(env.data["appData"]["source"], "screen");
        assert_eq!(env.request_id, None);
    }

    #[test]
    fn test_server_message_parse_for_client() {
        let producer_id = ProducerId::new();
        let peer_id = PeerId::new();
        let env = envelope(json!({
            "action": "producerClosed",
            "data": {"producerId": producer_id, "peerId": peer_id}
        }));
        assert_eq!(
            ServerMessage::from_envelope(env).unwrap(),
            ServerMessage::ProducerClosed(ProducerClosedInfo {
                producer_id,
                peer_id
            })
        );
    }

    #[test]
    fn test_server_message_rejects_client_actions() {
        let env = envelope(json!({"action": "produce"}));
        assert!(matches!(
            ServerMessage::from_envelope(env),
            Err(CodecError::UnknownAction(_))
        ));
    }
}
