//! Router codec configuration.

use common::types::MediaKind;
use serde_json::{json, Map, Value};
use signaling_protocol::rtp::{RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpParameters};

/// First dynamic payload type handed out to router codecs.
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// Start bitrate hint (kbps) attached to every video codec.
const VIDEO_START_BITRATE_KBPS: u32 = 1000;

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn video_codec(mime_type: &str, mut parameters: Map<String, Value>) -> RtpCodecCapability {
    parameters.insert(
        "x-google-start-bitrate".to_string(),
        json!(VIDEO_START_BITRATE_KBPS),
    );
    RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: mime_type.to_string(),
        preferred_payload_type: None,
        clock_rate: 90_000,
        channels: None,
        parameters,
        rtcp_feedback: Vec::new(),
    }
}

/// Codecs every room router is created with.
#[must_use]
pub fn default_router_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        },
        video_codec("video/VP8", Map::new()),
        video_codec("video/VP9", params(json!({ "profile-id": 2 }))),
        video_codec(
            "video/h264",
            params(json!({
                "packetization-mode": 1,
                "profile-level-id": "4d0032",
                "level-asymmetry-allowed": 1,
            })),
        ),
    ]
}

fn feedback(kind: &str, parameter: &str) -> RtcpFeedback {
    RtcpFeedback {
        kind: kind.to_string(),
        parameter: parameter.to_string(),
    }
}

fn feedback_for(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![feedback("transport-cc", "")],
        MediaKind::Video => vec![
            feedback("nack", ""),
            feedback("nack", "pli"),
            feedback("ccm", "fir"),
            feedback("goog-remb", ""),
            feedback("transport-cc", ""),
        ],
    }
}

/// Capabilities a router advertises for its configured codecs.
///
/// Codecs without a preferred payload type get one from the dynamic range,
/// and every codec gets the RTCP feedback set of its kind.
#[must_use]
pub fn router_capabilities(codecs: &[RtpCodecCapability]) -> RtpCapabilities {
    let mut next_payload_type = FIRST_DYNAMIC_PAYLOAD_TYPE;
    let codecs = codecs
        .iter()
        .map(|codec| {
            let mut codec = codec.clone();
            if codec.preferred_payload_type.is_none() {
                codec.preferred_payload_type = Some(next_payload_type);
                next_payload_type = next_payload_type.saturating_add(1);
            }
            if codec.rtcp_feedback.is_empty() {
                codec.rtcp_feedback = feedback_for(codec.kind);
            }
            codec
        })
        .collect();

    RtpCapabilities {
        codecs,
        header_extensions: Vec::new(),
    }
}

/// Whether an endpoint with `capabilities` can receive a stream produced
/// with `producer_parameters`.
#[must_use]
pub fn is_consumable(
    kind: MediaKind,
    producer_parameters: &RtpParameters,
    capabilities: &RtpCapabilities,
) -> bool {
    producer_parameters
        .primary_mime_type()
        .is_some_and(|mime| capabilities.supports(kind, mime))
}
