//! RTP and DTLS fixtures.

use common::types::MediaKind;
use serde_json::{json, Map, Value};
use signaling_protocol::rtp::{
    AppData, DtlsFingerprint, DtlsParameters, DtlsRole, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters,
};

fn codec(
    mime_type: &str,
    payload_type: u8,
    clock_rate: u32,
    channels: Option<u8>,
) -> RtpCodecParameters {
    RtpCodecParameters {
        mime_type: mime_type.to_string(),
        payload_type,
        clock_rate,
        channels,
        parameters: Map::new(),
        rtcp_feedback: Vec::new(),
    }
}

/// Opus send parameters.
#[must_use]
pub fn audio_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![codec("audio/opus", 111, 48_000, Some(2))],
        ..RtpParameters::default()
    }
}

/// VP8 send parameters.
#[must_use]
pub fn video_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![codec("video/VP8", 96, 90_000, None)],
        ..RtpParameters::default()
    }
}

/// Send parameters for `kind`.
#[must_use]
pub fn parameters_for(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => audio_parameters(),
        MediaKind::Video => video_parameters(),
    }
}

/// Parameters in a codec the default router does not offer.
#[must_use]
pub fn unsupported_video_parameters() -> RtpParameters {
    RtpParameters {
        codecs: vec![codec("video/AV1", 45, 90_000, None)],
        ..RtpParameters::default()
    }
}

/// Receive capabilities of a typical browser: opus and VP8.
#[must_use]
pub fn device_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: Some(100),
                clock_rate: 48_000,
                channels: Some(2),
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: Some(101),
                clock_rate: 90_000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            },
        ],
        header_extensions: Vec::new(),
    }
}

/// Receive capabilities without any video codec.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    let mut capabilities = device_capabilities();
    capabilities.codecs.retain(|c| c.kind == MediaKind::Audio);
    capabilities
}

#[must_use]
pub fn dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: Some(DtlsRole::Client),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: ["AB:CD:EF:01:23:45:67:89"; 4].join(":"),
        }],
    }
}

/// `appData` carrying a track source tag.
#[must_use]
pub fn source(tag: &str) -> AppData {
    let mut app_data = Map::new();
    app_data.insert("source".to_string(), Value::String(tag.to_string()));
    app_data
}

/// A presence payload as sent with `updatePeerStatus`.
#[must_use]
pub fn presence(attentive: bool) -> Value {
    json!({ "attentive": attentive, "handRaised": false })
}
