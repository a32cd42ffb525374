//! Identifier newtypes used on the signaling wire and inside the room controller.
//!
//! Every identifier serializes as a bare string so JSON payloads stay flat
//! (`"producerId": "6f1c..."`).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Server-generated identifier for one connected participant
    PeerId
);
uuid_id!(
    /// Identifier of one outgoing media track
    ProducerId
);
uuid_id!(
    /// Identifier of one incoming media track
    ConsumerId
);
uuid_id!(
    /// Identifier of a negotiated send or receive path
    TransportId
);
uuid_id!(
    /// Identifier of one routing context inside a media worker
    RouterId
);

/// Externally supplied room identifier.
///
/// Rooms are keyed by whatever string the client puts in the `roomId`
/// query parameter. A `tenant:` prefix groups rooms for admin reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Tenant used when the room identifier carries no prefix.
    pub const DEFAULT_TENANT: &'static str = "default";

    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tenant portion of the identifier (text before the first `:`).
    #[must_use]
    pub fn tenant(&self) -> &str {
        match self.0.split_once(':') {
            Some((tenant, _)) if !tenant.is_empty() => tenant,
            _ => Self::DEFAULT_TENANT,
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Kind of media carried by a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = ProducerId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));

        let back: ProducerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(PeerId::new(), PeerId::new());
    }

    #[test]
    fn test_id_from_str_rejects_garbage() {
        assert!("not-a-uuid".parse::<ConsumerId>().is_err());
    }

    #[test]
    fn test_room_tenant_prefix() {
        assert_eq!(RoomId::from("acme:standup").tenant(), "acme");
        assert_eq!(RoomId::from("standup").tenant(), "default");
        assert_eq!(RoomId::from(":standup").tenant(), "default");
        assert_eq!(RoomId::from("a:b:c").tenant(), "a");
    }

    #[test]
    fn test_media_kind_wire_format() {
        assert_eq!(serde_json::to_string(&MediaKind::Audio).unwrap(), "\"audio\"");
        let kind: MediaKind = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(kind, MediaKind::Video);
        assert!(serde_json::from_str::<MediaKind>("\"data\"").is_err());
    }
}
