use std::fmt;
use std::sync::Arc;

/// Declares a strongly typed string identifier wrapping an `Arc<String>`
/// for cheap cloning, with `Display`, `From` conversions, `AsRef<str>` and
/// plain-string serde representation.
macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Arc<String>);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(Arc::new(s))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(Arc::new(s.to_string()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                String::deserialize(deserializer).map($name::from)
            }
        }
    };
}

string_id!(
    /// A Matrix user identifier (`@user:example.org`).
    UserId
);
string_id!(
    /// A device identifier, unique per user.
    DeviceId
);
string_id!(
    /// A call (conference) identifier.
    CallId
);
string_id!(
    /// A signaling session identifier, unique per client instance in a call.
    SessionId
);
string_id!(
    /// A media track identifier, unique within a conference.
    TrackId
);
string_id!(
    /// A media stream identifier grouping related tracks.
    StreamId
);

/// Uniquely names one client instance participating in one call.
///
/// Totally ordered so participants can be kept in deterministic collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub call_id: CallId,
}

impl ParticipantId {
    pub fn new(user_id: UserId, device_id: DeviceId, call_id: CallId) -> Self {
        Self {
            user_id,
            device_id,
            call_id,
        }
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.user_id, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_conversion() {
        let id_str = "@alice:example.org";
        let id = UserId::from(id_str);
        assert_eq!(id.as_ref(), id_str);

        let id_string = String::from("DEVICE1");
        let id2 = DeviceId::from(id_string);
        assert_eq!(id2.as_ref(), "DEVICE1");
    }

    #[test]
    fn test_display_trait() {
        let id = TrackId::from("track-abc");
        assert_eq!(format!("{}", id), "track-abc");
    }

    #[test]
    fn test_participant_id_display_and_ordering() {
        let a = ParticipantId::new(
            UserId::from("@a:x"),
            DeviceId::from("D1"),
            CallId::from("c1"),
        );
        let b = ParticipantId::new(
            UserId::from("@b:x"),
            DeviceId::from("D1"),
            CallId::from("c1"),
        );
        assert_eq!(a.to_string(), "@a:x|D1");
        assert!(a < b);
    }

    #[test]
    fn test_serde_plain_string() {
        let id = StreamId::from("s1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"s1\"");
        let back: StreamId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
