//! In-band control protocol: JSON text frames on the peer's data channel.
//!
//! Messages are `m.call.*`-style events with a `type` tag and a `content`
//! body. Unknown types are dropped by the conference loop; known messages
//! round-trip through serde untouched apart from the fields the SFU
//! explicitly rewrites (the negotiation description and stream metadata).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id_types::{StreamId, TrackId};
use crate::types::TrackKind;

/// Stream metadata advertised over signaling and the data channel, keyed
/// by stream identifier.
pub type StreamMetadataMap = HashMap<StreamId, StreamMetadata>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(default = "StreamMetadata::default_purpose")]
    pub purpose: String,
    #[serde(default)]
    pub audio_muted: bool,
    #[serde(default)]
    pub video_muted: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tracks: HashMap<TrackId, TrackMetadata>,
}

impl StreamMetadata {
    fn default_purpose() -> String {
        "m.usermedia".to_string()
    }
}

impl Default for StreamMetadata {
    fn default() -> Self {
        Self {
            purpose: Self::default_purpose(),
            audio_muted: false,
            video_muted: false,
            tracks: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TrackKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// An SDP body exchanged through `focus.negotiate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Description {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// One subscription the client wants started, with the geometry it intends
/// to render at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub track_id: TrackId,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub track_id: TrackId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSubscription {
    #[serde(default)]
    pub subscribe: Vec<SubscribeRequest>,
    #[serde(default)]
    pub unsubscribe: Vec<UnsubscribeRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Negotiate {
    pub description: Description,
    #[serde(default, rename = "sdp_stream_metadata")]
    pub metadata: StreamMetadataMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataChanged {
    #[serde(rename = "sdp_stream_metadata")]
    pub metadata: StreamMetadataMap,
}

/// The closed set of data-channel messages the SFU speaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum DataChannelEvent {
    #[serde(rename = "focus.track_subscription")]
    TrackSubscription(TrackSubscription),
    #[serde(rename = "focus.negotiate")]
    Negotiate(Negotiate),
    #[serde(rename = "focus.ping")]
    Ping,
    #[serde(rename = "focus.pong")]
    Pong,
    #[serde(rename = "focus.sdp_stream_metadata_changed")]
    MetadataChanged(MetadataChanged),
}

impl DataChannelEvent {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        // The enum has no non-serializable payloads.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_subscription_round_trip() {
        let text = r#"{"type":"focus.track_subscription","content":{"subscribe":[{"track_id":"t1","width":640,"height":480}],"unsubscribe":[{"track_id":"t2"}]}}"#;
        let event = DataChannelEvent::from_json(text).unwrap();
        match &event {
            DataChannelEvent::TrackSubscription(sub) => {
                assert_eq!(sub.subscribe.len(), 1);
                assert_eq!(sub.subscribe[0].track_id, TrackId::from("t1"));
                assert_eq!(sub.subscribe[0].width, 640);
                assert_eq!(sub.unsubscribe[0].track_id, TrackId::from("t2"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let back = DataChannelEvent::from_json(&event.to_json()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_ping_pong_have_no_content() {
        let ping = DataChannelEvent::from_json(r#"{"type":"focus.ping"}"#).unwrap();
        assert_eq!(ping, DataChannelEvent::Ping);
        assert_eq!(
            DataChannelEvent::Pong.to_json(),
            r#"{"type":"focus.pong"}"#
        );
    }

    #[test]
    fn test_negotiate_round_trip() {
        let text = r#"{"type":"focus.negotiate","content":{"description":{"type":"offer","sdp":"v=0..."},"sdp_stream_metadata":{"s1":{"purpose":"m.usermedia","audio_muted":false,"video_muted":true,"tracks":{"t1":{"kind":"video","width":1280,"height":720}}}}}}"#;
        let event = DataChannelEvent::from_json(text).unwrap();
        match &event {
            DataChannelEvent::Negotiate(n) => {
                assert_eq!(n.description.kind, DescriptionKind::Offer);
                let stream = &n.metadata[&StreamId::from("s1")];
                assert!(stream.video_muted);
                let track = &stream.tracks[&TrackId::from("t1")];
                assert_eq!(track.kind, Some(TrackKind::Video));
                assert_eq!(track.width, Some(1280));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let back = DataChannelEvent::from_json(&event.to_json()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_metadata_defaults() {
        let text = r#"{"type":"focus.sdp_stream_metadata_changed","content":{"sdp_stream_metadata":{"s1":{}}}}"#;
        let event = DataChannelEvent::from_json(text).unwrap();
        match event {
            DataChannelEvent::MetadataChanged(m) => {
                let stream = &m.metadata[&StreamId::from("s1")];
                assert_eq!(stream.purpose, "m.usermedia");
                assert!(!stream.audio_muted);
                assert!(stream.tracks.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(DataChannelEvent::from_json(r#"{"type":"focus.unpublish"}"#).is_err());
        assert!(DataChannelEvent::from_json("not json").is_err());
    }
}
