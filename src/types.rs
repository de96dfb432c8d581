use std::sync::Arc;

use serde::{Deserialize, Serialize};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};

use crate::id_types::{StreamId, TrackId};

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Immutable description of a remote track, cheap to clone and attach to
/// per-packet events.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: TrackId,
    pub stream_id: StreamId,
    pub kind: TrackKind,
    pub codec: Arc<RTCRtpCodecCapability>,
}
