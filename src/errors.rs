use thiserror::Error;

use crate::id_types::TrackId;

/// Component-level errors surfaced across the conference runtime.
///
/// Mailbox-level send failures carry the rejected message back to the caller
/// and live next to their channel types (`sink::SendError`, `worker::TaskError`);
/// everything else funnels through here.
#[derive(Debug, Error)]
pub enum SfuError {
    /// The data channel is not open (yet, or anymore).
    #[error("data channel is not ready")]
    NotReady,
    /// The referenced track, participant or subscription does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// A new publisher disagrees with the published track it claims to extend.
    #[error("track {id} mismatch: {details}")]
    Mismatch { id: TrackId, details: String },
    /// The remote track or RTCP pipe ended cleanly.
    #[error("remote ended")]
    RemoteEnded,
    /// The remote track, ICE or DTLS failed.
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

impl SfuError {
    /// Classifies a remote-pipe failure: a clean close versus a transport
    /// error.
    pub fn from_remote(err: webrtc::Error) -> Self {
        match err {
            webrtc::Error::ErrClosedPipe | webrtc::Error::ErrConnectionClosed => {
                SfuError::RemoteEnded
            }
            other => SfuError::RemoteError(other.to_string()),
        }
    }
}
