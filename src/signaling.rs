//! Message shapes for the external store-and-forward signaling bus, and the
//! per-conference outbound worker that writes to it.
//!
//! The bus itself (Matrix to-device traffic in production) is an external
//! collaborator; the conference core only consumes [`SignalingEvent`]s and
//! hands [`OutboundMessage`]s to a [`SignalingTransport`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::datachannel::{Description, StreamMetadataMap};
use crate::id_types::{CallId, DeviceId, SessionId, UserId};
use crate::metrics::SFU_SIGNALING_DROPPED_TOTAL;
use crate::sink::{self, MessageSink};

/// Why a participant left (or is being told to leave) the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    UserHangup,
    KeepAliveTimeout,
    /// The client selected another device's answer.
    AnsweredElsewhere,
}

impl std::fmt::Display for HangupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HangupReason::UserHangup => write!(f, "user_hangup"),
            HangupReason::KeepAliveTimeout => write!(f, "keep_alive_timeout"),
            HangupReason::AnsweredElsewhere => write!(f, "answered_elsewhere"),
        }
    }
}

/// Addressing common to every inbound bus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub call_id: CallId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub sender_session_id: SessionId,
    /// The session the sender believes it is talking to. Events for a
    /// session the SFU does not own are dropped by the conference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_session_id: Option<SessionId>,
    #[serde(flatten)]
    pub event: SignalingEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum SignalingEvent {
    #[serde(rename = "call-invite")]
    Invite(InviteContent),
    #[serde(rename = "call-candidates")]
    Candidates(CandidatesContent),
    #[serde(rename = "call-select-answer")]
    SelectAnswer(SelectAnswerContent),
    #[serde(rename = "call-hangup")]
    Hangup(HangupContent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteContent {
    pub offer: Description,
    #[serde(default, rename = "sdp_stream_metadata")]
    pub metadata: StreamMetadataMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatesContent {
    pub candidates: Vec<RTCIceCandidateInit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectAnswerContent {
    pub selected_party_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HangupContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Where an outbound message goes: one client session in one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub call_id: CallId,
    pub session_id: SessionId,
}

/// The four message shapes the SFU sends back over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum OutboundMessage {
    #[serde(rename = "call-answer")]
    Answer {
        answer: Description,
        #[serde(rename = "sdp_stream_metadata")]
        metadata: StreamMetadataMap,
    },
    /// An empty `candidate` field is the end-of-candidates sentinel.
    #[serde(rename = "call-candidates")]
    Candidates { candidates: Vec<RTCIceCandidateInit> },
    #[serde(rename = "call-candidates-gathering-finished")]
    CandidatesGatheringFinished,
    #[serde(rename = "call-hangup")]
    Hangup { reason: HangupReason },
}

/// Delivery to the external bus; implemented by the embedding service.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, to: &Recipient, message: OutboundMessage) -> anyhow::Result<()>;
}

/// Per-conference outbound worker. Producers never block: when the bus
/// cannot keep up the message is dropped and reported, and the affected
/// recipient may desynchronize until the next exchange.
pub struct SignalingWorker {
    sink: MessageSink<CallId, (Recipient, OutboundMessage)>,
    handle: JoinHandle<()>,
}

impl SignalingWorker {
    pub const CAPACITY: usize = 128;

    pub fn start(call_id: CallId, transport: Arc<dyn SignalingTransport>) -> Self {
        let (tx, mut rx) = sink::channel::<CallId, (Recipient, OutboundMessage)>(Self::CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some((call, (to, message))) = rx.recv().await {
                debug!(call = %call, recipient = %to.user_id, "sending signaling message");
                if let Err(err) = transport.send(&to, message).await {
                    error!(call = %call, recipient = %to.user_id, error = %err, "signaling send failed");
                }
            }
        });
        Self {
            sink: MessageSink::new(call_id, tx),
            handle,
        }
    }

    /// Enqueues without waiting; a full bus drops the message.
    pub fn send(&self, to: Recipient, message: OutboundMessage) {
        if let Err(err) = self.sink.try_send((to, message)) {
            SFU_SIGNALING_DROPPED_TOTAL.inc();
            error!(error = %err, "dropping outbound signaling message");
        }
    }

    /// Seals the queue and lets the worker drain what was already accepted.
    pub async fn stop(self) {
        self.sink.seal();
        drop(self.sink);
        let _ = self.handle.await;
    }
}
