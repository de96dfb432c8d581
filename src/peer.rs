//! Wraps one participant's peer connection: translates WebRTC callbacks
//! into typed events on the peer→conference sink and exposes the
//! subscribe/publish/keyframe/data-channel operations the conference uses.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, error, info, trace, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::errors::SfuError;
use crate::heartbeat::PingSender;
use crate::id_types::{ParticipantId, TrackId};
use crate::media;
use crate::metrics::SFU_PACKETS_FORWARDED_TOTAL;
use crate::publisher::RemoteTrackSource;
use crate::signaling::HangupReason;
use crate::simulcast::SimulcastLayer;
use crate::sink::MessageSink;
use crate::subscription::TrackController;
use crate::types::{TrackInfo, TrackKind};
use crate::worker::{Worker, WorkerHandler};

/// Capacity of the peer→conference mailbox. Media-adjacent events use the
/// blocking sender, so this is the backpressure window.
pub const PEER_SINK_CAPACITY: usize = 512;
const DC_WRITE_QUEUE_CAPACITY: usize = 64;
const DC_WRITE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A new remote track the participant started publishing.
pub struct TrackPublished {
    pub info: TrackInfo,
    pub layer: SimulcastLayer,
    pub remote: Arc<dyn RemoteTrackSource>,
    /// For audio: the pre-allocated local output track the adapter relays
    /// into, shared by every subscriber.
    pub audio_output: Option<Arc<TrackLocalStaticRTP>>,
}

/// Typed events the adapter posts on the peer→conference sink. The sink
/// wraps each one with the participant identity.
pub enum PeerEvent {
    JoinedTheCall,
    LeftTheCall(HangupReason),
    NewTrackPublished(TrackPublished),
    PublishedTrackFailed {
        info: TrackInfo,
        layer: SimulcastLayer,
    },
    /// Video only; audio is relayed inside the adapter.
    RtpPacketReceived {
        info: TrackInfo,
        layer: SimulcastLayer,
        packet: Packet,
    },
    NewIceCandidate(RTCIceCandidateInit),
    IceGatheringComplete,
    RenegotiationRequired(RTCSessionDescription),
    DataChannelMessage(String),
    DataChannelAvailable,
}

impl PeerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerEvent::JoinedTheCall => "joined",
            PeerEvent::LeftTheCall(_) => "left",
            PeerEvent::NewTrackPublished(_) => "track_published",
            PeerEvent::PublishedTrackFailed { .. } => "track_failed",
            PeerEvent::RtpPacketReceived { .. } => "rtp",
            PeerEvent::NewIceCandidate(_) => "ice_candidate",
            PeerEvent::IceGatheringComplete => "ice_gathering_complete",
            PeerEvent::RenegotiationRequired(_) => "renegotiation_required",
            PeerEvent::DataChannelMessage(_) => "dc_message",
            PeerEvent::DataChannelAvailable => "dc_available",
        }
    }
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerEvent::{}", self.kind())
    }
}

pub type PeerEventSink = MessageSink<ParticipantId, PeerEvent>;

/// Serializes data-channel writes so they never block the event loop.
struct DcWriter {
    participant: ParticipantId,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl WorkerHandler<String> for DcWriter {
    async fn on_task(&mut self, text: String) {
        if let Err(err) = self.dc.send_text(text).await {
            warn!(participant = %self.participant, error = %err, "data channel write failed");
        }
    }

    async fn on_timeout(&mut self) {}
}

struct PeerShared {
    remote_tracks: DashMap<(TrackId, SimulcastLayer), Arc<TrackRemote>>,
    data_channel: std::sync::Mutex<Option<Arc<RTCDataChannel>>>,
    dc_worker: std::sync::Mutex<Option<Worker<String>>>,
}

pub struct PeerAdapter {
    participant: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    sink: PeerEventSink,
    shared: PeerShared,
    terminated: AtomicBool,
}

impl PeerAdapter {
    /// Builds the peer connection from the client's SDP offer, installs all
    /// callbacks, and returns the adapter together with the answer SDP.
    pub async fn create(
        participant: ParticipantId,
        sink: PeerEventSink,
        offer_sdp: String,
        stun_servers: &[String],
    ) -> Result<(Arc<Self>, String), SfuError> {
        let api = media::create_webrtc_api();
        let pc = Arc::new(api.new_peer_connection(media::rtc_config(stun_servers)).await?);

        let adapter = Arc::new(Self {
            participant,
            pc: pc.clone(),
            sink,
            shared: PeerShared {
                remote_tracks: DashMap::new(),
                data_channel: std::sync::Mutex::new(None),
                dc_worker: std::sync::Mutex::new(None),
            },
            terminated: AtomicBool::new(false),
        });
        adapter.install_handlers();

        let offer = RTCSessionDescription::offer(offer_sdp)?;
        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        let answer_sdp = pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or_default();

        info!(participant = %adapter.participant, "peer connection created");
        Ok((adapter, answer_sdp))
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// The remote-track handle currently registered for `(track, layer)`.
    pub fn remote_track(&self, track_id: &TrackId, layer: SimulcastLayer) -> Option<Arc<TrackRemote>> {
        self.shared
            .remote_tracks
            .get(&(track_id.clone(), layer))
            .map(|entry| entry.value().clone())
    }

    /// Applies a renegotiation offer from the client and returns the answer.
    pub async fn process_offer(&self, offer_sdp: String) -> Result<String, SfuError> {
        let offer = RTCSessionDescription::offer(offer_sdp)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        Ok(self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or_default())
    }

    /// Applies the client's answer to an offer the SFU sent.
    pub async fn process_answer(&self, answer_sdp: String) -> Result<(), SfuError> {
        let answer = RTCSessionDescription::answer(answer_sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    pub async fn process_remote_candidates(&self, candidates: Vec<RTCIceCandidateInit>) {
        for candidate in candidates {
            // The empty candidate is the end-of-candidates sentinel.
            if candidate.candidate.is_empty() {
                debug!(participant = %self.participant, "end of remote candidates");
                continue;
            }
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                error!(participant = %self.participant, error = %err, "failed to add ICE candidate");
            }
        }
    }

    /// Enqueues a text frame for the data-channel write worker. `NotReady`
    /// until the channel opens (and again after it closes); enqueue success
    /// does not guarantee delivery.
    pub fn send_over_data_channel(&self, text: String) -> Result<(), SfuError> {
        {
            let dc = self.shared.data_channel.lock().unwrap();
            match dc.as_ref() {
                Some(dc) if dc.ready_state() == RTCDataChannelState::Open => {}
                _ => return Err(SfuError::NotReady),
            }
        }
        let worker = self.shared.dc_worker.lock().unwrap();
        let Some(worker) = worker.as_ref() else {
            return Err(SfuError::NotReady);
        };
        if let Err(err) = worker.send(text) {
            warn!(participant = %self.participant, error = %err, "dropping data channel message");
        }
        Ok(())
    }

    /// Closes the connection, seals the event sink and stops the write
    /// worker. Idempotent.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sink.seal();
        if let Some(worker) = self.shared.dc_worker.lock().unwrap().take() {
            worker.stop();
        }
        if let Err(err) = self.pc.close().await {
            warn!(participant = %self.participant, error = %err, "error closing peer connection");
        }
        info!(participant = %self.participant, "peer terminated");
    }

    fn install_handlers(self: &Arc<Self>) {
        let adapter = self.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let adapter = adapter.clone();
                Box::pin(async move {
                    adapter.handle_new_remote_track(track).await;
                })
            },
        ));

        let adapter = self.clone();
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let adapter = adapter.clone();
            Box::pin(async move {
                adapter.register_data_channel(dc);
            })
        }));

        let adapter = self.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let adapter = adapter.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => adapter.emit(PeerEvent::NewIceCandidate(init)).await,
                        Err(err) => {
                            error!(participant = %adapter.participant, error = %err, "ICE candidate serialization failed")
                        }
                    },
                    None => adapter.emit(PeerEvent::IceGatheringComplete).await,
                }
            })
        }));

        let adapter = self.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let adapter = adapter.clone();
            Box::pin(async move {
                adapter.renegotiate().await;
            })
        }));

        let participant = self.participant.clone();
        self.pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!(participant = %participant, state = %state, "ICE connection state changed");
            Box::pin(async {})
        }));

        let participant = self.participant.clone();
        self.pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            trace!(participant = %participant, state = %state, "signaling state changed");
            Box::pin(async {})
        }));

        let adapter = self.clone();
        self.pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let adapter = adapter.clone();
            Box::pin(async move {
                info!(participant = %adapter.participant, state = %state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => {
                        adapter.emit(PeerEvent::JoinedTheCall).await;
                    }
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        adapter
                            .emit(PeerEvent::LeftTheCall(HangupReason::UserHangup))
                            .await;
                    }
                    _ => {}
                }
            })
        }));
    }

    /// Creates a follow-up offer and hands it to the conference for
    /// out-of-band (data channel) renegotiation.
    async fn renegotiate(&self) {
        let offer = match self.pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(err) => {
                error!(participant = %self.participant, error = %err, "failed to create renegotiation offer");
                return;
            }
        };
        if let Err(err) = self.pc.set_local_description(offer.clone()).await {
            error!(participant = %self.participant, error = %err, "failed to set renegotiation offer");
            return;
        }
        self.emit(PeerEvent::RenegotiationRequired(offer)).await;
    }

    async fn handle_new_remote_track(self: &Arc<Self>, track: Arc<TrackRemote>) {
        let Some(kind) = TrackKind::from_codec_type(track.kind()) else {
            warn!(participant = %self.participant, "remote track with unspecified kind, ignoring");
            return;
        };
        let info = TrackInfo {
            id: TrackId::from(track.id()),
            stream_id: crate::id_types::StreamId::from(track.stream_id()),
            kind,
            codec: Arc::new(track.codec().capability.clone()),
        };
        let layer = match kind {
            TrackKind::Audio => SimulcastLayer::None,
            TrackKind::Video => SimulcastLayer::from_rid(&track.rid()),
        };
        info!(
            participant = %self.participant,
            track = %info.id,
            kind = %kind,
            layer = %layer,
            "[SFU] received remote track"
        );
        self.shared
            .remote_tracks
            .insert((info.id.clone(), layer), track.clone());

        match kind {
            TrackKind::Audio => {
                let output = Arc::new(TrackLocalStaticRTP::new(
                    track.codec().capability.clone(),
                    track.id(),
                    track.stream_id(),
                ));
                self.emit(PeerEvent::NewTrackPublished(TrackPublished {
                    info: info.clone(),
                    layer,
                    remote: track.clone() as Arc<dyn RemoteTrackSource>,
                    audio_output: Some(output.clone()),
                }))
                .await;
                self.clone().relay_audio(track, output, info, layer);
            }
            TrackKind::Video => {
                self.emit(PeerEvent::NewTrackPublished(TrackPublished {
                    info: info.clone(),
                    layer,
                    remote: track.clone() as Arc<dyn RemoteTrackSource>,
                    audio_output: None,
                }))
                .await;
                self.clone().pump_video(track, info, layer);
            }
        }
    }

    /// Reads audio RTP and writes it straight to the shared output track;
    /// subscribers attach that track, so one write serves all of them.
    fn relay_audio(
        self: Arc<Self>,
        track: Arc<TrackRemote>,
        output: Arc<TrackLocalStaticRTP>,
        info: TrackInfo,
        layer: SimulcastLayer,
    ) {
        tokio::spawn(async move {
            loop {
                match track.read_rtp().await {
                    Ok((packet, _)) => {
                        SFU_PACKETS_FORWARDED_TOTAL
                            .with_label_values(&["audio"])
                            .inc();
                        if let Err(err) = output.write_rtp(&packet).await {
                            trace!(track = %info.id, error = %err, "audio output write failed");
                        }
                    }
                    Err(err) => {
                        let reason = SfuError::from_remote(err);
                        warn!(participant = %self.participant, track = %info.id, reason = %reason, "[SFU] audio track loop finished");
                        break;
                    }
                }
            }
            self.shared.remote_tracks.remove(&(info.id.clone(), layer));
            self.emit(PeerEvent::PublishedTrackFailed { info, layer }).await;
        });
    }

    /// Reads video RTP and posts it on the peer→conference sink with the
    /// blocking sender: a full mailbox is backpressure, not loss.
    fn pump_video(self: Arc<Self>, track: Arc<TrackRemote>, info: TrackInfo, layer: SimulcastLayer) {
        tokio::spawn(async move {
            let mut packet_count: u64 = 0;
            loop {
                match track.read_rtp().await {
                    Ok((packet, _)) => {
                        packet_count += 1;
                        if packet_count == 1 {
                            debug!(track = %info.id, layer = %layer, "[SFU] first packet received");
                        }
                        let event = PeerEvent::RtpPacketReceived {
                            info: info.clone(),
                            layer,
                            packet,
                        };
                        if self.sink.send(event).await.is_err() {
                            // Sink sealed: the conference is done with us.
                            return;
                        }
                    }
                    Err(err) => {
                        let reason = SfuError::from_remote(err);
                        warn!(participant = %self.participant, track = %info.id, layer = %layer, reason = %reason, "[SFU] video track loop finished");
                        break;
                    }
                }
            }
            self.shared.remote_tracks.remove(&(info.id.clone(), layer));
            self.emit(PeerEvent::PublishedTrackFailed { info, layer }).await;
        });
    }

    fn register_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        info!(participant = %self.participant, label = %dc.label(), "data channel announced");
        *self.shared.data_channel.lock().unwrap() = Some(dc.clone());

        let adapter = self.clone();
        let dc_for_open = dc.clone();
        dc.on_open(Box::new(move || {
            let adapter = adapter.clone();
            let dc = dc_for_open.clone();
            Box::pin(async move {
                let writer = Worker::spawn(
                    DC_WRITE_QUEUE_CAPACITY,
                    DC_WRITE_IDLE_TIMEOUT,
                    DcWriter {
                        participant: adapter.participant.clone(),
                        dc,
                    },
                );
                *adapter.shared.dc_worker.lock().unwrap() = Some(writer);
                adapter.emit(PeerEvent::DataChannelAvailable).await;
            })
        }));

        let adapter = self.clone();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let adapter = adapter.clone();
            Box::pin(async move {
                if !message.is_string {
                    debug!(participant = %adapter.participant, "ignoring binary data channel frame");
                    return;
                }
                match String::from_utf8(message.data.to_vec()) {
                    Ok(text) => adapter.emit(PeerEvent::DataChannelMessage(text)).await,
                    Err(err) => {
                        warn!(participant = %adapter.participant, error = %err, "invalid UTF-8 on data channel")
                    }
                }
            })
        }));

        let adapter = self.clone();
        dc.on_close(Box::new(move || {
            let adapter = adapter.clone();
            Box::pin(async move {
                info!(participant = %adapter.participant, "data channel closed");
                if let Some(worker) = adapter.shared.dc_worker.lock().unwrap().take() {
                    worker.stop();
                }
            })
        }));
    }

    async fn emit(&self, event: PeerEvent) {
        let kind = event.kind();
        if self.sink.send(event).await.is_err() {
            debug!(participant = %self.participant, event = kind, "event dropped, sink sealed");
        }
    }
}

#[async_trait]
impl TrackController for PeerAdapter {
    async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Arc<RTCRtpSender>, SfuError> {
        Ok(self.pc.add_track(track).await?)
    }

    async fn remove_track(&self, sender: &Arc<RTCRtpSender>) -> Result<(), SfuError> {
        Ok(self.pc.remove_track(sender).await?)
    }

    async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), SfuError> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        self.pc.write_rtcp(&[Box::new(pli)]).await?;
        Ok(())
    }
}

#[async_trait]
impl PingSender for PeerAdapter {
    async fn send_ping(&self) -> Result<(), SfuError> {
        self.send_over_data_channel(crate::datachannel::DataChannelEvent::Ping.to_json())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds a real client-side offer so `create` has valid SDP to chew on.
    pub async fn client_offer() -> (webrtc::peer_connection::RTCPeerConnection, String) {
        let api = media::create_webrtc_api();
        let pc = api.new_peer_connection(Default::default()).await.unwrap();
        let _dc = pc.create_data_channel("datachannel", None).await.unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        let mut gather = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await.unwrap();
        let _ = gather.recv().await;
        let sdp = pc.local_description().await.unwrap().sdp;
        (pc, sdp)
    }

    /// An adapter answering a throwaway client offer; never connected.
    pub async fn offline_adapter(participant: ParticipantId, sink: PeerEventSink) -> Arc<PeerAdapter> {
        let (_client, offer_sdp) = client_offer().await;
        let (adapter, _answer) = PeerAdapter::create(participant, sink, offer_sdp, &[])
            .await
            .expect("offline adapter");
        adapter
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::client_offer;
    use super::*;
    use crate::id_types::{CallId, DeviceId, UserId};
    use crate::sink;

    fn participant(name: &str) -> ParticipantId {
        ParticipantId::new(
            UserId::from(name),
            DeviceId::from("DEV"),
            CallId::from("call"),
        )
    }

    #[tokio::test]
    async fn test_create_produces_answer() {
        let (_client, offer_sdp) = client_offer().await;
        let (tx, _rx) = sink::channel(PEER_SINK_CAPACITY);
        let sink = MessageSink::new(participant("@a:x"), tx);
        let (adapter, answer) =
            PeerAdapter::create(participant("@a:x"), sink, offer_sdp, &[]).await.unwrap();
        assert!(answer.contains("v=0"));
        adapter.terminate().await;
        // Idempotent.
        adapter.terminate().await;
    }

    #[tokio::test]
    async fn test_data_channel_before_open_is_not_ready() {
        let (_client, offer_sdp) = client_offer().await;
        let (tx, _rx) = sink::channel(PEER_SINK_CAPACITY);
        let sink = MessageSink::new(participant("@a:x"), tx);
        let (adapter, _answer) =
            PeerAdapter::create(participant("@a:x"), sink, offer_sdp, &[]).await.unwrap();
        assert!(matches!(
            adapter.send_over_data_channel("hello".to_string()),
            Err(SfuError::NotReady)
        ));
        adapter.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_seals_event_sink() {
        let (_client, offer_sdp) = client_offer().await;
        let (tx, mut rx) = sink::channel(PEER_SINK_CAPACITY);
        let sink = MessageSink::new(participant("@a:x"), tx);
        let (adapter, _answer) =
            PeerAdapter::create(participant("@a:x"), sink.clone(), offer_sdp, &[]).await.unwrap();
        adapter.terminate().await;
        assert!(sink.is_sealed());
        // Whatever was emitted before the seal is still drainable.
        let _ = rx.close();
    }
}
