//! The per-conference event loop: the only writer to the participant
//! tracker and the stream-metadata map. Runs until the last participant
//! leaves, then hands unprocessed bus messages back to the router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::datachannel::{
    DataChannelEvent, Description, DescriptionKind, MetadataChanged, Negotiate, StreamMetadataMap,
    TrackSubscription,
};
use crate::errors::SfuError;
use crate::heartbeat::Heartbeat;
use crate::id_types::{CallId, ParticipantId, SessionId};
use crate::metrics::{SFU_ACTIVE_CONFERENCES, SFU_ACTIVE_PARTICIPANTS};
use crate::peer::{PeerAdapter, PeerEvent, TrackPublished, PEER_SINK_CAPACITY};
use crate::published_track::PublishedMetadata;
use crate::signaling::{
    HangupReason, InviteContent, OutboundMessage, Recipient, SignalingEnvelope, SignalingEvent,
    SignalingTransport, SignalingWorker,
};
use crate::sink::{self, MessageSink, SendError};
use crate::tracker::{Participant, ParticipantTracker};
use crate::types::TrackKind;

const EXTERNAL_QUEUE_CAPACITY: usize = 128;

/// The slice of configuration a conference needs.
#[derive(Debug, Clone)]
pub struct ConferenceParams {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub stun_servers: Vec<String>,
}

impl ConferenceParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.conference.heartbeat.interval(),
            heartbeat_timeout: config.conference.heartbeat.timeout(),
            stun_servers: config.webrtc.stun_servers.clone(),
        }
    }
}

/// Posted to the router when the loop exits, carrying whatever was still
/// queued on the external receiver for re-dispatch.
pub struct ConferenceEnded {
    pub call_id: CallId,
    pub unprocessed: Vec<SignalingEnvelope>,
}

/// The router's handle to one running conference.
pub struct ConferenceHandle {
    sink: MessageSink<CallId, SignalingEnvelope>,
}

impl ConferenceHandle {
    /// Forwards one bus event into the conference, waiting under
    /// backpressure. Fails once the conference ended.
    pub async fn deliver(
        &self,
        envelope: SignalingEnvelope,
    ) -> Result<(), SendError<SignalingEnvelope>> {
        self.sink.send(envelope).await
    }
}

/// Starts a conference loop. It expects the triggering `call-invite` as its
/// first delivered message and ends once the participant count drops back
/// to zero, posting a [`ConferenceEnded`] on `ended_tx`.
pub fn spawn(
    call_id: CallId,
    session_id: SessionId,
    params: ConferenceParams,
    transport: Arc<dyn SignalingTransport>,
    ended_tx: mpsc::Sender<ConferenceEnded>,
) -> ConferenceHandle {
    let (external_tx, external_rx) = sink::channel(EXTERNAL_QUEUE_CAPACITY);
    let (peer_tx, peer_rx) = mpsc::channel(PEER_SINK_CAPACITY);

    let handle = ConferenceHandle {
        sink: MessageSink::new(call_id.clone(), external_tx),
    };

    let conference = Conference {
        call_id: call_id.clone(),
        session_id,
        params,
        tracker: ParticipantTracker::new(),
        metadata: HashMap::new(),
        peer_tx,
        signaling: SignalingWorker::start(call_id, transport),
    };
    tokio::spawn(conference.run(external_rx, peer_rx, ended_tx));

    handle
}

struct Conference {
    call_id: CallId,
    /// The session identity this SFU owns for the call; events addressed to
    /// another session are not ours to act on.
    session_id: SessionId,
    params: ConferenceParams,
    tracker: ParticipantTracker,
    /// Stream metadata per advertising participant.
    metadata: HashMap<ParticipantId, StreamMetadataMap>,
    peer_tx: mpsc::Sender<(ParticipantId, PeerEvent)>,
    signaling: SignalingWorker,
}

impl Conference {
    async fn run(
        mut self,
        mut external_rx: sink::SinkReceiver<CallId, SignalingEnvelope>,
        mut peer_rx: mpsc::Receiver<(ParticipantId, PeerEvent)>,
        ended_tx: mpsc::Sender<ConferenceEnded>,
    ) {
        SFU_ACTIVE_CONFERENCES.inc();
        info!(call = %self.call_id, session = %self.session_id, "conference started");

        let mut admitted_anyone = false;
        loop {
            tokio::select! {
                envelope = external_rx.recv() => match envelope {
                    Some((_, envelope)) => {
                        let was_invite = matches!(envelope.event, SignalingEvent::Invite(_));
                        self.handle_signaling(envelope).await;
                        admitted_anyone |= was_invite;
                    }
                    // The router dropped us.
                    None => break,
                },
                event = peer_rx.recv() => {
                    if let Some((participant, event)) = event {
                        self.handle_peer_event(participant, event).await;
                    }
                }
            }
            if admitted_anyone && self.tracker.is_empty() {
                break;
            }
        }

        let unprocessed: Vec<SignalingEnvelope> = external_rx
            .close()
            .into_iter()
            .map(|(_, envelope)| envelope)
            .collect();
        self.signaling.stop().await;
        SFU_ACTIVE_CONFERENCES.dec();
        info!(call = %self.call_id, leftover = unprocessed.len(), "conference ended");
        let _ = ended_tx
            .send(ConferenceEnded {
                call_id: self.call_id.clone(),
                unprocessed,
            })
            .await;
    }

    async fn handle_signaling(&mut self, envelope: SignalingEnvelope) {
        if let Some(dest) = &envelope.dest_session_id {
            if *dest != self.session_id {
                debug!(call = %self.call_id, dest = %dest, "event for another session, ignoring");
                return;
            }
        }
        let participant = ParticipantId::new(
            envelope.user_id,
            envelope.device_id,
            self.call_id.clone(),
        );
        match envelope.event {
            SignalingEvent::Invite(invite) => {
                self.admit(participant, envelope.sender_session_id, invite)
                    .await;
            }
            SignalingEvent::Candidates(content) => {
                let Some(entry) = self.tracker.participant(&participant) else {
                    debug!(participant = %participant, "candidates for unknown participant");
                    return;
                };
                if entry.remote_session_id != envelope.sender_session_id {
                    debug!(participant = %participant, "candidates from a stale session, ignoring");
                    return;
                }
                entry.peer.process_remote_candidates(content.candidates).await;
            }
            SignalingEvent::SelectAnswer(content) => {
                if content.selected_party_id != self.session_id.as_ref() {
                    info!(participant = %participant, selected = %content.selected_party_id, "answered elsewhere");
                    self.remove_participant(&participant, Some(HangupReason::AnsweredElsewhere))
                        .await;
                }
            }
            SignalingEvent::Hangup(content) => {
                let active_session = self
                    .tracker
                    .participant(&participant)
                    .map(|p| p.remote_session_id.clone());
                if active_session.is_some_and(|s| s != envelope.sender_session_id) {
                    debug!(participant = %participant, "hangup from a stale session, ignoring");
                    return;
                }
                info!(participant = %participant, reason = ?content.reason, "hangup received");
                self.remove_participant(&participant, None).await;
            }
        }
    }

    /// Admits (or replaces) a participant from a call-invite.
    async fn admit(
        &mut self,
        participant: ParticipantId,
        remote_session_id: SessionId,
        invite: InviteContent,
    ) {
        if let Some(existing) = self.tracker.participant(&participant) {
            if existing.remote_session_id == remote_session_id {
                warn!(participant = %participant, "already in the call with this session, ignoring invite");
                return;
            }
            info!(participant = %participant, "new session for an active participant, replacing");
            self.remove_participant(&participant, None).await;
        }

        let sink = MessageSink::new(participant.clone(), self.peer_tx.clone());
        let (peer, answer_sdp) = match PeerAdapter::create(
            participant.clone(),
            sink.clone(),
            invite.offer.sdp,
            &self.params.stun_servers,
        )
        .await
        {
            Ok(created) => created,
            Err(err) => {
                error!(participant = %participant, error = %err, "admission failed");
                return;
            }
        };

        let heartbeat = Heartbeat::start(
            participant.clone(),
            self.params.heartbeat_interval,
            self.params.heartbeat_timeout,
            peer.clone(),
            sink,
        );
        self.tracker.insert_participant(Participant {
            id: participant.clone(),
            remote_session_id: remote_session_id.clone(),
            peer,
            heartbeat,
        });
        SFU_ACTIVE_PARTICIPANTS.inc();
        self.metadata.insert(participant.clone(), invite.metadata);
        self.apply_metadata(&participant);

        let answer = OutboundMessage::Answer {
            answer: Description {
                kind: DescriptionKind::Answer,
                sdp: answer_sdp,
            },
            metadata: self.metadata_for(&participant),
        };
        self.signaling
            .send(self.recipient(&participant, &remote_session_id), answer);
        self.broadcast_metadata(Some(&participant));
        info!(participant = %participant, "participant admitted");
    }

    async fn handle_peer_event(&mut self, participant: ParticipantId, event: PeerEvent) {
        match event {
            PeerEvent::JoinedTheCall => {
                info!(participant = %participant, "joined the call");
            }
            PeerEvent::LeftTheCall(reason) => {
                self.remove_participant(&participant, Some(reason)).await;
            }
            PeerEvent::NewTrackPublished(published) => {
                self.handle_track_published(&participant, published);
            }
            PeerEvent::PublishedTrackFailed { info, layer } => {
                warn!(participant = %participant, track = %info.id, layer = %layer, "published track failed");
                self.tracker.remove_published_track(&info.id, layer).await;
                self.broadcast_metadata(Some(&participant));
            }
            PeerEvent::RtpPacketReceived {
                info,
                layer,
                packet,
            } => {
                self.tracker.process_rtp(&info.id, layer, packet);
            }
            PeerEvent::NewIceCandidate(candidate) => {
                if let Some(entry) = self.tracker.participant(&participant) {
                    let recipient = self.recipient(&participant, &entry.remote_session_id);
                    self.signaling.send(
                        recipient,
                        OutboundMessage::Candidates {
                            candidates: vec![candidate],
                        },
                    );
                }
            }
            PeerEvent::IceGatheringComplete => {
                if let Some(entry) = self.tracker.participant(&participant) {
                    let recipient = self.recipient(&participant, &entry.remote_session_id);
                    self.signaling
                        .send(recipient, OutboundMessage::CandidatesGatheringFinished);
                }
            }
            PeerEvent::RenegotiationRequired(offer) => {
                let negotiate = DataChannelEvent::Negotiate(Negotiate {
                    description: Description {
                        kind: DescriptionKind::Offer,
                        sdp: offer.sdp,
                    },
                    metadata: self.metadata_for(&participant),
                });
                self.send_dc(&participant, negotiate);
            }
            PeerEvent::DataChannelMessage(text) => {
                self.handle_dc_message(participant, text).await;
            }
            PeerEvent::DataChannelAvailable => {
                debug!(participant = %participant, "data channel available");
                // Late joiners get the current view as soon as they can
                // receive it.
                let update = DataChannelEvent::MetadataChanged(MetadataChanged {
                    metadata: self.metadata_for(&participant),
                });
                self.send_dc(&participant, update);
            }
        }
    }

    fn handle_track_published(&mut self, participant: &ParticipantId, published: TrackPublished) {
        let track_id = published.info.id.clone();
        if let Err(err) = self.tracker.add_published_track(participant, published) {
            error!(participant = %participant, track = %track_id, error = %err, "rejecting published track");
            return;
        }
        // Geometry and mute flags may already have been advertised.
        self.apply_metadata(participant);
        self.broadcast_metadata(Some(participant));
    }

    async fn handle_dc_message(&mut self, participant: ParticipantId, text: String) {
        let event = match DataChannelEvent::from_json(&text) {
            Ok(event) => event,
            Err(err) => {
                warn!(participant = %participant, error = %err, "dropping malformed data channel message");
                return;
            }
        };
        match event {
            DataChannelEvent::TrackSubscription(request) => {
                self.handle_track_subscription(&participant, request).await;
            }
            DataChannelEvent::Negotiate(negotiate) => {
                self.handle_negotiate(&participant, negotiate).await;
            }
            DataChannelEvent::Ping => {
                self.send_dc(&participant, DataChannelEvent::Pong);
            }
            DataChannelEvent::Pong => {
                if let Some(entry) = self.tracker.participant(&participant) {
                    entry.heartbeat.pong_received();
                }
            }
            DataChannelEvent::MetadataChanged(update) => {
                self.metadata.insert(participant.clone(), update.metadata);
                self.apply_metadata(&participant);
                self.broadcast_metadata(Some(&participant));
            }
        }
    }

    async fn handle_track_subscription(
        &mut self,
        participant: &ParticipantId,
        request: TrackSubscription,
    ) {
        for unsubscribe in request.unsubscribe {
            if let Some(track) = self.tracker.published_track(&unsubscribe.track_id) {
                if let Err(err) = track.unsubscribe(participant).await {
                    warn!(participant = %participant, track = %unsubscribe.track_id, error = %err, "unsubscribe failed");
                }
            }
        }
        for subscribe in request.subscribe {
            let Some(track) = self.tracker.published_track(&subscribe.track_id).cloned() else {
                warn!(participant = %participant, track = %subscribe.track_id, "subscription to unknown track");
                continue;
            };
            if track.owner() == participant {
                warn!(participant = %participant, track = %subscribe.track_id, "participant tried to subscribe to its own track");
                continue;
            }
            let Some(entry) = self.tracker.participant(participant) else {
                return;
            };
            let controller = entry.peer.clone();
            if let Err(err) = track
                .subscribe(
                    participant.clone(),
                    controller,
                    subscribe.width,
                    subscribe.height,
                )
                .await
            {
                warn!(participant = %participant, track = %subscribe.track_id, error = %err, "subscribe failed");
            }
        }
    }

    async fn handle_negotiate(&mut self, participant: &ParticipantId, negotiate: Negotiate) {
        let Some(entry) = self.tracker.participant(participant) else {
            return;
        };
        let peer = entry.peer.clone();
        if !negotiate.metadata.is_empty() {
            self.metadata
                .insert(participant.clone(), negotiate.metadata);
            self.apply_metadata(participant);
        }
        match negotiate.description.kind {
            DescriptionKind::Offer => match peer.process_offer(negotiate.description.sdp).await {
                Ok(answer_sdp) => {
                    let response = DataChannelEvent::Negotiate(Negotiate {
                        description: Description {
                            kind: DescriptionKind::Answer,
                            sdp: answer_sdp,
                        },
                        metadata: self.metadata_for(participant),
                    });
                    self.send_dc(participant, response);
                }
                Err(err) => {
                    error!(participant = %participant, error = %err, "renegotiation offer failed");
                }
            },
            DescriptionKind::Answer => {
                if let Err(err) = peer.process_answer(negotiate.description.sdp).await {
                    error!(participant = %participant, error = %err, "renegotiation answer failed");
                }
            }
        }
    }

    async fn remove_participant(
        &mut self,
        participant: &ParticipantId,
        hangup: Option<HangupReason>,
    ) {
        let Some(removed) = self.tracker.remove_participant(participant).await else {
            return;
        };
        SFU_ACTIVE_PARTICIPANTS.dec();
        self.metadata.remove(participant);
        if let Some(reason) = hangup {
            let recipient = self.recipient(participant, &removed.remote_session_id);
            self.signaling
                .send(recipient, OutboundMessage::Hangup { reason });
        }
        self.broadcast_metadata(None);
    }

    /// Pushes stream metadata a participant advertised into the matching
    /// published tracks (geometry for layer selection, mute mirroring).
    fn apply_metadata(&mut self, participant: &ParticipantId) {
        let Some(streams) = self.metadata.get(participant) else {
            return;
        };
        for (stream_id, stream) in streams {
            for (track_id, entry) in &stream.tracks {
                let Some(track) = self.tracker.published_track(track_id) else {
                    continue;
                };
                if track.owner() != participant || track.info().stream_id != *stream_id {
                    continue;
                }
                let muted = match track.kind() {
                    TrackKind::Audio => stream.audio_muted,
                    TrackKind::Video => stream.video_muted,
                };
                track.set_metadata(PublishedMetadata {
                    muted,
                    max_width: entry.width.unwrap_or(0),
                    max_height: entry.height.unwrap_or(0),
                });
            }
        }
    }

    /// Everyone else's streams, merged, as advertised to `target`.
    fn metadata_for(&self, target: &ParticipantId) -> StreamMetadataMap {
        let mut merged = StreamMetadataMap::new();
        for (other, streams) in &self.metadata {
            if other == target {
                continue;
            }
            for (stream_id, stream) in streams {
                merged.insert(stream_id.clone(), stream.clone());
            }
        }
        merged
    }

    /// Sends every participant (minus `exclude`) its current view of the
    /// available streams over the data channel.
    fn broadcast_metadata(&self, exclude: Option<&ParticipantId>) {
        let targets: Vec<ParticipantId> = self
            .tracker
            .participants()
            .map(|p| p.id.clone())
            .filter(|id| Some(id) != exclude)
            .collect();
        for target in targets {
            let update = DataChannelEvent::MetadataChanged(MetadataChanged {
                metadata: self.metadata_for(&target),
            });
            self.send_dc(&target, update);
        }
    }

    fn send_dc(&self, participant: &ParticipantId, event: DataChannelEvent) {
        let Some(entry) = self.tracker.participant(participant) else {
            return;
        };
        match entry.peer.send_over_data_channel(event.to_json()) {
            Ok(()) => {}
            Err(SfuError::NotReady) => {
                debug!(participant = %participant, "data channel not ready, message dropped");
            }
            Err(err) => {
                warn!(participant = %participant, error = %err, "data channel send failed");
            }
        }
    }

    fn recipient(&self, participant: &ParticipantId, session: &SessionId) -> Recipient {
        Recipient {
            user_id: participant.user_id.clone(),
            device_id: participant.device_id.clone(),
            call_id: self.call_id.clone(),
            session_id: session.clone(),
        }
    }
}
