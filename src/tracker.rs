//! Single-writer registry of participants and published tracks. Owned and
//! mutated exclusively by the conference loop, so no locking here; the
//! fine-grained mutation inside a published track has its own mutex.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};
use webrtc::rtp::packet::Packet;

use crate::errors::SfuError;
use crate::heartbeat::Heartbeat;
use crate::id_types::{ParticipantId, SessionId, TrackId};
use crate::peer::{PeerAdapter, TrackPublished};
use crate::published_track::PublishedTrack;
use crate::simulcast::SimulcastLayer;

pub struct Participant {
    pub id: ParticipantId,
    /// Session id of the remote client instance, used to address signaling
    /// back at exactly that instance.
    pub remote_session_id: SessionId,
    pub peer: Arc<PeerAdapter>,
    pub heartbeat: Heartbeat,
}

#[derive(Default)]
pub struct ParticipantTracker {
    participants: HashMap<ParticipantId, Participant>,
    published: HashMap<TrackId, Arc<PublishedTrack>>,
}

impl ParticipantTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_participant(&mut self, participant: Participant) {
        self.participants.insert(participant.id.clone(), participant);
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn published_track(&self, track_id: &TrackId) -> Option<&Arc<PublishedTrack>> {
        self.published.get(track_id)
    }

    pub fn published_tracks(&self) -> impl Iterator<Item = &Arc<PublishedTrack>> {
        self.published.values()
    }

    /// Removes a participant along with everything referencing it: its own
    /// published tracks (dropping their subscribers), and its subscriptions
    /// on everyone else's tracks.
    pub async fn remove_participant(&mut self, id: &ParticipantId) -> Option<Participant> {
        let participant = self.participants.remove(id)?;
        participant.heartbeat.stop();

        let owned: Vec<TrackId> = self
            .published
            .values()
            .filter(|t| t.owner() == id)
            .map(|t| t.info().id.clone())
            .collect();
        for track_id in owned {
            if let Some(track) = self.published.remove(&track_id) {
                self.teardown_track(track).await;
            }
        }

        for track in self.published.values() {
            if let Err(err) = track.unsubscribe(id).await {
                warn!(participant = %id, track = %track.info().id, error = %err, "unsubscribe during removal failed");
            }
        }

        participant.peer.terminate().await;
        info!(participant = %id, "participant removed");
        Some(participant)
    }

    /// Registers a layer a participant started publishing: creates the
    /// published track on its first layer, extends it afterwards.
    pub fn add_published_track(
        &mut self,
        owner: &ParticipantId,
        published: TrackPublished,
    ) -> Result<(), SfuError> {
        let Some(participant) = self.participants.get(owner) else {
            return Err(SfuError::NotFound("participant"));
        };

        if let Some(existing) = self.published.get(&published.info.id) {
            if existing.owner() != owner {
                return Err(SfuError::Mismatch {
                    id: published.info.id,
                    details: format!(
                        "track already published by {} (publisher claims {})",
                        existing.owner(),
                        owner
                    ),
                });
            }
            return existing.add_publisher(published.remote, published.layer);
        }

        let track = PublishedTrack::new(
            published.info.clone(),
            owner.clone(),
            participant.peer.clone(),
            published.audio_output,
        );
        track.add_publisher(published.remote, published.layer)?;
        debug!(track = %published.info.id, owner = %owner, "published track created");
        self.published.insert(published.info.id, track);
        Ok(())
    }

    /// Drops one layer of a published track; the whole track goes away with
    /// its last layer.
    pub async fn remove_published_track(&mut self, track_id: &TrackId, layer: SimulcastLayer) {
        let Some(track) = self.published.get(track_id).cloned() else {
            return;
        };
        let remaining = track.remove_publisher(layer).await;
        if remaining == 0 {
            info!(track = %track_id, "last layer gone, dropping published track");
            self.published.remove(track_id);
            self.teardown_track(track).await;
        }
    }

    /// Routes one received RTP packet to the right publisher.
    pub fn process_rtp(&self, track_id: &TrackId, layer: SimulcastLayer, packet: Packet) {
        match self.published.get(track_id) {
            Some(track) => track.process_rtp(layer, packet),
            None => trace!(track = %track_id, "packet for unknown track"),
        }
    }

    async fn teardown_track(&self, track: Arc<PublishedTrack>) {
        for subscriber in track.subscriber_ids() {
            if let Err(err) = track.unsubscribe(&subscriber).await {
                warn!(track = %track.info().id, subscriber = %subscriber, error = %err, "unsubscribe during teardown failed");
            }
        }
        track.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::PingSender;
    use crate::id_types::{CallId, DeviceId, StreamId, UserId};
    use crate::publisher::test_support::MockRemoteTrack;
    use crate::simulcast::SimulcastLayer;
    use crate::sink::{self, MessageSink};
    use crate::types::{TrackInfo, TrackKind};
    use async_trait::async_trait;
    use std::time::Duration;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    struct NoopPinger;

    #[async_trait]
    impl PingSender for NoopPinger {
        async fn send_ping(&self) -> Result<(), crate::errors::SfuError> {
            Ok(())
        }
    }

    fn participant_id(name: &str) -> ParticipantId {
        ParticipantId::new(
            UserId::from(name),
            DeviceId::from("DEV"),
            CallId::from("call"),
        )
    }

    async fn make_participant(name: &str) -> Participant {
        let id = participant_id(name);
        let (tx, _rx) = sink::channel(64);
        let sink = MessageSink::new(id.clone(), tx);
        let peer = crate::peer::test_support::offline_adapter(id.clone(), sink.clone()).await;
        let heartbeat = Heartbeat::start(
            id.clone(),
            Duration::from_secs(5),
            Duration::from_secs(30),
            Arc::new(NoopPinger),
            sink,
        );
        Participant {
            id,
            remote_session_id: SessionId::from(format!("session-{name}")),
            peer,
            heartbeat,
        }
    }

    fn video_published(track_id: &str, rid: &str, layer: SimulcastLayer) -> TrackPublished {
        TrackPublished {
            info: TrackInfo {
                id: TrackId::from(track_id),
                stream_id: StreamId::from("s1"),
                kind: TrackKind::Video,
                codec: Arc::new(RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                }),
            },
            layer,
            remote: MockRemoteTrack::new(track_id, rid, 1000),
            audio_output: None,
        }
    }

    #[tokio::test]
    async fn test_add_published_track_requires_participant() {
        let mut tracker = ParticipantTracker::new();
        let err = tracker.add_published_track(
            &participant_id("@ghost:x"),
            video_published("t1", "q", SimulcastLayer::Low),
        );
        assert!(matches!(err, Err(SfuError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_layers_aggregate_on_one_track() {
        let mut tracker = ParticipantTracker::new();
        let alice = make_participant("@alice:x").await;
        let alice_id = alice.id.clone();
        tracker.insert_participant(alice);

        tracker
            .add_published_track(&alice_id, video_published("t1", "q", SimulcastLayer::Low))
            .unwrap();
        tracker
            .add_published_track(&alice_id, video_published("t1", "h", SimulcastLayer::Medium))
            .unwrap();

        let track = tracker.published_track(&TrackId::from("t1")).unwrap();
        assert_eq!(
            track.available_layers(),
            vec![SimulcastLayer::Low, SimulcastLayer::Medium]
        );
    }

    #[tokio::test]
    async fn test_foreign_owner_is_rejected() {
        let mut tracker = ParticipantTracker::new();
        let alice = make_participant("@alice:x").await;
        let bob = make_participant("@bob:x").await;
        let alice_id = alice.id.clone();
        let bob_id = bob.id.clone();
        tracker.insert_participant(alice);
        tracker.insert_participant(bob);

        tracker
            .add_published_track(&alice_id, video_published("t1", "q", SimulcastLayer::Low))
            .unwrap();
        let err =
            tracker.add_published_track(&bob_id, video_published("t1", "h", SimulcastLayer::Medium));
        assert!(matches!(err, Err(SfuError::Mismatch { .. })));
    }

    #[tokio::test]
    async fn test_remove_participant_drops_tracks_and_subscriptions() {
        let mut tracker = ParticipantTracker::new();
        let alice = make_participant("@alice:x").await;
        let bob = make_participant("@bob:x").await;
        let alice_id = alice.id.clone();
        let bob_id = bob.id.clone();
        let bob_peer = bob.peer.clone();
        tracker.insert_participant(alice);
        tracker.insert_participant(bob);

        tracker
            .add_published_track(&alice_id, video_published("t1", "q", SimulcastLayer::Low))
            .unwrap();
        let track = tracker.published_track(&TrackId::from("t1")).unwrap().clone();
        track
            .subscribe(bob_id.clone(), bob_peer, 320, 240)
            .await
            .unwrap();
        assert_eq!(track.subscriber_ids(), vec![bob_id.clone()]);

        // Removing the owner takes the track and every subscription on it.
        let removed = tracker.remove_participant(&alice_id).await;
        assert!(removed.is_some());
        assert!(tracker.published_track(&TrackId::from("t1")).is_none());
        assert!(track.subscriber_ids().is_empty());
        assert_eq!(tracker.participant_count(), 1);

        // Removing an unknown participant is a no-op.
        assert!(tracker.remove_participant(&alice_id).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_subscriber_cleans_foreign_tracks() {
        let mut tracker = ParticipantTracker::new();
        let alice = make_participant("@alice:x").await;
        let bob = make_participant("@bob:x").await;
        let alice_id = alice.id.clone();
        let bob_id = bob.id.clone();
        let bob_peer = bob.peer.clone();
        tracker.insert_participant(alice);
        tracker.insert_participant(bob);

        tracker
            .add_published_track(&alice_id, video_published("t1", "q", SimulcastLayer::Low))
            .unwrap();
        let track = tracker.published_track(&TrackId::from("t1")).unwrap().clone();
        track
            .subscribe(bob_id.clone(), bob_peer, 320, 240)
            .await
            .unwrap();

        tracker.remove_participant(&bob_id).await.unwrap();
        // Alice's track survives, bob's subscription does not.
        assert!(tracker.published_track(&TrackId::from("t1")).is_some());
        assert!(track.subscriber_ids().is_empty());
    }

    #[tokio::test]
    async fn test_remove_last_layer_drops_track() {
        let mut tracker = ParticipantTracker::new();
        let alice = make_participant("@alice:x").await;
        let alice_id = alice.id.clone();
        tracker.insert_participant(alice);

        tracker
            .add_published_track(&alice_id, video_published("t1", "q", SimulcastLayer::Low))
            .unwrap();
        tracker
            .add_published_track(&alice_id, video_published("t1", "h", SimulcastLayer::Medium))
            .unwrap();

        tracker
            .remove_published_track(&TrackId::from("t1"), SimulcastLayer::Medium)
            .await;
        assert!(tracker.published_track(&TrackId::from("t1")).is_some());

        tracker
            .remove_published_track(&TrackId::from("t1"), SimulcastLayer::Low)
            .await;
        assert!(tracker.published_track(&TrackId::from("t1")).is_none());
    }
}
