//! One publisher per incoming simulcast layer: fans packets out to the
//! subscriptions currently homed on that layer and watches for stalls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_remote::TrackRemote;

use crate::id_types::{ParticipantId, TrackId};
use crate::metrics::{SFU_PACKETS_DROPPED_TOTAL, SFU_STALLS_TOTAL};
use crate::simulcast::SimulcastLayer;
use crate::subscription::Subscription;
use crate::types::TrackKind;
use crate::worker::{Worker, WorkerHandler};

/// How long a video layer may be silent before it counts as stalled.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(2);
const INBOX_CAPACITY: usize = 64;

/// The slice of a remote track the publisher needs. Mirrors the handle the
/// WebRTC stack hands out, narrow enough to mock in tests.
pub trait RemoteTrackSource: Send + Sync {
    fn id(&self) -> String;
    fn stream_id(&self) -> String;
    fn rid(&self) -> String;
    fn ssrc(&self) -> u32;
    fn codec_capability(&self) -> RTCRtpCodecCapability;
}

impl RemoteTrackSource for TrackRemote {
    fn id(&self) -> String {
        self.id()
    }
    fn stream_id(&self) -> String {
        self.stream_id()
    }
    fn rid(&self) -> String {
        self.rid().to_string()
    }
    fn ssrc(&self) -> u32 {
        self.ssrc()
    }
    fn codec_capability(&self) -> RTCRtpCodecCapability {
        self.codec().capability.clone()
    }
}

/// Emitted on the publisher's status channel; the channel closing means the
/// publisher terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherStatus {
    Stalled,
    Recovered,
}

/// Flips the stalled flag on silence and back on the next packet,
/// reporting each transition exactly once.
struct StallObserver {
    track_id: TrackId,
    layer: SimulcastLayer,
    stalled: Arc<AtomicBool>,
    status_tx: mpsc::Sender<PublisherStatus>,
}

#[async_trait]
impl WorkerHandler<()> for StallObserver {
    async fn on_task(&mut self, _poke: ()) {
        if self.stalled.swap(false, Ordering::AcqRel) {
            debug!(track = %self.track_id, layer = %self.layer, "publisher recovered");
            let _ = self.status_tx.send(PublisherStatus::Recovered).await;
        }
    }

    async fn on_timeout(&mut self) {
        if !self.stalled.swap(true, Ordering::AcqRel) {
            warn!(track = %self.track_id, layer = %self.layer, "publisher stalled");
            SFU_STALLS_TOTAL.with_label_values(&["publisher"]).inc();
            let _ = self.status_tx.send(PublisherStatus::Stalled).await;
        }
    }
}

pub struct Publisher {
    track_id: TrackId,
    layer: SimulcastLayer,
    kind: TrackKind,
    remote: Mutex<Arc<dyn RemoteTrackSource>>,
    subscriptions: Mutex<Vec<Arc<dyn Subscription>>>,
    /// `None` for audio: audio is relayed inside the peer adapter and never
    /// flows through a publisher inbox.
    inbox: Option<mpsc::Sender<Packet>>,
    stalled: Arc<AtomicBool>,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl Publisher {
    /// Creates a video publisher and starts its forward loop and stall
    /// observer. The returned receiver is the status channel; it closes
    /// when the publisher terminates.
    pub fn spawn_video(
        track_id: TrackId,
        layer: SimulcastLayer,
        remote: Arc<dyn RemoteTrackSource>,
    ) -> (Arc<Self>, mpsc::Receiver<PublisherStatus>) {
        let (inbox_tx, mut inbox_rx) = mpsc::channel::<Packet>(INBOX_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(4);
        let stalled = Arc::new(AtomicBool::new(false));

        let publisher = Arc::new(Self {
            track_id: track_id.clone(),
            layer,
            kind: TrackKind::Video,
            remote: Mutex::new(remote),
            subscriptions: Mutex::new(Vec::new()),
            inbox: Some(inbox_tx),
            stalled: stalled.clone(),
            stop: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        });

        let stall_observer = Worker::spawn(
            1,
            STALL_TIMEOUT,
            StallObserver {
                track_id: track_id.clone(),
                layer,
                stalled,
                status_tx,
            },
        );

        let forwarding = publisher.clone();
        tokio::spawn(async move {
            loop {
                if forwarding.stopped.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    _ = forwarding.stop.notified() => {}
                    packet = inbox_rx.recv() => match packet {
                        Some(packet) => {
                            let _ = stall_observer.send(());
                            forwarding.fan_out(&packet);
                        }
                        None => break,
                    },
                }
            }
            // Stopping the observer drops its status sender once it has
            // drained, which closes the status channel: that close is the
            // termination signal the owner watches for.
            stall_observer.stop();
            trace!(track = %forwarding.track_id, layer = %forwarding.layer, "publisher loop finished");
        });

        (publisher, status_rx)
    }

    /// Creates the bookkeeping publisher for an audio track (layer `none`).
    pub fn new_audio(track_id: TrackId, remote: Arc<dyn RemoteTrackSource>) -> Arc<Self> {
        Arc::new(Self {
            track_id,
            layer: SimulcastLayer::None,
            kind: TrackKind::Audio,
            remote: Mutex::new(remote),
            subscriptions: Mutex::new(Vec::new()),
            inbox: None,
            stalled: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn layer(&self) -> SimulcastLayer {
        self.layer
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Hands one packet to the forward loop. Never blocks; a full inbox
    /// absorbs backpressure by dropping the packet.
    pub fn forward(&self, packet: Packet) {
        let Some(inbox) = &self.inbox else {
            return;
        };
        if inbox.try_send(packet).is_err() {
            SFU_PACKETS_DROPPED_TOTAL
                .with_label_values(&["publisher_full"])
                .inc();
        }
    }

    /// Attaches a subscription. Idempotent per subscriber.
    pub fn add_subscription(&self, subscription: Arc<dyn Subscription>) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if subscriptions
            .iter()
            .any(|s| s.subscriber() == subscription.subscriber())
        {
            return;
        }
        subscriptions.push(subscription);
    }

    pub fn remove_subscription(&self, subscriber: &ParticipantId) -> Option<Arc<dyn Subscription>> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let index = subscriptions
            .iter()
            .position(|s| s.subscriber() == subscriber)?;
        Some(subscriptions.swap_remove(index))
    }

    /// Detaches and returns every attached subscription.
    pub fn remove_all(&self) -> Vec<Arc<dyn Subscription>> {
        std::mem::take(&mut *self.subscriptions.lock().unwrap())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Swaps the remote-track handle. The stack presents a fresh remote
    /// track object when the SSRC rotates for the same simulcast layer.
    pub fn replace_track(&self, remote: Arc<dyn RemoteTrackSource>) {
        *self.remote.lock().unwrap() = remote;
    }

    pub fn remote_track(&self) -> Arc<dyn RemoteTrackSource> {
        self.remote.lock().unwrap().clone()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    /// One-shot termination signal. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.stop.notify_waiters();
        }
    }

    fn fan_out(&self, packet: &Packet) {
        // Held only for the duration of the non-blocking writes.
        let subscriptions = self.subscriptions.lock().unwrap();
        for subscription in subscriptions.iter() {
            subscription.write_rtp(packet);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MockRemoteTrack;
    use super::*;
    use crate::subscription::test_support::RecordingSubscription;
    use crate::id_types::{CallId, DeviceId, UserId};

    fn participant(name: &str) -> ParticipantId {
        ParticipantId::new(
            UserId::from(name),
            DeviceId::from("DEV"),
            CallId::from("call"),
        )
    }

    fn packet(seq: u16) -> Packet {
        let mut p = Packet::default();
        p.header.sequence_number = seq;
        p.header.ssrc = 1111;
        p
    }

    #[tokio::test]
    async fn test_forward_reaches_attached_subscriptions() {
        let remote = MockRemoteTrack::new("t1", "q", 1111);
        let (publisher, _status) = Publisher::spawn_video(
            TrackId::from("t1"),
            SimulcastLayer::Low,
            remote,
        );
        let sub = RecordingSubscription::new(participant("@a:x"), SimulcastLayer::Low);
        publisher.add_subscription(sub.clone());
        // Idempotent attach.
        publisher.add_subscription(sub.clone());
        assert_eq!(publisher.subscription_count(), 1);

        publisher.forward(packet(1));
        publisher.forward(packet(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sub.written(), 2);
        publisher.stop();
    }

    #[tokio::test]
    async fn test_remove_subscription_stops_delivery() {
        let remote = MockRemoteTrack::new("t1", "q", 1111);
        let (publisher, _status) = Publisher::spawn_video(
            TrackId::from("t1"),
            SimulcastLayer::Low,
            remote,
        );
        let sub = RecordingSubscription::new(participant("@a:x"), SimulcastLayer::Low);
        publisher.add_subscription(sub.clone());
        let removed = publisher.remove_subscription(sub.subscriber());
        assert!(removed.is_some());
        assert!(publisher.remove_subscription(sub.subscriber()).is_none());

        publisher.forward(packet(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sub.written(), 0);
        publisher.stop();
    }

    #[tokio::test]
    async fn test_stall_then_recover_status_events() {
        let remote = MockRemoteTrack::new("t1", "h", 2222);
        let (publisher, mut status) = Publisher::spawn_video(
            TrackId::from("t1"),
            SimulcastLayer::Medium,
            remote,
        );

        publisher.forward(packet(1));
        // No packets for longer than the stall timeout.
        let event = tokio::time::timeout(Duration::from_secs(4), status.recv())
            .await
            .expect("expected a status event");
        assert_eq!(event, Some(PublisherStatus::Stalled));
        assert!(publisher.is_stalled());

        publisher.forward(packet(2));
        let event = tokio::time::timeout(Duration::from_secs(1), status.recv())
            .await
            .expect("expected a status event");
        assert_eq!(event, Some(PublisherStatus::Recovered));
        assert!(!publisher.is_stalled());

        publisher.stop();
        // Termination closes the status channel.
        let event = tokio::time::timeout(Duration::from_secs(1), status.recv())
            .await
            .expect("expected channel close");
        assert_eq!(event, None);
    }

    #[tokio::test]
    async fn test_replace_track_swaps_handle() {
        let remote = MockRemoteTrack::new("t1", "q", 1111);
        let (publisher, _status) = Publisher::spawn_video(
            TrackId::from("t1"),
            SimulcastLayer::Low,
            remote,
        );
        assert_eq!(publisher.remote_track().ssrc(), 1111);
        publisher.replace_track(MockRemoteTrack::new("t1", "q", 5555));
        assert_eq!(publisher.remote_track().ssrc(), 5555);
        publisher.stop();
    }

    #[tokio::test]
    async fn test_audio_publisher_is_inert() {
        let remote = MockRemoteTrack::new("a1", "", 7777);
        let publisher = Publisher::new_audio(TrackId::from("a1"), remote);
        assert_eq!(publisher.layer(), SimulcastLayer::None);
        assert!(!publisher.is_stalled());
        // Forward on an audio publisher is a no-op, not a panic.
        publisher.forward(packet(1));
        publisher.stop();
        publisher.stop();
    }
}
