//! One subscription per (published track, subscriber): owns the outgoing
//! local track, rewrites identifiers across layer switches, and watches its
//! own output for stalls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::TrackLocalWriter;

use crate::errors::SfuError;
use crate::id_types::{ParticipantId, TrackId};
use crate::metrics::{
    SFU_PACKETS_DROPPED_TOTAL, SFU_PACKETS_FORWARDED_TOTAL, SFU_STALLS_TOTAL,
};
use crate::rewriter::PacketRewriter;
use crate::simulcast::{AtomicLayer, SimulcastLayer};
use crate::types::TrackInfo;
use crate::worker::{TaskError, Worker, WorkerHandler};

/// How long the outbound side may be silent before the subscription counts
/// itself as stalled and asks for a keyframe.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(3);
const WRITE_QUEUE_CAPACITY: usize = 16;

/// Operations a subscription needs from the peer connection it writes to
/// (and, for keyframe requests, from the publishing side). Implemented by
/// the peer adapter; narrow so tests can substitute their own.
#[async_trait]
pub trait TrackController: Send + Sync {
    async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Arc<RTCRtpSender>, SfuError>;
    async fn remove_track(&self, sender: &Arc<RTCRtpSender>) -> Result<(), SfuError>;
    /// Writes a PLI for `media_ssrc` towards the publishing client.
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), SfuError>;
}

/// The interface a published track and its publishers program against.
/// Audio and video subscriptions differ in everything behind it.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn subscriber(&self) -> &ParticipantId;
    fn current_layer(&self) -> SimulcastLayer;
    /// Updates the current-layer field and asks for a keyframe at the new
    /// layer so the switch renders promptly.
    fn switch_layer(&self, layer: SimulcastLayer);
    fn update_muted(&self, muted: bool);
    fn is_stalled(&self) -> bool;
    /// Enqueues a packet for rewriting and writing out. Never blocks.
    fn write_rtp(&self, packet: &Packet);
    /// Stops the write worker and removes the outgoing track from the
    /// subscriber's peer connection. Safe to call twice.
    async fn unsubscribe(&self) -> Result<(), SfuError>;
}

/// Rewrites and writes queued packets; flags a stall after 3 s of silence.
struct WriteTask {
    subscriber: ParticipantId,
    track_id: TrackId,
    rewriter: PacketRewriter,
    local: Arc<TrackLocalStaticRTP>,
    stalled: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
    layer: Arc<AtomicLayer>,
    keyframe_requests: mpsc::Sender<SimulcastLayer>,
}

#[async_trait]
impl WorkerHandler<Packet> for WriteTask {
    async fn on_task(&mut self, mut packet: Packet) {
        self.rewriter.rewrite(&mut packet);
        if let Err(err) = self.local.write_rtp(&packet).await {
            debug!(track = %self.track_id, subscriber = %self.subscriber, error = %err, "outgoing write failed");
        } else {
            SFU_PACKETS_FORWARDED_TOTAL
                .with_label_values(&["video"])
                .inc();
        }
        if self.stalled.swap(false, Ordering::AcqRel) {
            info!(track = %self.track_id, subscriber = %self.subscriber, "subscription recovered");
        }
    }

    async fn on_timeout(&mut self) {
        if self.muted.load(Ordering::Acquire) || self.stalled.load(Ordering::Acquire) {
            return;
        }
        warn!(track = %self.track_id, subscriber = %self.subscriber, "subscription stalled, requesting keyframe");
        self.stalled.store(true, Ordering::Release);
        SFU_STALLS_TOTAL.with_label_values(&["subscription"]).inc();
        let _ = self.keyframe_requests.try_send(self.layer.load());
    }
}

/// A simulcast-aware video subscription.
pub struct VideoSubscription {
    subscriber: ParticipantId,
    track_id: TrackId,
    layer: Arc<AtomicLayer>,
    muted: Arc<AtomicBool>,
    stalled: Arc<AtomicBool>,
    worker: Worker<Packet>,
    sender: Arc<RTCRtpSender>,
    controller: Arc<dyn TrackController>,
    keyframe_requests: mpsc::Sender<SimulcastLayer>,
    unsubscribed: AtomicBool,
}

impl VideoSubscription {
    /// Binds a fresh local track to the subscriber's peer connection and
    /// starts the write worker and the RTCP read loop.
    pub async fn create(
        subscriber: ParticipantId,
        info: &TrackInfo,
        layer: SimulcastLayer,
        controller: Arc<dyn TrackController>,
        keyframe_requests: mpsc::Sender<SimulcastLayer>,
    ) -> Result<Arc<Self>, SfuError> {
        let local = Arc::new(TrackLocalStaticRTP::new(
            (*info.codec).clone(),
            info.id.to_string(),
            info.stream_id.to_string(),
        ));
        let sender = controller
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // The one stable SSRC every outgoing packet is stamped with.
        let params = sender.get_parameters().await;
        let outgoing_ssrc = params.encodings.first().map(|e| e.ssrc).unwrap_or(0);

        let current_layer = Arc::new(AtomicLayer::new(layer));
        let muted = Arc::new(AtomicBool::new(false));
        let stalled = Arc::new(AtomicBool::new(false));

        let worker = Worker::spawn(
            WRITE_QUEUE_CAPACITY,
            STALL_TIMEOUT,
            WriteTask {
                subscriber: subscriber.clone(),
                track_id: info.id.clone(),
                rewriter: PacketRewriter::new(outgoing_ssrc),
                local,
                stalled: stalled.clone(),
                muted: muted.clone(),
                layer: current_layer.clone(),
                keyframe_requests: keyframe_requests.clone(),
            },
        );

        let subscription = Arc::new(Self {
            subscriber,
            track_id: info.id.clone(),
            layer: current_layer,
            muted,
            stalled,
            worker,
            sender: sender.clone(),
            controller,
            keyframe_requests,
            unsubscribed: AtomicBool::new(false),
        });

        subscription.clone().spawn_rtcp_loop(sender);
        Ok(subscription)
    }

    /// Relays PLI / FIR from the subscriber into keyframe requests at the
    /// layer currently feeding it.
    fn spawn_rtcp_loop(self: Arc<Self>, sender: Arc<RTCRtpSender>) {
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((packets, _)) = sender.read(&mut rtcp_buf).await {
                if self.unsubscribed.load(Ordering::Acquire) {
                    break;
                }
                for packet in packets {
                    if packet.as_any().is::<PictureLossIndication>()
                        || packet.as_any().is::<FullIntraRequest>()
                    {
                        let _ = self.keyframe_requests.try_send(self.layer.load());
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Subscription for VideoSubscription {
    fn subscriber(&self) -> &ParticipantId {
        &self.subscriber
    }

    fn current_layer(&self) -> SimulcastLayer {
        self.layer.load()
    }

    fn switch_layer(&self, layer: SimulcastLayer) {
        debug!(track = %self.track_id, subscriber = %self.subscriber, layer = %layer, "switching layer");
        self.layer.store(layer);
        let _ = self.keyframe_requests.try_send(layer);
    }

    fn update_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    fn write_rtp(&self, packet: &Packet) {
        match self.worker.send(packet.clone()) {
            Ok(()) => {}
            Err(TaskError::TooBusy(_)) => {
                SFU_PACKETS_DROPPED_TOTAL
                    .with_label_values(&["subscription_full"])
                    .inc();
            }
            Err(TaskError::Closed(_)) => {}
        }
    }

    async fn unsubscribe(&self) -> Result<(), SfuError> {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.worker.stop();
        self.controller.remove_track(&self.sender).await?;
        info!(track = %self.track_id, subscriber = %self.subscriber, "unsubscribed");
        Ok(())
    }
}

/// An audio subscription: the publisher-side output track is shared, so
/// this only attaches it to the subscriber's peer connection. No rewriter,
/// no worker, no stall detection.
pub struct AudioSubscription {
    subscriber: ParticipantId,
    track_id: TrackId,
    muted: Arc<AtomicBool>,
    sender: Arc<RTCRtpSender>,
    controller: Arc<dyn TrackController>,
    unsubscribed: AtomicBool,
}

impl AudioSubscription {
    pub async fn create(
        subscriber: ParticipantId,
        track_id: TrackId,
        controller: Arc<dyn TrackController>,
        output: Arc<TrackLocalStaticRTP>,
    ) -> Result<Arc<Self>, SfuError> {
        let sender = controller
            .add_track(output as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Keep the sender's RTCP pipe drained.
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtcp_sender.read(&mut rtcp_buf).await {}
        });

        Ok(Arc::new(Self {
            subscriber,
            track_id,
            muted: Arc::new(AtomicBool::new(false)),
            sender,
            controller,
            unsubscribed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Subscription for AudioSubscription {
    fn subscriber(&self) -> &ParticipantId {
        &self.subscriber
    }

    fn current_layer(&self) -> SimulcastLayer {
        SimulcastLayer::None
    }

    fn switch_layer(&self, _layer: SimulcastLayer) {}

    fn update_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    fn is_stalled(&self) -> bool {
        false
    }

    fn write_rtp(&self, _packet: &Packet) {}

    async fn unsubscribe(&self) -> Result<(), SfuError> {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.controller.remove_track(&self.sender).await?;
        info!(track = %self.track_id, subscriber = %self.subscriber, "unsubscribed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// A subscription that records what it is fed.
    pub struct RecordingSubscription {
        subscriber: ParticipantId,
        layer: AtomicLayer,
        muted: AtomicBool,
        written: AtomicUsize,
        unsubscribed: AtomicBool,
    }

    impl RecordingSubscription {
        pub fn new(subscriber: ParticipantId, layer: SimulcastLayer) -> Arc<Self> {
            Arc::new(Self {
                subscriber,
                layer: AtomicLayer::new(layer),
                muted: AtomicBool::new(false),
                written: AtomicUsize::new(0),
                unsubscribed: AtomicBool::new(false),
            })
        }

        pub fn written(&self) -> usize {
            self.written.load(Ordering::SeqCst)
        }

        pub fn is_unsubscribed(&self) -> bool {
            self.unsubscribed.load(Ordering::SeqCst)
        }

        pub fn is_muted(&self) -> bool {
            self.muted.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Subscription for RecordingSubscription {
        fn subscriber(&self) -> &ParticipantId {
            &self.subscriber
        }
        fn current_layer(&self) -> SimulcastLayer {
            self.layer.load()
        }
        fn switch_layer(&self, layer: SimulcastLayer) {
            self.layer.store(layer);
        }
        fn update_muted(&self, muted: bool) {
            self.muted.store(muted, Ordering::SeqCst);
        }
        fn is_stalled(&self) -> bool {
            false
        }
        fn write_rtp(&self, _packet: &Packet) {
            self.written.fetch_add(1, Ordering::SeqCst);
        }
        async fn unsubscribe(&self) -> Result<(), SfuError> {
            self.unsubscribed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// A controller backed by an unconnected but real peer connection, so
    /// `add_track` / `remove_track` behave like production.
    pub struct PcController {
        pub pc: webrtc::peer_connection::RTCPeerConnection,
        pub keyframes: AtomicUsize,
    }

    impl PcController {
        pub async fn new() -> Arc<Self> {
            let api = crate::media::create_webrtc_api();
            let pc = api
                .new_peer_connection(Default::default())
                .await
                .expect("peer connection");
            Arc::new(Self {
                pc,
                keyframes: AtomicUsize::new(0),
            })
        }

        pub fn keyframes(&self) -> usize {
            self.keyframes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TrackController for PcController {
        async fn add_track(
            &self,
            track: Arc<dyn TrackLocal + Send + Sync>,
        ) -> Result<Arc<RTCRtpSender>, SfuError> {
            Ok(self.pc.add_track(track).await?)
        }

        async fn remove_track(&self, sender: &Arc<RTCRtpSender>) -> Result<(), SfuError> {
            Ok(self.pc.remove_track(sender).await?)
        }

        async fn request_keyframe(&self, _media_ssrc: u32) -> Result<(), SfuError> {
            self.keyframes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
