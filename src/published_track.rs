//! Aggregates all simulcast layers of one logical track, owns its
//! subscriptions, reacts to layer stalls, and throttles keyframe requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::errors::SfuError;
use crate::id_types::ParticipantId;
use crate::metrics::SFU_KEYFRAMES_REQUESTED_TOTAL;
use crate::publisher::{Publisher, PublisherStatus, RemoteTrackSource};
use crate::simulcast::{select_layer, SimulcastLayer};
use crate::subscription::{AudioSubscription, Subscription, TrackController, VideoSubscription};
use crate::types::{TrackInfo, TrackKind};

/// Minimum spacing between honored keyframe requests per layer. Requests
/// arriving sooner are silently dropped so multiple subscribers cannot
/// amplify keyframe pressure on the publisher.
pub const KEYFRAME_INTERVAL: Duration = Duration::from_millis(500);
const KEYFRAME_QUEUE_CAPACITY: usize = 8;

/// Last-known geometry and mute state of the track, fed from stream
/// metadata the owner advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishedMetadata {
    pub muted: bool,
    pub max_width: u32,
    pub max_height: u32,
}

struct State {
    publishers: HashMap<SimulcastLayer, Arc<Publisher>>,
    subscriptions: HashMap<ParticipantId, Arc<dyn Subscription>>,
    metadata: PublishedMetadata,
}

pub struct PublishedTrack {
    info: TrackInfo,
    owner: ParticipantId,
    owner_controller: Arc<dyn TrackController>,
    /// Pre-allocated output track shared by all audio subscribers; `None`
    /// for video.
    audio_output: Option<Arc<TrackLocalStaticRTP>>,
    state: Mutex<State>,
    keyframe_tx: mpsc::Sender<SimulcastLayer>,
    stopped: Arc<AtomicBool>,
    live_publishers: Arc<AtomicUsize>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl PublishedTrack {
    /// A published track exists from the moment its first layer starts
    /// forwarding; `owner_controller` is the owner's peer, used to ask the
    /// publishing client for keyframes.
    pub fn new(
        info: TrackInfo,
        owner: ParticipantId,
        owner_controller: Arc<dyn TrackController>,
        audio_output: Option<Arc<TrackLocalStaticRTP>>,
    ) -> Arc<Self> {
        let (keyframe_tx, keyframe_rx) = mpsc::channel(KEYFRAME_QUEUE_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);
        let track = Arc::new(Self {
            info,
            owner,
            owner_controller,
            audio_output,
            state: Mutex::new(State {
                publishers: HashMap::new(),
                subscriptions: HashMap::new(),
                metadata: PublishedMetadata::default(),
            }),
            keyframe_tx,
            stopped: Arc::new(AtomicBool::new(false)),
            live_publishers: Arc::new(AtomicUsize::new(0)),
            done_tx,
            done_rx,
        });
        Self::spawn_keyframe_loop(&track, keyframe_rx);
        track
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn owner(&self) -> &ParticipantId {
        &self.owner
    }

    pub fn kind(&self) -> TrackKind {
        self.info.kind
    }

    pub fn metadata(&self) -> PublishedMetadata {
        self.state.lock().unwrap().metadata
    }

    /// Updates geometry/mute state and mirrors the mute flag into every
    /// subscription.
    pub fn set_metadata(&self, metadata: PublishedMetadata) {
        let subscriptions: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.metadata = metadata;
            state.subscriptions.values().cloned().collect()
        };
        for subscription in subscriptions {
            subscription.update_muted(metadata.muted);
        }
    }

    pub fn available_layers(&self) -> Vec<SimulcastLayer> {
        let state = self.state.lock().unwrap();
        let mut layers: Vec<_> = state.publishers.keys().copied().collect();
        layers.sort();
        layers
    }

    pub fn publisher_count(&self) -> usize {
        self.state.lock().unwrap().publishers.len()
    }

    pub fn subscriber_ids(&self) -> Vec<ParticipantId> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .keys()
            .cloned()
            .collect()
    }

    pub fn subscription_layer(&self, subscriber: &ParticipantId) -> Option<SimulcastLayer> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .get(subscriber)
            .map(|s| s.current_layer())
    }

    pub(crate) fn keyframe_sender(&self) -> mpsc::Sender<SimulcastLayer> {
        self.keyframe_tx.clone()
    }

    /// Registers one incoming layer. If the layer is already present the
    /// remote-track handle is swapped (the stack re-presents a track after
    /// SSRC rotation); otherwise a publisher is created and started.
    pub fn add_publisher(
        self: &Arc<Self>,
        remote: Arc<dyn RemoteTrackSource>,
        layer: SimulcastLayer,
    ) -> Result<(), SfuError> {
        if remote.id() != self.info.id.as_ref() {
            return Err(SfuError::Mismatch {
                id: self.info.id.clone(),
                details: format!("remote track id {} does not match", remote.id()),
            });
        }
        let remote_kind = if remote.codec_capability().mime_type.starts_with("audio/") {
            TrackKind::Audio
        } else {
            TrackKind::Video
        };
        if remote_kind != self.info.kind {
            return Err(SfuError::Mismatch {
                id: self.info.id.clone(),
                details: format!("kind {} does not match {}", remote_kind, self.info.kind),
            });
        }

        let mut state = self.state.lock().unwrap();
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(existing) = state.publishers.get(&layer) {
            debug!(track = %self.info.id, layer = %layer, "replacing remote track handle");
            existing.replace_track(remote);
            return Ok(());
        }

        match self.info.kind {
            TrackKind::Audio => {
                // Exactly one audio publisher at layer `none`.
                if layer != SimulcastLayer::None || !state.publishers.is_empty() {
                    return Err(SfuError::Mismatch {
                        id: self.info.id.clone(),
                        details: format!("audio track cannot take layer {layer}"),
                    });
                }
                state
                    .publishers
                    .insert(layer, Publisher::new_audio(self.info.id.clone(), remote));
            }
            TrackKind::Video => {
                // Live video layers are either one `none` (non-simulcast)
                // or a subset of low/medium/high, never a mix.
                let mixes_shapes = (layer == SimulcastLayer::None
                    && !state.publishers.is_empty())
                    || state.publishers.contains_key(&SimulcastLayer::None);
                if mixes_shapes {
                    return Err(SfuError::Mismatch {
                        id: self.info.id.clone(),
                        details: format!(
                            "layer {layer} cannot join layers {:?}",
                            state.publishers.keys().collect::<Vec<_>>()
                        ),
                    });
                }
                let (publisher, status_rx) =
                    Publisher::spawn_video(self.info.id.clone(), layer, remote);
                state.publishers.insert(layer, publisher.clone());
                self.live_publishers.fetch_add(1, Ordering::AcqRel);
                self.spawn_status_loop(layer, publisher, status_rx);
            }
        }
        info!(track = %self.info.id, layer = %layer, kind = %self.info.kind, "publisher added");
        Ok(())
    }

    /// Stops and removes one layer, re-homing its subscriptions onto any
    /// remaining layer or unsubscribing them when none is left. Returns the
    /// number of publishers still live.
    pub async fn remove_publisher(&self, layer: SimulcastLayer) -> usize {
        let orphans = {
            let mut state = self.state.lock().unwrap();
            let Some(publisher) = state.publishers.remove(&layer) else {
                return state.publishers.len();
            };
            publisher.stop();
            let orphans = publisher.remove_all();
            let fallback = [
                SimulcastLayer::Low,
                SimulcastLayer::Medium,
                SimulcastLayer::High,
                SimulcastLayer::None,
            ]
            .iter()
            .find_map(|l| state.publishers.get(l).map(|p| (*l, p.clone())));
            match fallback {
                Some((fallback_layer, fallback_publisher)) => {
                    for subscription in orphans {
                        debug!(
                            track = %self.info.id,
                            subscriber = %subscription.subscriber(),
                            from = %layer,
                            to = %fallback_layer,
                            "migrating subscription off removed layer"
                        );
                        fallback_publisher.add_subscription(subscription.clone());
                        subscription.switch_layer(fallback_layer);
                    }
                    Vec::new()
                }
                None => {
                    for subscription in &orphans {
                        state.subscriptions.remove(subscription.subscriber());
                    }
                    orphans
                }
            }
        };
        for subscription in orphans {
            if let Err(err) = subscription.unsubscribe().await {
                warn!(track = %self.info.id, error = %err, "unsubscribe after layer removal failed");
            }
        }
        self.publisher_count()
    }

    /// Creates or retargets the subscription for `subscriber`, choosing the
    /// optimal simulcast layer for the desired geometry. An existing
    /// subscription already at the chosen layer is left alone.
    pub async fn subscribe(
        self: &Arc<Self>,
        subscriber: ParticipantId,
        controller: Arc<dyn TrackController>,
        desired_width: u32,
        desired_height: u32,
    ) -> Result<(), SfuError> {
        if subscriber == self.owner {
            return Err(SfuError::Mismatch {
                id: self.info.id.clone(),
                details: "a participant cannot subscribe to its own track".to_string(),
            });
        }

        enum Plan {
            AlreadyThere,
            Switched,
            Create(SimulcastLayer),
        }

        let plan = {
            let state = self.state.lock().unwrap();
            let available: Vec<_> = state.publishers.keys().copied().collect();
            let metadata = state.metadata;
            let layer = select_layer(
                &available,
                self.info.kind,
                (metadata.max_width, metadata.max_height),
                (desired_width, desired_height),
            );
            match state.subscriptions.get(&subscriber) {
                Some(existing) if existing.current_layer() == layer => Plan::AlreadyThere,
                Some(existing) => {
                    if let Some(old) = state.publishers.get(&existing.current_layer()) {
                        old.remove_subscription(&subscriber);
                    }
                    if let Some(new) = state.publishers.get(&layer) {
                        new.add_subscription(existing.clone());
                    }
                    existing.switch_layer(layer);
                    Plan::Switched
                }
                None => Plan::Create(layer),
            }
        };

        let layer = match plan {
            Plan::AlreadyThere | Plan::Switched => return Ok(()),
            Plan::Create(layer) => layer,
        };

        let subscription: Arc<dyn Subscription> = match self.info.kind {
            TrackKind::Audio => {
                let output = self
                    .audio_output
                    .clone()
                    .ok_or(SfuError::NotFound("audio output track"))?;
                AudioSubscription::create(
                    subscriber.clone(),
                    self.info.id.clone(),
                    controller,
                    output,
                )
                .await?
            }
            TrackKind::Video => {
                VideoSubscription::create(
                    subscriber.clone(),
                    &self.info,
                    layer,
                    controller,
                    self.keyframe_tx.clone(),
                )
                .await?
            }
        };

        let muted = {
            let mut state = self.state.lock().unwrap();
            state
                .subscriptions
                .insert(subscriber.clone(), subscription.clone());
            if let Some(publisher) = state.publishers.get(&layer) {
                publisher.add_subscription(subscription.clone());
            }
            state.metadata.muted
        };
        subscription.update_muted(muted);
        info!(track = %self.info.id, subscriber = %subscriber, layer = %layer, "subscribed");
        Ok(())
    }

    /// Stops and removes the subscription for `subscriber`. A no-op when
    /// none exists.
    pub async fn unsubscribe(&self, subscriber: &ParticipantId) -> Result<(), SfuError> {
        let subscription = {
            let mut state = self.state.lock().unwrap();
            let subscription = state.subscriptions.remove(subscriber);
            if let Some(subscription) = &subscription {
                if let Some(publisher) = state.publishers.get(&subscription.current_layer()) {
                    publisher.remove_subscription(subscriber);
                }
            }
            subscription
        };
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await?;
        }
        Ok(())
    }

    /// Routes one RTP packet to the publisher feeding `layer`.
    pub fn process_rtp(&self, layer: SimulcastLayer, packet: Packet) {
        let publisher = {
            let state = self.state.lock().unwrap();
            state.publishers.get(&layer).cloned()
        };
        if let Some(publisher) = publisher {
            publisher.forward(packet);
        }
    }

    /// Signals every publisher to terminate. Idempotent; `done` resolves
    /// once all publisher loops exited.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let publishers: Vec<_> = {
            let state = self.state.lock().unwrap();
            state.publishers.values().cloned().collect()
        };
        for publisher in publishers {
            publisher.stop();
        }
        if self.live_publishers.load(Ordering::Acquire) == 0 {
            let _ = self.done_tx.send(true);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Resolves once the track is stopped and every publisher loop exited.
    pub async fn done(&self) {
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    fn spawn_status_loop(
        self: &Arc<Self>,
        layer: SimulcastLayer,
        publisher: Arc<Publisher>,
        mut status_rx: mpsc::Receiver<PublisherStatus>,
    ) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let live = self.live_publishers.clone();
        let stopped = self.stopped.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                let Some(track) = weak.upgrade() else {
                    break;
                };
                track.handle_publisher_status(layer, &publisher, status);
            }
            // The status channel closed: the publisher terminated.
            if let Some(track) = weak.upgrade() {
                track.handle_publisher_terminated(layer, &publisher).await;
            }
            if live.fetch_sub(1, Ordering::AcqRel) == 1 && stopped.load(Ordering::Acquire) {
                let _ = done_tx.send(true);
            }
        });
    }

    /// Reacts to a stall or recovery on one layer.
    fn handle_publisher_status(
        &self,
        layer: SimulcastLayer,
        publisher: &Arc<Publisher>,
        status: PublisherStatus,
    ) {
        let state = self.state.lock().unwrap();
        match status {
            PublisherStatus::Stalled => {
                if state.metadata.muted {
                    return;
                }
                let moved = publisher.remove_all();
                if moved.is_empty() {
                    return;
                }
                let low = if layer != SimulcastLayer::Low {
                    state.publishers.get(&SimulcastLayer::Low).cloned()
                } else {
                    None
                };
                match low {
                    Some(low_publisher) => {
                        warn!(track = %self.info.id, layer = %layer, n = moved.len(), "layer stalled, falling back to low");
                        for subscription in moved {
                            low_publisher.add_subscription(subscription.clone());
                            subscription.switch_layer(SimulcastLayer::Low);
                        }
                    }
                    None => {
                        warn!(track = %self.info.id, layer = %layer, n = moved.len(), "layer stalled with no fallback, subscribers parked");
                        for subscription in moved {
                            subscription.switch_layer(SimulcastLayer::None);
                        }
                    }
                }
            }
            PublisherStatus::Recovered => {
                // Only parked subscribers come back; the ones that fell to
                // low stay there (re-upgrading mid-call is disruptive).
                for subscription in state.subscriptions.values() {
                    if subscription.current_layer() == SimulcastLayer::None {
                        publisher.add_subscription(subscription.clone());
                        subscription.switch_layer(layer);
                    }
                }
            }
        }
    }

    async fn handle_publisher_terminated(&self, layer: SimulcastLayer, publisher: &Arc<Publisher>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let self_terminated = {
            let state = self.state.lock().unwrap();
            state
                .publishers
                .get(&layer)
                .is_some_and(|p| Arc::ptr_eq(p, publisher))
        };
        if self_terminated {
            debug!(track = %self.info.id, layer = %layer, "publisher terminated on its own");
            self.remove_publisher(layer).await;
        }
    }

    fn spawn_keyframe_loop(track: &Arc<Self>, mut keyframe_rx: mpsc::Receiver<SimulcastLayer>) {
        let weak: Weak<Self> = Arc::downgrade(track);
        tokio::spawn(async move {
            let mut next_allowed: HashMap<SimulcastLayer, Instant> = HashMap::new();
            while let Some(layer) = keyframe_rx.recv().await {
                let Some(track) = weak.upgrade() else {
                    break;
                };
                let now = Instant::now();
                if next_allowed.get(&layer).is_some_and(|at| now < *at) {
                    continue;
                }
                let remote = {
                    let state = track.state.lock().unwrap();
                    state.publishers.get(&layer).map(|p| p.remote_track())
                };
                let Some(remote) = remote else { continue };
                next_allowed.insert(layer, now + KEYFRAME_INTERVAL);
                SFU_KEYFRAMES_REQUESTED_TOTAL.inc();
                if let Err(err) = track.owner_controller.request_keyframe(remote.ssrc()).await {
                    debug!(track = %track.info.id, layer = %layer, error = %err, "keyframe request failed");
                }
            }
        });
    }
}
