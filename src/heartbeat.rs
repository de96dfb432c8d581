//! Keep-alive: periodic data-channel pings with a bounded patience for the
//! matching pongs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::errors::SfuError;
use crate::id_types::ParticipantId;
use crate::metrics::SFU_KEEPALIVE_TIMEOUTS_TOTAL;
use crate::peer::{PeerEvent, PeerEventSink};
use crate::signaling::HangupReason;

/// Consecutive missed pong windows before the participant is dropped.
const MAX_MISSES: u32 = 3;

/// The one operation the heartbeat needs from the peer. Implemented by the
/// peer adapter; `NotReady` before the data channel opens is expected.
#[async_trait]
pub trait PingSender: Send + Sync {
    async fn send_ping(&self) -> Result<(), SfuError>;
}

/// Handle to one participant's heartbeat task.
pub struct Heartbeat {
    pong_tx: mpsc::Sender<()>,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl Heartbeat {
    /// Starts the ping loop. A pong must arrive within `timeout` of its
    /// ping; each retry waits `timeout / 3`, and after three misses the
    /// task posts `LeftTheCall(KeepAliveTimeout)` on the peer sink and
    /// exits.
    pub fn start(
        participant: ParticipantId,
        interval: Duration,
        timeout: Duration,
        pinger: Arc<dyn PingSender>,
        sink: PeerEventSink,
    ) -> Self {
        let (pong_tx, mut pong_rx) = mpsc::channel::<()>(4);
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let stop_signal = stop.clone();
        let stop_flag = stopped.clone();
        let retry_delay = timeout / 3;
        tokio::spawn(async move {
            let mut misses = 0u32;
            loop {
                if stop_flag.load(Ordering::Acquire) {
                    return;
                }
                // Pongs from a previous window must not count for this one.
                while pong_rx.try_recv().is_ok() {}

                if let Err(err) = pinger.send_ping().await {
                    debug!(participant = %participant, error = %err, "ping not sent");
                }

                tokio::select! {
                    _ = stop_signal.notified() => return,
                    pong = pong_rx.recv() => {
                        if pong.is_none() {
                            return;
                        }
                        misses = 0;
                        tokio::select! {
                            _ = stop_signal.notified() => return,
                            _ = tokio::time::sleep(interval) => {}
                        }
                    }
                    _ = tokio::time::sleep(retry_delay) => {
                        misses += 1;
                        if misses >= MAX_MISSES {
                            warn!(participant = %participant, "keep-alive timed out");
                            SFU_KEEPALIVE_TIMEOUTS_TOTAL.inc();
                            let _ = sink
                                .send(PeerEvent::LeftTheCall(HangupReason::KeepAliveTimeout))
                                .await;
                            return;
                        }
                    }
                }
            }
        });

        Self {
            pong_tx,
            stop,
            stopped,
        }
    }

    /// Feeds one received pong into the current window.
    pub fn pong_received(&self) {
        let _ = self.pong_tx.try_send(());
    }

    /// Stops the loop. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.stop.notify_waiters();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
