use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref SFU_ACTIVE_CONFERENCES: IntGauge =
        register_int_gauge!("sfu_active_conferences", "Number of currently running conferences")
            .unwrap();
    pub static ref SFU_ACTIVE_PARTICIPANTS: IntGauge = register_int_gauge!(
        "sfu_active_participants",
        "Number of currently connected participants"
    )
    .unwrap();
    pub static ref SFU_PACKETS_FORWARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sfu_packets_forwarded_total",
        "Total number of RTP packets forwarded",
        &["media_type"] // "video" or "audio"
    )
    .unwrap();
    pub static ref SFU_PACKETS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sfu_packets_dropped_total",
        "Total number of RTP packets dropped",
        &["reason"] // "publisher_full", "subscription_full"
    )
    .unwrap();
    pub static ref SFU_KEYFRAMES_REQUESTED_TOTAL: IntCounter = register_int_counter!(
        "sfu_keyframes_requested_total",
        "Total number of PLIs (keyframe requests) sent to publishers"
    )
    .unwrap();
    pub static ref SFU_STALLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sfu_stalls_total",
        "Total number of stall transitions",
        &["component"] // "publisher" or "subscription"
    )
    .unwrap();
    pub static ref SFU_SIGNALING_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "sfu_signaling_dropped_total",
        "Outbound signaling messages dropped because the bus queue was full"
    )
    .unwrap();
    pub static ref SFU_KEEPALIVE_TIMEOUTS_TOTAL: IntCounter = register_int_counter!(
        "sfu_keepalive_timeouts_total",
        "Participants removed because their heartbeat timed out"
    )
    .unwrap();
}

/// Renders the default registry in the Prometheus text format. An encoding
/// failure is logged and produces an empty body; the scrape endpoint must
/// never take the process down.
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        error!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn register_metrics() {
    // Force initialization of lazy_statics
    let _ = SFU_ACTIVE_CONFERENCES.get();
    let _ = SFU_ACTIVE_PARTICIPANTS.get();
    let _ = SFU_PACKETS_FORWARDED_TOTAL
        .with_label_values(&["video"])
        .get();
    let _ = SFU_PACKETS_DROPPED_TOTAL.with_label_values(&["none"]).get();
    let _ = SFU_KEYFRAMES_REQUESTED_TOTAL.get();
    let _ = SFU_STALLS_TOTAL.with_label_values(&["publisher"]).get();
    let _ = SFU_SIGNALING_DROPPED_TOTAL.get();
    let _ = SFU_KEEPALIVE_TIMEOUTS_TOTAL.get();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        // Just verify that accessing them doesn't panic
        register_metrics();
        SFU_ACTIVE_CONFERENCES.inc();
        assert!(SFU_ACTIVE_CONFERENCES.get() >= 1);
    }

    #[test]
    fn test_render_exposes_registered_meters() {
        register_metrics();
        let body = render();
        assert!(body.contains("sfu_active_conferences"));
        assert!(body.contains("sfu_packets_forwarded_total"));
    }
}
