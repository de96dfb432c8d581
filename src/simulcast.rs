//! Simulcast layers and per-subscriber layer selection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::TrackKind;

/// One simulcast quality, or `None` for audio and non-simulcast video.
///
/// The wire-level codes are the RTP stream ids the sender announces:
/// `"q"` (quarter), `"h"` (half), `"f"` (full) and the empty rid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulcastLayer {
    None,
    Low,
    Medium,
    High,
}

impl SimulcastLayer {
    pub fn from_rid(rid: &str) -> Self {
        match rid {
            "q" => SimulcastLayer::Low,
            "h" => SimulcastLayer::Medium,
            "f" => SimulcastLayer::High,
            _ => SimulcastLayer::None,
        }
    }

    pub fn as_rid(&self) -> &'static str {
        match self {
            SimulcastLayer::None => "",
            SimulcastLayer::Low => "q",
            SimulcastLayer::Medium => "h",
            SimulcastLayer::High => "f",
        }
    }
}

impl fmt::Display for SimulcastLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SimulcastLayer::None => "none",
            SimulcastLayer::Low => "low",
            SimulcastLayer::Medium => "medium",
            SimulcastLayer::High => "high",
        };
        write!(f, "{name}")
    }
}

/// Lock-free cell holding a [`SimulcastLayer`], for the subscription's
/// current-layer field which is read on the packet hot path.
pub struct AtomicLayer(std::sync::atomic::AtomicU8);

impl AtomicLayer {
    pub fn new(layer: SimulcastLayer) -> Self {
        Self(std::sync::atomic::AtomicU8::new(Self::encode(layer)))
    }

    pub fn load(&self) -> SimulcastLayer {
        Self::decode(self.0.load(std::sync::atomic::Ordering::Acquire))
    }

    pub fn store(&self, layer: SimulcastLayer) {
        self.0
            .store(Self::encode(layer), std::sync::atomic::Ordering::Release);
    }

    fn encode(layer: SimulcastLayer) -> u8 {
        match layer {
            SimulcastLayer::None => 0,
            SimulcastLayer::Low => 1,
            SimulcastLayer::Medium => 2,
            SimulcastLayer::High => 3,
        }
    }

    fn decode(value: u8) -> SimulcastLayer {
        match value {
            1 => SimulcastLayer::Low,
            2 => SimulcastLayer::Medium,
            3 => SimulcastLayer::High,
            _ => SimulcastLayer::None,
        }
    }
}

/// Chooses the simulcast layer a subscriber should receive.
///
/// The target is derived from the ratio between the track's full size and
/// the subscriber's desired size, then degraded monotonically when the
/// target layer is not being received: never a higher resolution than the
/// target unless nothing below it is available.
pub fn select_layer(
    available: &[SimulcastLayer],
    kind: TrackKind,
    full: (u32, u32),
    desired: (u32, u32),
) -> SimulcastLayer {
    if kind == TrackKind::Audio
        || available.is_empty()
        || (available.len() == 1 && available[0] == SimulcastLayer::None)
    {
        return SimulcastLayer::None;
    }

    let full_size = full.0 + full.1;
    let desired_size = desired.0 + desired.1;
    let target = if full_size == 0 || desired_size == 0 {
        SimulcastLayer::Low
    } else {
        let ratio = f64::from(full_size) / f64::from(desired_size);
        if ratio <= 1.0 {
            SimulcastLayer::High
        } else if ratio <= 2.0 {
            SimulcastLayer::Medium
        } else {
            SimulcastLayer::Low
        }
    };

    let preference = [
        target,
        SimulcastLayer::Medium,
        SimulcastLayer::Low,
        SimulcastLayer::High,
    ];
    preference
        .into_iter()
        .find(|layer| available.contains(layer))
        .unwrap_or(SimulcastLayer::None)
}
