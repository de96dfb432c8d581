//! A Selective Forwarding Unit for group calls: clients publish media over
//! one peer connection each, and the SFU forwards every published track to
//! its subscribers at the simulcast layer each of them asked for.

pub mod conference;
pub mod config;
pub mod datachannel;
pub mod errors;
pub mod heartbeat;
pub mod id_types;
pub mod logging;
pub mod media;
pub mod metrics;
pub mod peer;
pub mod published_track;
pub mod publisher;
pub mod rewriter;
pub mod router;
pub mod signaling;
pub mod simulcast;
pub mod sink;
pub mod subscription;
pub mod tracker;
pub mod types;
pub mod worker;

pub use errors::SfuError;
