//! Bridges one live WebRTC video+audio producer pair into a rolling,
//! segmented HLS output.
//!
//! The media routing engine sits behind [router::MediaRouter]; the bridge
//! asks it for plain RTP egress endpoints, describes them to an external
//! transcoder through a synthesized session description and supervises
//! that subprocess. [bridge::HlsBridge] is the only stateful piece: it
//! decides when conversions start, restart and stop.

pub mod bridge;
pub mod egress;
pub mod error;
#[cfg(test)]
pub mod fakes;
pub mod http;
pub mod ports;
pub mod router;
pub mod sdp;
pub mod settings;
pub mod transcode;
