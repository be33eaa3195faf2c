//! Live camera relay.
//!
//! One capture loop per channel keeps the freshest decoded frame in a
//! single-slot buffer; one emitter loop encodes it at a paced rate and fans
//! it out to WebSocket subscribers. A per-client MJPEG stream covers
//! clients without a socket layer.

pub mod annotate;
pub mod buffer;
pub mod capture;
pub mod channel;
pub mod config;
pub mod control;
pub mod emitter;
pub mod encoding;
pub mod fallback;
pub mod pipeline;
pub mod server;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use annotate::Annotator;
pub use channel::{Channel, ChannelRegistry, QualityLevel};
pub use config::RelayConfig;
pub use control::{QualityAck, set_quality_level};
pub use pipeline::{RelayContext, run, run_with_annotator, spawn_channel};
pub use transport::{BroadcastTransport, RelayEvent, RoomHub};
