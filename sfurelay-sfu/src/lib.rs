//! SFU (Selective Forwarding Unit) signaling and relay core
//!
//! Every publishing client gets one ingest transport; every (viewer, publisher)
//! pair gets its own relay transport carrying the publisher's tracks. All
//! clients share one implicit room.
//!
//! # Layout
//!
//! - [`SfuManager`] owns the session registry, the consumer registry and
//!   cleanup.
//! - [`MediaTransport`] / [`TransportFactory`] abstract the WebRTC engine;
//!   [`WebRtcTransportFactory`] is the webrtc-rs implementation.
//! - [`protocol`] holds the JSON signaling envelopes.

pub mod candidates;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod stats;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
pub mod track;
pub mod transport;
pub mod types;

pub use config::SfuConfig;
pub use consumer::{ConsumeAnswer, Consumer};
pub use engine::WebRtcTransportFactory;
pub use error::{Result, SfuError};
pub use manager::SfuManager;
pub use protocol::{ClientMessage, ErrorCode, ServerMessage, SignalSink};
pub use session::Session;
pub use stats::{SfuStats, StatsSnapshot};
pub use track::{MediaTrack, TrackKind};
pub use transport::{ConnectionState, MediaTransport, TransportEvent, TransportFactory, TransportHandle};
pub use types::{ConsumerId, IceCandidate, SdpType, SessionDescription, SessionId, TrackId};
