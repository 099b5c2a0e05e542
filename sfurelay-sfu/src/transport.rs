//! Media transport abstraction
//!
//! The signaling core never talks to the WebRTC engine directly. It drives a
//! [`MediaTransport`] through offer/answer and candidate calls, and observes
//! it through the [`TransportEvent`] channel handed out at creation.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::track::MediaTrack;
use crate::types::{IceCandidate, SessionDescription};

/// Peer connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Engine callback, delivered in order on the transport's event channel
pub enum TransportEvent {
    /// Media started flowing on a new inbound track
    Track(Arc<MediaTrack>),
    /// An inbound track arrived but could not be relayed
    TrackFailed { reason: String },
    StateChanged(ConnectionState),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Track(track) => f.debug_tuple("Track").field(&track.id).finish(),
            Self::TrackFailed { reason } => f.debug_struct("TrackFailed").field("reason", reason).finish(),
            Self::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
        }
    }
}

/// One negotiated media transport (a peer connection)
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Apply the client's offer
    async fn set_remote_description(&self, offer: SessionDescription) -> Result<()>;

    /// Create and apply the answer, waiting a bounded time for ICE gathering
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Send a relayed track to the remote side
    async fn add_track(&self, track: &MediaTrack) -> Result<()>;

    /// Ask the sender of the stream with this SSRC for a key frame
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Newly created transport plus its event stream
pub struct TransportHandle {
    pub transport: Arc<dyn MediaTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Creates transports; `label` names the transport in logs
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, label: &str) -> Result<TransportHandle>;
}
