//! Error types for the SFU

use thiserror::Error;

use crate::types::{ConsumerId, SessionId};

#[derive(Debug, Error)]
pub enum SfuError {
    #[error("Server is at capacity ({max} sessions)")]
    CapacityReached { max: usize },

    #[error("Source session {0} not found")]
    SourceNotFound(SessionId),

    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    #[error("Consumer {0} not found")]
    ConsumerNotFound(ConsumerId),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Track relay failed: {0}")]
    TrackRelay(String),

    #[error("Transport error: {0}")]
    Transport(#[from] webrtc::Error),
}

/// Result type for SFU operations
pub type Result<T> = std::result::Result<T, SfuError>;
