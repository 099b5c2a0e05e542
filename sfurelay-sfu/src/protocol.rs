//! JSON signaling envelopes exchanged over the client WebSocket
//!
//! Every frame is a JSON object with a `type` discriminator. Field names
//! follow the browser client (`uqid`, `consumerId`, `sdpMLineIndex`).

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::track::TrackKind;
use crate::types::{ConsumerId, IceCandidate, SessionDescription, SessionId, TrackId};

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Publish: register under `uqid` and negotiate the ingest transport
    #[serde(rename = "connect")]
    Connect {
        sdp: SessionDescription,
        uqid: SessionId,
        #[serde(default)]
        username: String,
    },

    #[serde(rename = "getPeers")]
    GetPeers { uqid: SessionId },

    /// Trickled candidate for the ingest transport. `null` marks end-of-candidates.
    #[serde(rename = "ice")]
    Ice {
        #[serde(default)]
        ice: Option<IceCandidate>,
        uqid: SessionId,
    },

    /// Request a relay transport carrying the tracks of session `id`
    #[serde(rename = "consume")]
    Consume {
        id: SessionId,
        #[serde(rename = "consumerId")]
        consumer_id: ConsumerId,
        sdp: SessionDescription,
    },

    #[serde(rename = "consumer_ice")]
    ConsumerIce {
        #[serde(default)]
        ice: Option<IceCandidate>,
        #[serde(default)]
        uqid: Option<SessionId>,
        #[serde(rename = "consumerId")]
        consumer_id: ConsumerId,
    },

    #[serde(rename = "disconnect")]
    Disconnect { id: SessionId },
}

impl ClientMessage {
    /// Wire names of every message the server handles
    pub const TYPES: [&'static str; 6] = ["connect", "getPeers", "ice", "consume", "consumer_ice", "disconnect"];

    #[must_use]
    pub fn is_known_type(kind: &str) -> bool {
        Self::TYPES.contains(&kind)
    }
}

/// Summary of a registered session, as listed in `peers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: SessionId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: TrackId,
    pub kind: TrackKind,
}

/// One entry of the `consumerslist` snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerEntry {
    pub consumer_id: ConsumerId,
    pub peer_id: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MaxClientsReached,
    ConnectError,
    ConsumeError,
    TrackError,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "join")]
    Join { id: SessionId },

    #[serde(rename = "answer")]
    Answer { sdp: SessionDescription },

    #[serde(rename = "peers")]
    Peers { peers: Vec<PeerSummary> },

    #[serde(rename = "consume")]
    Consume {
        sdp: SessionDescription,
        username: String,
        id: SessionId,
        #[serde(rename = "consumerId")]
        consumer_id: ConsumerId,
    },

    #[serde(rename = "newProducer")]
    NewProducer {
        id: SessionId,
        username: String,
        #[serde(rename = "trackInfo")]
        track_info: TrackInfo,
    },

    #[serde(rename = "user_left")]
    UserLeft { id: SessionId },

    #[serde(rename = "consumerslist")]
    ConsumersList { data: Vec<ConsumerEntry> },

    #[serde(rename = "error")]
    Error { message: String, code: ErrorCode },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code,
        }
    }

    /// Serialize to the JSON text frame
    #[must_use]
    pub fn to_json(&self) -> String {
        // Every variant is a plain struct of strings and enums, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Outbound half of a client connection
///
/// Sends never block: a full buffer means the client is too slow and the
/// message is dropped, a closed buffer means the client is gone.
#[derive(Debug, Clone)]
pub struct SignalSink {
    tx: mpsc::Sender<String>,
}

impl SignalSink {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Queue a server message, returning whether it was accepted
    pub fn send(&self, message: &ServerMessage) -> bool {
        self.send_text(message.to_json())
    }

    /// Queue a pre-encoded text frame
    pub fn send_text(&self, text: String) -> bool {
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound channel full, client too slow to consume messages");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both sinks feed the same connection
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}
