//! Connected client session

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::candidates::PendingCandidates;
use crate::protocol::{PeerSummary, SignalSink};
use crate::track::MediaTrack;
use crate::transport::MediaTransport;
use crate::types::{SessionId, TrackId};

/// Outcome of registering an inbound track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackAdded {
    /// First track of the session; its media just started flowing
    First,
    Additional,
    /// A track with this id is already registered
    Duplicate,
}

/// A registered client: identity, outbound socket and ingest transport
pub struct Session {
    pub id: SessionId,
    pub username: String,
    pub sink: SignalSink,
    pub connected_at: DateTime<Utc>,
    /// Registration order, used to list peers by connection time
    pub(crate) seq: u64,
    transport: RwLock<Option<Arc<dyn MediaTransport>>>,
    tracks: RwLock<IndexMap<TrackId, Arc<MediaTrack>>>,
    pub(crate) pending: PendingCandidates,
    pub(crate) cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(id: SessionId, username: String, sink: SignalSink, seq: u64) -> Self {
        Self {
            id,
            username,
            sink,
            connected_at: Utc::now(),
            seq,
            transport: RwLock::new(None),
            tracks: RwLock::new(IndexMap::new()),
            pending: PendingCandidates::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.transport.read().clone()
    }

    pub(crate) fn set_transport(&self, transport: Arc<dyn MediaTransport>) {
        *self.transport.write() = Some(transport);
    }

    pub(crate) fn take_transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.transport.write().take()
    }

    /// Register an inbound track. Re-adding a known track id changes nothing.
    pub fn add_track(&self, track: Arc<MediaTrack>) -> TrackAdded {
        let mut tracks = self.tracks.write();
        if tracks.contains_key(&track.id) {
            debug!(session_id = %self.id, track_id = %track.id, "Track already registered");
            return TrackAdded::Duplicate;
        }

        let first = tracks.is_empty();
        tracks.insert(track.id.clone(), track);
        if first {
            TrackAdded::First
        } else {
            TrackAdded::Additional
        }
    }

    /// Snapshot of the current tracks in arrival order
    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.read().values().cloned().collect()
    }

    #[must_use]
    pub fn track_count(&self) -> usize {
        self.tracks.read().len()
    }

    /// Remove and stop every track
    pub(crate) fn stop_tracks(&self) {
        let tracks: Vec<_> = self.tracks.write().drain(..).map(|(_, track)| track).collect();
        for track in tracks {
            track.stop();
        }
    }

    #[must_use]
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.clone(),
            username: self.username.clone(),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
