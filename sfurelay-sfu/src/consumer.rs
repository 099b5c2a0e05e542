//! Relay transports for (viewer, publisher) pairs

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SfuError};
use crate::manager::SfuManager;
use crate::session::Session;
use crate::track::MediaTrack;
use crate::transport::{ConnectionState, MediaTransport, TransportEvent};
use crate::types::{ConsumerId, IceCandidate, SessionDescription, SessionId, TrackId};

/// Relay transport sending one source session's tracks to one viewer
pub struct Consumer {
    pub id: ConsumerId,
    /// Session whose tracks are relayed
    pub source: SessionId,
    /// Registration of `source` this relay was negotiated against
    pub(crate) source_seq: u64,
    /// Session that asked for the relay
    pub requester: SessionId,
    pub created_at: DateTime<Utc>,
    transport: RwLock<Option<Arc<dyn MediaTransport>>>,
    relayed: Mutex<HashSet<TrackId>>,
    cancel: CancellationToken,
}

impl Consumer {
    fn new(id: ConsumerId, source: &Session, requester: SessionId) -> Self {
        Self {
            id,
            source: source.id.clone(),
            source_seq: source.seq,
            requester,
            created_at: Utc::now(),
            transport: RwLock::new(None),
            relayed: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.transport.read().clone()
    }

    /// Mark a track as relayed; false if it already was
    fn mark_relayed(&self, track_id: &TrackId) -> bool {
        self.relayed.lock().insert(track_id.clone())
    }

    #[must_use]
    pub fn relayed_tracks(&self) -> Vec<TrackId> {
        let mut ids: Vec<_> = self.relayed.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether this relay carries tracks of that exact registration
    pub(crate) fn relays(&self, source: &Session) -> bool {
        self.source == source.id && self.source_seq == source.seq
    }

    /// Stop the event pump and close the transport. Idempotent.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                warn!(consumer_id = %self.id, error = %e, "Failed to close consumer transport");
            }
        }
    }
}

/// Successful consume negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeAnswer {
    pub sdp: SessionDescription,
    /// Display name of the source session
    pub username: String,
}

impl SfuManager {
    /// Create a relay transport carrying the tracks of `source_id` to `requester`
    ///
    /// Returns `Ok(None)` when `consumer_id` is already in use; the request is
    /// ignored in that case.
    pub async fn consume(
        &self,
        requester: &SessionId,
        source_id: &SessionId,
        consumer_id: ConsumerId,
        offer: SessionDescription,
    ) -> Result<Option<ConsumeAnswer>> {
        let source = self
            .session(source_id)
            .ok_or_else(|| SfuError::SourceNotFound(source_id.clone()))?;

        let consumer = Arc::new(Consumer::new(consumer_id.clone(), &source, requester.clone()));
        match self.consumers.entry(consumer_id.clone()) {
            Entry::Occupied(_) => {
                debug!(consumer_id = %consumer_id, "Consumer already exists, ignoring consume");
                return Ok(None);
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&consumer));
            }
        }

        match self.negotiate_consumer(&consumer, &source, offer).await {
            Ok(sdp) => {
                info!(
                    consumer_id = %consumer.id,
                    source = %consumer.source,
                    requester = %consumer.requester,
                    tracks = consumer.relayed.lock().len(),
                    "Consumer created"
                );
                self.broadcast_consumers();
                Ok(Some(ConsumeAnswer {
                    sdp,
                    username: source.username.clone(),
                }))
            }
            Err(e) => {
                warn!(consumer_id = %consumer.id, error = %e, "Consume failed");
                self.consumers
                    .remove_if(&consumer.id, |_, current| Arc::ptr_eq(current, &consumer));
                consumer.close().await;
                Err(e)
            }
        }
    }

    async fn negotiate_consumer(
        &self,
        consumer: &Arc<Consumer>,
        source: &Arc<Session>,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let handle = self.factory.create(&format!("consumer-{}", consumer.id)).await?;
        let transport = Arc::clone(&handle.transport);
        *consumer.transport.write() = Some(Arc::clone(&transport));
        spawn_consumer_pump(Arc::clone(consumer), handle.events);

        transport.set_remote_description(offer).await?;

        let mut attached: Vec<Arc<MediaTrack>> = Vec::new();
        for track in source.tracks() {
            if consumer.mark_relayed(&track.id) {
                transport.add_track(&track).await?;
                attached.push(track);
            }
        }

        let answer = transport.create_answer().await?;

        // Source may have left while we were negotiating
        if !self.is_current(source) {
            return Err(SfuError::SourceNotFound(source.id.clone()));
        }

        if let Some(source_transport) = source.transport() {
            for track in attached.iter().filter(|t| t.is_video()) {
                if let Err(e) = source_transport.request_keyframe(track.ssrc).await {
                    debug!(track_id = %track.id, error = %e, "Key frame request failed");
                }
            }
        }

        Ok(answer)
    }

    /// Apply a candidate to a consumer's relay transport. No buffering.
    pub async fn add_consumer_ice_candidate(&self, consumer_id: &ConsumerId, candidate: IceCandidate) {
        let Some(transport) = self
            .consumers
            .get(consumer_id)
            .and_then(|consumer| consumer.transport())
        else {
            debug!(consumer_id = %consumer_id, "ICE candidate for unknown consumer dropped");
            return;
        };

        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!(consumer_id = %consumer_id, error = %e, "Failed to add consumer ICE candidate");
        }
    }

    #[must_use]
    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<Arc<Consumer>> {
        self.consumers.get(consumer_id).map(|entry| Arc::clone(entry.value()))
    }
}

fn spawn_consumer_pump(consumer: Arc<Consumer>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    let cancel = consumer.cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(TransportEvent::StateChanged(ConnectionState::Failed)) => {
                        warn!(consumer_id = %consumer.id, source = %consumer.source, "Consumer transport failed");
                    }
                    Some(event) => {
                        debug!(consumer_id = %consumer.id, event = ?event, "Consumer transport event");
                    }
                    None => break,
                }
            }
        }
    });
}
