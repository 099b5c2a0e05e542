//! SFU Manager - session registry, ingest transports and cleanup
//!
//! This module provides:
//! - Capacity-limited session registration with atomic reconnect
//! - Ingest transport negotiation and ICE candidate buffering
//! - Track registration and `newProducer` announcements
//! - Broadcast to registered sessions
//! - Idempotent session teardown
//!
//! Consumer (relay transport) operations live in [`crate::consumer`].

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::consumer::Consumer;
use crate::error::{Result, SfuError};
use crate::protocol::{ConsumerEntry, ErrorCode, PeerSummary, ServerMessage, SignalSink, TrackInfo};
use crate::session::{Session, TrackAdded};
use crate::stats::{SfuStats, StatsSnapshot};
use crate::track::MediaTrack;
use crate::transport::{ConnectionState, TransportEvent, TransportFactory};
use crate::types::{ConsumerId, IceCandidate, SessionDescription, SessionId};

/// Owns every session and consumer of the (single, implicit) room
pub struct SfuManager {
    config: SfuConfig,
    pub(crate) factory: Arc<dyn TransportFactory>,
    sessions: DashMap<SessionId, Arc<Session>>,
    pub(crate) consumers: DashMap<ConsumerId, Arc<Consumer>>,
    /// Serializes the capacity check with the insert
    admission: Mutex<()>,
    next_seq: AtomicU64,
    stats: SfuStats,
}

impl SfuManager {
    pub fn new(config: SfuConfig, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        info!(
            max_sessions = config.max_sessions,
            ice_servers = config.ice_servers.len(),
            release_consumers_on_viewer_exit = config.release_consumers_on_viewer_exit,
            "SFU Manager initialized"
        );

        Arc::new(Self {
            config,
            factory,
            sessions: DashMap::new(),
            consumers: DashMap::new(),
            admission: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            stats: SfuStats::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub const fn stats(&self) -> &SfuStats {
        &self.stats
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.sessions.len(), self.consumers.len())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Whether a new session id would be refused
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.config.max_sessions
    }

    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `session` is still the registered entry for its id
    pub(crate) fn is_current(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .get(&session.id)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), session))
    }

    /// Register `id` and negotiate its ingest transport
    ///
    /// An existing session with the same id is replaced and torn down. On any
    /// negotiation failure the new entry is removed again.
    pub async fn connect(
        self: &Arc<Self>,
        id: SessionId,
        username: String,
        sink: SignalSink,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let (session, previous) = self.register(id.clone(), username, sink)?;

        if let Some(previous) = previous {
            info!(session_id = %id, "Session already exists, replacing previous connection");
            self.teardown(previous, Some(&id)).await;
        }

        match self.negotiate_ingest(&session, offer).await {
            Ok(answer) => {
                info!(
                    session_id = %session.id,
                    username = %session.username,
                    sessions = self.sessions.len(),
                    "Session connected"
                );
                Ok(answer)
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Ingest negotiation failed");
                self.cleanup_if_current(&session).await;
                Err(e)
            }
        }
    }

    fn register(
        &self,
        id: SessionId,
        username: String,
        sink: SignalSink,
    ) -> Result<(Arc<Session>, Option<Arc<Session>>)> {
        let _admission = self.admission.lock();

        if !self.sessions.contains_key(&id) && self.sessions.len() >= self.config.max_sessions {
            warn!(
                session_id = %id,
                max_sessions = self.config.max_sessions,
                "Session limit reached"
            );
            return Err(SfuError::CapacityReached {
                max: self.config.max_sessions,
            });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id.clone(), username, sink, seq));
        let previous = self.sessions.insert(id, Arc::clone(&session));
        self.stats.observe_sessions(self.sessions.len());

        Ok((session, previous))
    }

    async fn negotiate_ingest(
        self: &Arc<Self>,
        session: &Arc<Session>,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let handle = self.factory.create(&format!("session-{}", session.id)).await?;
        let transport = Arc::clone(&handle.transport);
        session.set_transport(Arc::clone(&transport));
        self.spawn_event_pump(Arc::clone(session), handle.events);

        // Replaced or disconnected while the transport was being created
        if session.is_closed() {
            if let Some(transport) = session.take_transport() {
                let _ = transport.close().await;
            }
            return Err(SfuError::SessionNotFound(session.id.clone()));
        }

        transport.set_remote_description(offer).await?;

        let buffered = session.pending.drain();
        if !buffered.is_empty() {
            debug!(session_id = %session.id, count = buffered.len(), "Flushing buffered ICE candidates");
        }
        for candidate in buffered {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!(session_id = %session.id, error = %e, "Failed to add buffered ICE candidate");
            }
        }

        transport.create_answer().await
    }

    /// Apply a candidate to a session's ingest transport, buffering it until
    /// the transport has a remote description
    pub async fn add_ice_candidate(&self, id: &SessionId, candidate: IceCandidate) {
        let Some(session) = self.session(id) else {
            warn!(session_id = %id, "ICE candidate for unknown session dropped");
            return;
        };

        let Some(candidate) = session.pending.push_or_pass(candidate) else {
            debug!(session_id = %id, "ICE candidate buffered");
            return;
        };

        let Some(transport) = session.transport() else {
            return;
        };

        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!(session_id = %id, error = %e, "Failed to add ICE candidate");
        }
    }

    /// Every registered session except `excluding`, by connection time
    #[must_use]
    pub fn list_peers(&self, excluding: &SessionId) -> Vec<PeerSummary> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.key() != excluding)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by_key(|session| session.seq);
        sessions.iter().map(|session| session.summary()).collect()
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let manager = Arc::clone(self);
        let cancel = session.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    TransportEvent::Track(track) => manager.on_track(&session, track),
                    TransportEvent::TrackFailed { reason } => {
                        warn!(session_id = %session.id, reason = %reason, "Failed to relay inbound track");
                        session.sink.send(&ServerMessage::error(
                            ErrorCode::TrackError,
                            "Failed to process media track",
                        ));
                    }
                    TransportEvent::StateChanged(ConnectionState::Failed) => {
                        warn!(session_id = %session.id, "Ingest transport failed, cleaning up");
                        manager.cleanup_if_current(&session).await;
                        break;
                    }
                    TransportEvent::StateChanged(state) => {
                        debug!(session_id = %session.id, state = ?state, "Ingest transport state changed");
                    }
                }
            }
            debug!(session_id = %session.id, "Event pump stopped");
        });
    }

    fn on_track(&self, session: &Arc<Session>, track: Arc<MediaTrack>) {
        if session.is_closed() || !self.is_current(session) {
            track.stop();
            return;
        }

        match session.add_track(Arc::clone(&track)) {
            TrackAdded::Duplicate => track.stop(),
            TrackAdded::Additional => {
                debug!(session_id = %session.id, track_id = %track.id, kind = track.kind.as_str(), "Track added");
            }
            TrackAdded::First => {
                info!(
                    session_id = %session.id,
                    track_id = %track.id,
                    kind = track.kind.as_str(),
                    "Publisher media started"
                );
                self.broadcast(
                    &ServerMessage::NewProducer {
                        id: session.id.clone(),
                        username: session.username.clone(),
                        track_info: TrackInfo {
                            id: track.id.clone(),
                            kind: track.kind,
                        },
                    },
                    Some(&session.id),
                );
            }
        }
    }

    /// Send to every registered session except `exclude`; returns the number
    /// of sessions that accepted the message
    pub fn broadcast(&self, message: &ServerMessage, exclude: Option<&SessionId>) -> usize {
        self.broadcast_text(&message.to_json(), exclude)
    }

    pub fn broadcast_text(&self, text: &str, exclude: Option<&SessionId>) -> usize {
        let sinks: Vec<SignalSink> = self
            .sessions
            .iter()
            .filter(|entry| exclude != Some(entry.key()))
            .map(|entry| entry.value().sink.clone())
            .collect();

        sinks
            .into_iter()
            .filter(|sink| sink.send_text(text.to_string()))
            .count()
    }

    #[must_use]
    pub fn consumers_snapshot(&self) -> Vec<ConsumerEntry> {
        let mut consumers: Vec<Arc<Consumer>> = self
            .consumers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        consumers.sort_by_key(|consumer| consumer.created_at);
        consumers
            .into_iter()
            .map(|consumer| ConsumerEntry {
                consumer_id: consumer.id.clone(),
                peer_id: consumer.source.clone(),
            })
            .collect()
    }

    pub(crate) fn broadcast_consumers(&self) {
        self.broadcast(
            &ServerMessage::ConsumersList {
                data: self.consumers_snapshot(),
            },
            None,
        );
    }

    /// Remove a session and release everything it owns. Returns false if no
    /// session was registered under `id`.
    pub async fn cleanup_session(&self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                self.teardown(session, None).await;
                true
            }
            None => false,
        }
    }

    /// Remove `id` only while it is registered through the connection behind
    /// `sink`. A session taken over by another socket is left alone.
    pub async fn cleanup_owned(&self, id: &SessionId, sink: &SignalSink) -> bool {
        match self
            .sessions
            .remove_if(id, |_, session| session.sink.same_connection(sink))
        {
            Some((_, session)) => {
                self.teardown(session, None).await;
                true
            }
            None => false,
        }
    }

    /// Like [`cleanup_session`](Self::cleanup_session), but only if `session`
    /// has not been replaced in the meantime
    pub async fn cleanup_if_current(&self, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(&session.id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            self.teardown(Arc::clone(session), None).await;
        }
        removed
    }

    /// Release a session that is no longer in the registry
    async fn teardown(&self, session: Arc<Session>, notify_exclude: Option<&SessionId>) {
        session.cancel.cancel();

        if let Some(transport) = session.take_transport() {
            if let Err(e) = transport.close().await {
                warn!(session_id = %session.id, error = %e, "Failed to close ingest transport");
            }
        }
        session.stop_tracks();

        let release_requested = self.config.release_consumers_on_viewer_exit;
        let doomed: Vec<Arc<Consumer>> = self
            .consumers
            .iter()
            .filter(|entry| {
                let consumer = entry.value();
                consumer.relays(&session) || (release_requested && consumer.requester == session.id)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for consumer in &doomed {
            self.consumers
                .remove_if(&consumer.id, |_, current| Arc::ptr_eq(current, consumer));
            consumer.close().await;
        }

        info!(
            session_id = %session.id,
            consumers_closed = doomed.len(),
            sessions = self.sessions.len(),
            "Session cleaned up"
        );

        self.broadcast(&ServerMessage::UserLeft { id: session.id.clone() }, notify_exclude);
        self.broadcast_consumers();
    }

    /// Log a stats snapshot every `interval` until `cancel` fires
    pub fn spawn_stats_task(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "Starting statistics task");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = manager.stats_snapshot();
                        info!(
                            current_sessions = stats.current_sessions,
                            peak_sessions = stats.peak_sessions,
                            consumers = stats.consumers,
                            accepted = stats.accepted_connections,
                            rejected = stats.rejected_connections,
                            "Server stats"
                        );
                    }
                }
            }
        })
    }

    /// Close every session and consumer
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();

        let consumers: Vec<Arc<Consumer>> = self
            .consumers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.consumers.clear();

        for consumer in &consumers {
            consumer.close().await;
        }
        for session in &sessions {
            session.cancel.cancel();
            if let Some(transport) = session.take_transport() {
                let _ = transport.close().await;
            }
            session.stop_tracks();
        }

        info!(
            sessions = sessions.len(),
            consumers = consumers.len(),
            "SFU Manager shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{offer, MockTransportFactory};
    use crate::track::TrackKind;
    use crate::types::TrackId;
    use tokio::sync::mpsc::Receiver;

    fn manager_with(max_sessions: usize) -> (Arc<SfuManager>, Arc<MockTransportFactory>) {
        let factory = MockTransportFactory::new();
        let config = SfuConfig {
            max_sessions,
            ..SfuConfig::default()
        };
        (SfuManager::new(config, factory.clone()), factory)
    }

    fn sink() -> (SignalSink, Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        (SignalSink::new(tx), rx)
    }

    fn drain(rx: &mut Receiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn connect(manager: &Arc<SfuManager>, id: &str, name: &str) -> Receiver<String> {
        let (sink, rx) = sink();
        manager
            .connect(SessionId::from(id), name.to_string(), sink, offer())
            .await
            .unwrap();
        rx
    }

    /// Let the event pumps run
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_connect_returns_answer() {
        let (manager, factory) = manager_with(4);
        let (sink, _rx) = sink();

        let answer = manager
            .connect(SessionId::from("a"), "alice".to_string(), sink, offer())
            .await
            .unwrap();

        assert_eq!(answer.sdp, "mock-answer:session-a");
        assert_eq!(manager.session_count(), 1);
        let transport = factory.transport("session-a").unwrap();
        assert_eq!(transport.remote_description(), Some(offer()));
    }

    #[tokio::test]
    async fn test_list_peers_excludes_requester_in_connection_order() {
        let (manager, _factory) = manager_with(4);
        let _a = connect(&manager, "a", "alice").await;
        let _c = connect(&manager, "c", "carol").await;
        let _b = connect(&manager, "b", "bob").await;

        let peers = manager.list_peers(&SessionId::from("c"));
        let ids: Vec<_> = peers.iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(peers[0].username, "alice");

        let everyone = manager.list_peers(&SessionId::from("nobody"));
        assert_eq!(everyone.len(), 3);
    }

    #[tokio::test]
    async fn test_capacity_rejects_new_ids_but_allows_reconnect() {
        let (manager, _factory) = manager_with(2);
        let _a = connect(&manager, "a", "alice").await;
        let _b = connect(&manager, "b", "bob").await;
        assert!(manager.is_full());

        let (sink_c, _rx) = sink();
        let err = manager
            .connect(SessionId::from("c"), "carol".to_string(), sink_c, offer())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::CapacityReached { max: 2 }));

        let (sink_a, _rx) = sink();
        manager
            .connect(SessionId::from("a"), "alice".to_string(), sink_a, offer())
            .await
            .unwrap();
        assert_eq!(manager.session_count(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session_and_closes_old_transport() {
        let (manager, factory) = manager_with(4);
        let mut b_rx = connect(&manager, "b", "bob").await;
        let _a1 = connect(&manager, "a", "alice").await;
        let first = factory.transport("session-a").unwrap();

        let mut a2_rx = connect(&manager, "a", "alice").await;
        let second = factory.transport("session-a").unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(manager.session_count(), 2);
        assert_eq!(manager.list_peers(&SessionId::from("b")).len(), 1);

        let to_b = drain(&mut b_rx);
        assert!(to_b.iter().any(|m| m["type"] == "user_left" && m["id"] == "a"));
        let to_a2 = drain(&mut a2_rx);
        assert!(!to_a2.iter().any(|m| m["type"] == "user_left"));
    }

    #[tokio::test]
    async fn test_replaced_session_teardown_keeps_consumers_of_replacement() {
        let (manager, factory) = manager_with(4);
        let _b = connect(&manager, "b", "bob").await;
        let _a1 = connect(&manager, "a", "alice").await;
        let old_consumer = manager
            .consume(&SessionId::from("b"), &SessionId::from("a"), ConsumerId::from("c-old"), offer())
            .await
            .unwrap();
        assert!(old_consumer.is_some());

        // Swap in the replacement, then consume from it before the old one is torn down
        let (sink, _a2) = sink();
        let (session, previous) = manager
            .register(SessionId::from("a"), "alice".to_string(), sink)
            .unwrap();
        manager.negotiate_ingest(&session, offer()).await.unwrap();
        manager
            .consume(&SessionId::from("b"), &SessionId::from("a"), ConsumerId::from("c-new"), offer())
            .await
            .unwrap();

        manager.teardown(previous.unwrap(), Some(&SessionId::from("a"))).await;

        assert!(manager.consumer(&ConsumerId::from("c-old")).is_none());
        assert!(factory.transport("consumer-c-old").unwrap().is_closed());
        assert!(manager.consumer(&ConsumerId::from("c-new")).is_some());
        assert!(!factory.transport("consumer-c-new").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_negotiation_failure_leaves_no_entry() {
        let (manager, factory) = manager_with(4);
        factory.set_fail_negotiation(true);

        let (sink, _rx) = sink();
        let result = manager
            .connect(SessionId::from("a"), "alice".to_string(), sink, offer())
            .await;

        assert!(matches!(result, Err(SfuError::Negotiation(_))));
        assert_eq!(manager.session_count(), 0);
        assert!(factory.transport("session-a").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_factory_failure_leaves_no_entry() {
        let (manager, factory) = manager_with(4);
        factory.set_fail_create(true);

        let (sink, _rx) = sink();
        assert!(manager
            .connect(SessionId::from("a"), "alice".to_string(), sink, offer())
            .await
            .is_err());
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_ice_before_remote_description_is_buffered_then_flushed_once() {
        let (manager, factory) = manager_with(4);
        factory.set_negotiation_delay(Some(Duration::from_millis(50)));

        let (sink, _rx) = sink();
        let connecting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .connect(SessionId::from("a"), "alice".to_string(), sink, offer())
                    .await
            })
        };

        // Registered, offer not applied yet
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.add_ice_candidate(&SessionId::from("a"), candidate(1)).await;
        let session = manager.session(&SessionId::from("a")).unwrap();
        assert_eq!(session.pending.len(), 1);
        assert!(factory.transport("session-a").unwrap().candidates().is_empty());

        connecting.await.unwrap().unwrap();
        manager.add_ice_candidate(&SessionId::from("a"), candidate(2)).await;

        let transport = factory.transport("session-a").unwrap();
        assert_eq!(transport.candidates(), vec![candidate(1), candidate(2)]);
        assert!(session.pending.drain().is_empty());
    }

    #[tokio::test]
    async fn test_buffered_candidates_are_applied_after_offer() {
        let (manager, factory) = manager_with(4);
        let (sink, _rx) = sink();
        let (session, _) = manager
            .register(SessionId::from("a"), "alice".to_string(), sink)
            .unwrap();

        manager.add_ice_candidate(&SessionId::from("a"), candidate(1)).await;
        manager.add_ice_candidate(&SessionId::from("a"), candidate(2)).await;
        assert_eq!(session.pending.len(), 2);

        manager.negotiate_ingest(&session, offer()).await.unwrap();
        manager.add_ice_candidate(&SessionId::from("a"), candidate(3)).await;

        let transport = factory.transport("session-a").unwrap();
        assert_eq!(transport.candidates(), vec![candidate(1), candidate(2), candidate(3)]);
        assert!(session.pending.is_flushed());
    }

    #[tokio::test]
    async fn test_ice_for_unknown_session_is_dropped() {
        let (manager, factory) = manager_with(4);
        manager.add_ice_candidate(&SessionId::from("ghost"), candidate(1)).await;
        assert!(factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_first_track_announces_new_producer_once() {
        let (manager, factory) = manager_with(4);
        let mut a_rx = connect(&manager, "a", "alice").await;
        let mut b_rx = connect(&manager, "b", "bob").await;
        let transport = factory.transport("session-a").unwrap();

        transport.emit(TransportEvent::Track(MediaTrack::detached(TrackId::from("v"), TrackKind::Video)));
        transport.emit(TransportEvent::Track(MediaTrack::detached(TrackId::from("au"), TrackKind::Audio)));
        transport.emit(TransportEvent::Track(MediaTrack::detached(TrackId::from("v"), TrackKind::Video)));
        settle().await;

        let to_b = drain(&mut b_rx);
        let producers: Vec<_> = to_b.iter().filter(|m| m["type"] == "newProducer").collect();
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0]["id"], "a");
        assert_eq!(producers[0]["username"], "alice");
        assert_eq!(producers[0]["trackInfo"]["id"], "v");
        assert_eq!(producers[0]["trackInfo"]["kind"], "video");

        assert!(!drain(&mut a_rx).iter().any(|m| m["type"] == "newProducer"));
        assert_eq!(manager.session(&SessionId::from("a")).unwrap().track_count(), 2);
    }

    #[tokio::test]
    async fn test_track_failure_reports_track_error() {
        let (manager, factory) = manager_with(4);
        let mut a_rx = connect(&manager, "a", "alice").await;

        factory
            .transport("session-a")
            .unwrap()
            .emit(TransportEvent::TrackFailed {
                reason: "no codec".to_string(),
            });
        settle().await;

        let to_a = drain(&mut a_rx);
        assert!(to_a.iter().any(|m| m["type"] == "error" && m["code"] == "TRACK_ERROR"));
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_cleans_up() {
        let (manager, factory) = manager_with(4);
        let _a = connect(&manager, "a", "alice").await;
        let mut b_rx = connect(&manager, "b", "bob").await;

        factory
            .transport("session-a")
            .unwrap()
            .emit(TransportEvent::StateChanged(ConnectionState::Failed));
        settle().await;

        assert!(manager.session(&SessionId::from("a")).is_none());
        assert!(drain(&mut b_rx).iter().any(|m| m["type"] == "user_left" && m["id"] == "a"));
    }

    #[tokio::test]
    async fn test_stale_transport_failure_keeps_replacement() {
        let (manager, factory) = manager_with(4);
        let _a1 = connect(&manager, "a", "alice").await;
        let stale = manager.session(&SessionId::from("a")).unwrap();
        let _a2 = connect(&manager, "a", "alice").await;

        assert!(!manager.cleanup_if_current(&stale).await);

        factory.transports_for("session-a")[0].emit(TransportEvent::StateChanged(ConnectionState::Failed));
        settle().await;

        assert!(manager.session(&SessionId::from("a")).is_some());
        assert!(!factory.transport("session-a").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_and_stops_tracks() {
        let (manager, factory) = manager_with(4);
        let _a = connect(&manager, "a", "alice").await;
        let mut b_rx = connect(&manager, "b", "bob").await;
        let track = MediaTrack::detached(TrackId::from("v"), TrackKind::Video);
        factory
            .transport("session-a")
            .unwrap()
            .emit(TransportEvent::Track(Arc::clone(&track)));
        settle().await;
        drain(&mut b_rx);

        assert!(manager.cleanup_session(&SessionId::from("a")).await);
        assert!(!manager.cleanup_session(&SessionId::from("a")).await);

        assert!(!track.is_active());
        assert!(factory.transport("session-a").unwrap().is_closed());
        let to_b = drain(&mut b_rx);
        assert_eq!(to_b.iter().filter(|m| m["type"] == "user_left").count(), 1);
        assert!(to_b.iter().any(|m| m["type"] == "consumerslist"));
    }

    #[tokio::test]
    async fn test_cleanup_owned_ignores_taken_over_session() {
        let (manager, _factory) = manager_with(4);
        let (old_sink, _old_rx) = sink();
        manager
            .connect(SessionId::from("a"), "alice".to_string(), old_sink.clone(), offer())
            .await
            .unwrap();
        let _new_rx = connect(&manager, "a", "alice").await;

        assert!(!manager.cleanup_owned(&SessionId::from("a"), &old_sink).await);
        assert!(manager.session(&SessionId::from("a")).is_some());

        let current = manager.session(&SessionId::from("a")).unwrap().sink.clone();
        assert!(manager.cleanup_owned(&SessionId::from("a"), &current).await);
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let (manager, _factory) = manager_with(4);
        let mut a_rx = connect(&manager, "a", "alice").await;
        let mut b_rx = connect(&manager, "b", "bob").await;

        let sent = manager.broadcast_text(r#"{"type":"chat"}"#, Some(&SessionId::from("a")));

        assert_eq!(sent, 1);
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx)[0]["type"], "chat");
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (manager, factory) = manager_with(4);
        let _a = connect(&manager, "a", "alice").await;
        let _b = connect(&manager, "b", "bob").await;

        manager.shutdown().await;

        assert_eq!(manager.session_count(), 0);
        assert!(factory.transport("session-a").unwrap().is_closed());
        assert!(factory.transport("session-b").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_stats_track_peak() {
        let (manager, _factory) = manager_with(4);
        let _a = connect(&manager, "a", "alice").await;
        let _b = connect(&manager, "b", "bob").await;
        manager.cleanup_session(&SessionId::from("b")).await;

        let stats = manager.stats_snapshot();
        assert_eq!(stats.current_sessions, 1);
        assert_eq!(stats.peak_sessions, 2);
    }
}
