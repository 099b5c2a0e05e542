//! In-memory transports for tests
//!
//! [`MockTransportFactory`] records every transport it creates. Tests look a
//! transport up by label (`session-{id}` / `consumer-{id}`) to inspect what the
//! manager did with it, or to inject engine events.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Result, SfuError};
use crate::track::MediaTrack;
use crate::transport::{MediaTransport, TransportEvent, TransportFactory, TransportHandle};
use crate::types::{IceCandidate, SessionDescription, TrackId};

/// Offer used by tests; the mock accepts any offer
#[must_use]
pub fn offer() -> SessionDescription {
    SessionDescription::offer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\n")
}

#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    fail_create: AtomicBool,
    fail_negotiation: AtomicBool,
    negotiation_delay: Mutex<Option<Duration>>,
}

impl MockTransportFactory {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following `create` fail
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make `set_remote_description` fail on transports created from now on
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    /// Delay `set_remote_description` on transports created from now on
    pub fn set_negotiation_delay(&self, delay: Option<Duration>) {
        *self.negotiation_delay.lock() = delay;
    }

    /// Most recently created transport with this label
    #[must_use]
    pub fn transport(&self, label: &str) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|t| t.label == label)
            .cloned()
    }

    /// Every transport created with this label, oldest first
    #[must_use]
    pub fn transports_for(&self, label: &str) -> Vec<Arc<MockTransport>> {
        self.transports
            .lock()
            .iter()
            .filter(|t| t.label == label)
            .cloned()
            .collect()
    }

    /// Labels of every transport created so far
    #[must_use]
    pub fn created(&self) -> Vec<String> {
        self.transports.lock().iter().map(|t| t.label.clone()).collect()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self, label: &str) -> Result<TransportHandle> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SfuError::Negotiation(format!("cannot create {label}")));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            label: label.to_string(),
            events: events_tx,
            fail_negotiation: self.fail_negotiation.load(Ordering::SeqCst),
            negotiation_delay: *self.negotiation_delay.lock(),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            keyframes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.transports.lock().push(Arc::clone(&transport));

        Ok(TransportHandle {
            transport,
            events: events_rx,
        })
    }
}

/// Transport that records calls instead of negotiating media
pub struct MockTransport {
    pub label: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    fail_negotiation: bool,
    negotiation_delay: Option<Duration>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<TrackId>>,
    keyframes: Mutex<Vec<u32>>,
    closed: AtomicBool,
}

impl MockTransport {
    /// Inject an engine event; false once nobody listens any more
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    #[must_use]
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// Ids of the tracks attached, in order
    #[must_use]
    pub fn tracks(&self) -> Vec<TrackId> {
        self.tracks.lock().clone()
    }

    #[must_use]
    pub fn keyframe_requests(&self) -> Vec<u32> {
        self.keyframes.lock().clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn set_remote_description(&self, offer: SessionDescription) -> Result<()> {
        if let Some(delay) = self.negotiation_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_negotiation {
            return Err(SfuError::Negotiation("rejected offer".to_string()));
        }
        *self.remote.lock() = Some(offer);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("mock-answer:{}", self.label)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        self.tracks.lock().push(track.id.clone());
        Ok(())
    }

    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()> {
        self.keyframes.lock().push(media_ssrc);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
