//! webrtc-rs backed transports

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::TrackLocal;

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::track::MediaTrack;
use crate::transport::{ConnectionState, MediaTransport, TransportEvent, TransportFactory, TransportHandle};
use crate::types::{IceCandidate, SdpType, SessionDescription};

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// Creates peer connections sharing one media engine and interceptor stack
pub struct WebRtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    ice_candidate_pool_size: u8,
    gathering_timeout: Duration,
}

impl WebRtcTransportFactory {
    pub fn new(config: &SfuConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            ice_servers,
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            gathering_timeout: config.ice_gathering_timeout,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, label: &str) -> Result<TransportHandle> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let event = match MediaTrack::relay(remote) {
                    Ok(track) => TransportEvent::Track(track),
                    Err(e) => TransportEvent::TrackFailed { reason: e.to_string() },
                };
                let _ = tx.send(event);
            })
        }));

        let tx = events_tx;
        let name = label.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            info!(transport = %name, state = %state, "Peer connection state changed");
            let _ = tx.send(TransportEvent::StateChanged(state.into()));
            Box::pin(async {})
        }));

        let name = label.to_string();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            debug!(transport = %name, state = %state, "ICE connection state changed");
            Box::pin(async {})
        }));

        debug!(transport = %label, "Created peer connection");

        Ok(TransportHandle {
            transport: Arc::new(WebRtcTransport {
                pc,
                label: label.to_string(),
                gathering_timeout: self.gathering_timeout,
            }),
            events: events_rx,
        })
    }
}

/// A single webrtc-rs peer connection
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    label: String,
    gathering_timeout: Duration,
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn set_remote_description(&self, offer: SessionDescription) -> Result<()> {
        if offer.sdp_type != SdpType::Offer {
            return Err(SfuError::Negotiation(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }

        let desc = RTCSessionDescription::offer(offer.sdp)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        let mut gathering_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await?;

        if tokio::time::timeout(self.gathering_timeout, gathering_complete.recv())
            .await
            .is_err()
        {
            warn!(
                transport = %self.label,
                timeout_ms = self.gathering_timeout.as_millis() as u64,
                "ICE gathering did not complete in time, answering with partial candidates"
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| SfuError::Negotiation("local description unavailable".to_string()))?;

        Ok(SessionDescription::answer(local.sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let sender = self
            .pc
            .add_track(track.local() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Incoming RTCP must be read for interceptors to run
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });

        Ok(())
    }

    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        self.pc.write_rtcp(&[Box::new(pli)]).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        debug!(transport = %self.label, "Closed peer connection");
        Ok(())
    }
}
