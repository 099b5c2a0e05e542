//! Media track relay
//!
//! Each track a publisher sends is mirrored into a local RTP track. Relay
//! transports attach the local track, so one inbound stream fans out to any
//! number of viewers without re-encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Result, SfuError};
use crate::types::TrackId;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl TryFrom<RTPCodecType> for TrackKind {
    type Error = SfuError;

    fn try_from(codec_type: RTPCodecType) -> Result<Self> {
        match codec_type {
            RTPCodecType::Audio => Ok(Self::Audio),
            RTPCodecType::Video => Ok(Self::Video),
            _ => Err(SfuError::TrackRelay("track has no media kind".to_string())),
        }
    }
}

/// Relayed media track owned by a publishing session
pub struct MediaTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    /// SSRC of the publisher's stream, target of key frame requests
    pub ssrc: u32,
    pub created_at: DateTime<Utc>,
    local: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
    stats: Arc<TrackStatsInner>,
}

#[derive(Default)]
struct TrackStatsInner {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    write_errors: AtomicU64,
}

impl MediaTrack {
    /// Mirror a remote track and start copying its RTP packets
    ///
    /// Must be called from within a tokio runtime.
    pub fn relay(remote: Arc<TrackRemote>) -> Result<Arc<Self>> {
        let kind = TrackKind::try_from(remote.kind())?;
        let capability = remote.codec().capability;
        if capability.mime_type.is_empty() {
            return Err(SfuError::TrackRelay("track has no negotiated codec".to_string()));
        }

        let id = match remote.id() {
            id if id.is_empty() => TrackId::new(format!("{}-{}", kind.as_str(), remote.ssrc())),
            id => TrackId::new(id),
        };

        info!(
            track_id = %id,
            kind = kind.as_str(),
            ssrc = remote.ssrc(),
            codec = %capability.mime_type,
            "Relaying media track"
        );

        let local = Arc::new(TrackLocalStaticRTP::new(
            capability,
            id.to_string(),
            remote.stream_id(),
        ));
        let track = Arc::new(Self::with_local(id, kind, remote.ssrc(), local));
        track.spawn_reader(remote);
        Ok(track)
    }

    /// Track with no inbound stream behind it
    #[must_use]
    pub fn detached(id: TrackId, kind: TrackKind) -> Arc<Self> {
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            id.to_string(),
            "detached".to_string(),
        ));
        Arc::new(Self::with_local(id, kind, 0, local))
    }

    fn with_local(id: TrackId, kind: TrackKind, ssrc: u32, local: Arc<TrackLocalStaticRTP>) -> Self {
        Self {
            id,
            kind,
            ssrc,
            created_at: Utc::now(),
            local,
            cancel: CancellationToken::new(),
            stats: Arc::new(TrackStatsInner::default()),
        }
    }

    fn spawn_reader(&self, remote: Arc<TrackRemote>) {
        let local = Arc::clone(&self.local);
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let track_id = self.id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    result = remote.read_rtp() => match result {
                        Ok((packet, _attributes)) => {
                            stats.packets_received.fetch_add(1, Ordering::Relaxed);
                            stats
                                .bytes_received
                                .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);

                            if let Err(e) = local.write_rtp(&packet).await {
                                stats.write_errors.fetch_add(1, Ordering::Relaxed);
                                trace!(track_id = %track_id, error = %e, "Failed to forward RTP packet");
                            }
                        }
                        Err(e) => {
                            debug!(track_id = %track_id, error = %e, "RTP read ended");
                            break;
                        }
                    }
                }
            }

            info!(track_id = %track_id, "RTP reader stopped");
        });
    }

    /// Local track that relay transports attach
    #[must_use]
    pub fn local(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.local)
    }

    #[must_use]
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop relaying. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!(track_id = %self.id, "Stopping media track");
            self.cancel.cancel();
        }
    }

    #[must_use]
    pub fn get_stats(&self) -> TrackStats {
        TrackStats {
            track_id: self.id.clone(),
            kind: self.kind,
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            write_errors: self.stats.write_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MediaTrack {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Track statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStats {
    pub track_id: TrackId,
    pub kind: TrackKind,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub write_errors: u64,
}
