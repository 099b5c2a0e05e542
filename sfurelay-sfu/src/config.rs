//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    /// Maximum number of registered sessions
    pub max_sessions: usize,
    /// STUN server URLs for server-side transports
    pub ice_servers: Vec<String>,
    /// Number of ICE candidates gathered ahead of negotiation
    pub ice_candidate_pool_size: u8,
    /// How long an answer may wait for ICE gathering to complete
    pub ice_gathering_timeout: Duration,
    /// Close consumers requested by a session when that session leaves.
    /// Off by default: only consumers whose source leaves are closed.
    pub release_consumers_on_viewer_exit: bool,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_sessions: 12,
            ice_servers: vec![
                "stun:stun.stunprotocol.org:3478".to_string(),
                "stun:stun.l.google.com:19302".to_string(),
            ],
            ice_candidate_pool_size: 10,
            ice_gathering_timeout: Duration::from_secs(5),
            release_consumers_on_viewer_exit: false,
        }
    }
}
