//! Connection statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Process-lifetime counters
pub struct SfuStats {
    started_at: DateTime<Utc>,
    peak_sessions: AtomicUsize,
    accepted_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

impl SfuStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            peak_sessions: AtomicUsize::new(0),
            accepted_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
        }
    }

    /// Record the registered-session count after a registration
    pub fn observe_sessions(&self, current: usize) {
        self.peak_sessions.fetch_max(current, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.accepted_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self, current_sessions: usize, consumers: usize) -> StatsSnapshot {
        StatsSnapshot {
            current_sessions,
            peak_sessions: self.peak_sessions.load(Ordering::Relaxed),
            consumers,
            accepted_connections: self.accepted_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }
}

impl Default for SfuStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub current_sessions: usize,
    pub peak_sessions: usize,
    pub consumers: usize,
    pub accepted_connections: u64,
    pub rejected_connections: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_only_grows() {
        let stats = SfuStats::new();
        stats.observe_sessions(3);
        stats.observe_sessions(1);
        stats.record_accepted();
        stats.record_rejected();

        let snapshot = stats.snapshot(1, 0);
        assert_eq!(snapshot.peak_sessions, 3);
        assert_eq!(snapshot.current_sessions, 1);
        assert_eq!(snapshot.accepted_connections, 1);
        assert_eq!(snapshot.rejected_connections, 1);
    }
}
