//! WebSocket liveness tracking
//!
//! Pure state machine; the connection loop owns the timers and feeds it ticks
//! and pongs.

use std::time::Duration;
use tokio::time::Instant;

/// What the connection should do on a heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    Ping,
    /// The previous ping was never answered
    Expired,
}

#[derive(Debug)]
pub struct Heartbeat {
    pong_timeout: Option<Duration>,
    awaiting_since: Option<Instant>,
}

impl Heartbeat {
    #[must_use]
    pub const fn new(pong_timeout: Option<Duration>) -> Self {
        Self {
            pong_timeout,
            awaiting_since: None,
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> Beat {
        if self.awaiting_since.is_some() {
            return Beat::Expired;
        }
        self.awaiting_since = Some(now);
        Beat::Ping
    }

    pub fn on_pong(&mut self) {
        self.awaiting_since = None;
    }

    /// When the outstanding ping times out, if one is outstanding and a pong
    /// timeout is configured
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        Some(self.awaiting_since? + self.pong_timeout?)
    }

    #[must_use]
    pub const fn is_awaiting_pong(&self) -> bool {
        self.awaiting_since.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unanswered_ping_expires_on_next_tick() {
        let mut heartbeat = Heartbeat::new(None);
        let now = Instant::now();

        assert_eq!(heartbeat.on_tick(now), Beat::Ping);
        assert!(heartbeat.is_awaiting_pong());
        assert_eq!(heartbeat.on_tick(now), Beat::Expired);
    }

    #[test]
    fn test_pong_resets_cycle() {
        let mut heartbeat = Heartbeat::new(None);
        let now = Instant::now();

        assert_eq!(heartbeat.on_tick(now), Beat::Ping);
        heartbeat.on_pong();
        assert_eq!(heartbeat.on_tick(now), Beat::Ping);
    }

    #[test]
    fn test_deadline_only_while_awaiting_with_timeout() {
        let now = Instant::now();

        let mut without_timeout = Heartbeat::new(None);
        without_timeout.on_tick(now);
        assert_eq!(without_timeout.deadline(), None);

        let mut with_timeout = Heartbeat::new(Some(Duration::from_secs(5)));
        assert_eq!(with_timeout.deadline(), None);
        with_timeout.on_tick(now);
        assert_eq!(with_timeout.deadline(), Some(now + Duration::from_secs(5)));
        with_timeout.on_pong();
        assert_eq!(with_timeout.deadline(), None);
    }
}
