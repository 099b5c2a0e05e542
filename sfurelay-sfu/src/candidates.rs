//! ICE candidates that arrive before the ingest transport can take them

use parking_lot::Mutex;

use crate::types::IceCandidate;

enum State {
    Buffering(Vec<IceCandidate>),
    Flushed,
}

/// Candidate queue allocated together with a session
///
/// Starts out buffering. [`drain`](Self::drain) switches it to flushed exactly
/// once; from then on [`push_or_pass`](Self::push_or_pass) hands every
/// candidate straight back to the caller.
pub struct PendingCandidates {
    state: Mutex<State>,
}

impl PendingCandidates {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State::Buffering(Vec::new())),
        }
    }

    /// Buffer the candidate, or return it if the queue was already flushed
    pub fn push_or_pass(&self, candidate: IceCandidate) -> Option<IceCandidate> {
        match &mut *self.state.lock() {
            State::Buffering(queue) => {
                queue.push(candidate);
                None
            }
            State::Flushed => Some(candidate),
        }
    }

    /// Take every buffered candidate and switch to pass-through.
    /// Returns an empty list on every call after the first.
    pub fn drain(&self) -> Vec<IceCandidate> {
        match std::mem::replace(&mut *self.state.lock(), State::Flushed) {
            State::Buffering(queue) => queue,
            State::Flushed => Vec::new(),
        }
    }

    #[must_use]
    pub fn is_flushed(&self) -> bool {
        matches!(*self.state.lock(), State::Flushed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &*self.state.lock() {
            State::Buffering(queue) => queue.len(),
            State::Flushed => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingCandidates {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn test_buffer_then_drain_once() {
        let pending = PendingCandidates::new();
        assert!(pending.push_or_pass(candidate(1)).is_none());
        assert!(pending.push_or_pass(candidate(2)).is_none());
        assert_eq!(pending.len(), 2);

        let drained = pending.drain();
        assert_eq!(drained, vec![candidate(1), candidate(2)]);
        assert!(pending.is_flushed());

        assert!(pending.drain().is_empty());
    }

    #[test]
    fn test_pass_through_after_flush() {
        let pending = PendingCandidates::new();
        pending.drain();

        assert_eq!(pending.push_or_pass(candidate(3)), Some(candidate(3)));
        assert!(pending.is_empty());
    }
}
