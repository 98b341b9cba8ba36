//! Startup readiness tracking.

use std::collections::HashSet;

use super::protocol::WorkerId;

/// Invoked once when every worker of a startup round is ready.
pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

enum Round {
    Idle,
    Pending(ReadyCallback),
    Complete,
}

/// Counts distinct ready signals for one startup round and releases the
/// round's callback when the count reaches the pool's concurrency.
///
/// The caller decides which signals are eligible (the supervisor only
/// forwards signals from identities currently in its table); the gate
/// itself ignores duplicates and anything outside a pending round.
pub struct ReadinessGate {
    expected: usize,
    seen: HashSet<WorkerId>,
    round: Round,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            expected: 0,
            seen: HashSet::new(),
            round: Round::Idle,
        }
    }

    /// Open a new round, discarding any previous one.
    pub fn begin(&mut self, expected: usize, callback: ReadyCallback) {
        self.expected = expected;
        self.seen.clear();
        self.round = Round::Pending(callback);
    }

    /// Count a ready signal. Returns the callback if this signal completed
    /// the round; the caller invokes it.
    pub fn observe(&mut self, worker: WorkerId) -> Option<ReadyCallback> {
        if !matches!(self.round, Round::Pending(_)) {
            return None;
        }
        self.seen.insert(worker);
        if self.seen.len() < self.expected {
            return None;
        }
        match std::mem::replace(&mut self.round, Round::Complete) {
            Round::Pending(callback) => Some(callback),
            _ => None,
        }
    }

    /// Uncount a worker that died before the round completed.
    pub fn forget(&mut self, worker: WorkerId) {
        if matches!(self.round, Round::Pending(_)) {
            self.seen.remove(&worker);
        }
    }

    /// Abandon the round without firing.
    pub fn cancel(&mut self) {
        self.seen.clear();
        self.round = Round::Idle;
    }

    pub fn ready_count(&self) -> usize {
        self.seen.len()
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.round, Round::Pending(_))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.round, Round::Complete)
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadinessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let round = match self.round {
            Round::Idle => "idle",
            Round::Pending(_) => "pending",
            Round::Complete => "complete",
        };
        f.debug_struct("ReadinessGate")
            .field("expected", &self.expected)
            .field("ready", &self.seen.len())
            .field("round", &round)
            .finish()
    }
}
