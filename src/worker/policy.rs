//! Restart budget and backoff for reviving workers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How aggressively a slot is revived after its worker exits.
///
/// Restarts are counted over a sliding window. The first restart in a
/// window is immediate; each further one waits twice as long as the last,
/// starting at `initial_backoff` and capped at `max_backoff`. Once a slot
/// has used `max_restarts` within the window it is given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RestartPolicy {
    /// Revive immediately, forever.
    pub fn unbounded() -> Self {
        Self {
            max_restarts: u32::MAX,
            window: Duration::from_secs(60),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before the `attempt`-th restart within the window (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// What to do about a worker that just exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Now,
    After(Duration),
    GiveUp { restarts: u32 },
}

/// Restart history of one slot.
#[derive(Debug, Default, Clone)]
pub struct RestartTracker {
    recent: VecDeque<Instant>,
    total: u64,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an exit at `now` and decide how to revive.
    pub fn record(&mut self, policy: &RestartPolicy, now: Instant) -> RestartDecision {
        while let Some(oldest) = self.recent.front() {
            if now.saturating_duration_since(*oldest) >= policy.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        let used = self.recent.len() as u32;
        if used >= policy.max_restarts {
            return RestartDecision::GiveUp { restarts: used };
        }

        self.recent.push_back(now);
        self.total += 1;
        let delay = policy.backoff(used + 1);
        if delay.is_zero() {
            RestartDecision::Now
        } else {
            RestartDecision::After(delay)
        }
    }

    /// Restarts within the current window.
    pub fn recent(&self) -> usize {
        self.recent.len()
    }

    /// Restarts over the slot's lifetime.
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            max_restarts: 4,
            window: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::ZERO);
        assert_eq!(p.backoff(2), Duration::from_millis(100));
        assert_eq!(p.backoff(3), Duration::from_millis(200));
        assert_eq!(p.backoff(4), Duration::from_millis(300));
        assert_eq!(p.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_first_restart_is_immediate() {
        let mut tracker = RestartTracker::new();
        assert_eq!(
            tracker.record(&policy(), Instant::now()),
            RestartDecision::Now
        );
        assert_eq!(tracker.total(), 1);
    }

    #[test]
    fn test_budget_exhaustion() {
        let p = policy();
        let mut tracker = RestartTracker::new();
        let start = Instant::now();

        assert_eq!(tracker.record(&p, start), RestartDecision::Now);
        assert_eq!(
            tracker.record(&p, start),
            RestartDecision::After(Duration::from_millis(100))
        );
        assert_eq!(
            tracker.record(&p, start),
            RestartDecision::After(Duration::from_millis(200))
        );
        assert_eq!(
            tracker.record(&p, start),
            RestartDecision::After(Duration::from_millis(300))
        );
        assert_eq!(
            tracker.record(&p, start),
            RestartDecision::GiveUp { restarts: 4 }
        );
    }

    #[test]
    fn test_window_slides() {
        let p = policy();
        let mut tracker = RestartTracker::new();
        let start = Instant::now();
        for _ in 0..4 {
            tracker.record(&p, start);
        }

        let later = start + p.window;
        assert_eq!(tracker.record(&p, later), RestartDecision::Now);
        assert_eq!(tracker.recent(), 1);
        assert_eq!(tracker.total(), 5);
    }

    #[test]
    fn test_unbounded_never_waits() {
        let p = RestartPolicy::unbounded();
        let mut tracker = RestartTracker::new();
        let now = Instant::now();
        for _ in 0..1000 {
            assert_eq!(tracker.record(&p, now), RestartDecision::Now);
        }
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(attempt in 1u32..64) {
            let p = policy();
            prop_assert!(p.backoff(attempt) <= p.backoff(attempt + 1));
            prop_assert!(p.backoff(attempt) <= p.max_backoff);
        }

        #[test]
        fn never_exceeds_budget_in_window(exits in 1usize..50) {
            let p = policy();
            let mut tracker = RestartTracker::new();
            let now = Instant::now();
            let granted = (0..exits)
                .filter(|_| !matches!(tracker.record(&p, now), RestartDecision::GiveUp { .. }))
                .count();
            prop_assert_eq!(granted, exits.min(p.max_restarts as usize));
        }
    }
}
