//! Per-slot worker state machine.
//!
//! ```text
//!            occupy             ready
//!   Vacant ─────────▶ Starting ───────▶ Ready
//!      ▲                 │                │ send failed
//!      │ vacate          │ exit           ▼
//!      │                 ▼             Stopping
//!      └──────────── (revive) ◀──────────┘ exit
//!                     │     │
//!             backoff │     │ budget spent
//!                     ▼     ▼
//!               Reviving   Failed
//! ```
//!
//! Connections entrusted while a slot has no ready worker are queued and
//! delivered in order once the next worker signals ready.

use std::collections::VecDeque;
use std::time::Instant;

use super::policy::{RestartDecision, RestartPolicy, RestartTracker};
use super::proc::WorkerHandle;
use super::protocol::{Connection, Message, SlotIndex, WorkerId};
use crate::error::{PoolError, Result};

/// Externally visible phase of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// No worker; the pool is stopped.
    Vacant,
    /// Spawned, waiting for the ready signal.
    Starting,
    /// Accepting handoffs.
    Ready,
    /// Channel broke; termination requested, waiting for the exit.
    Stopping,
    /// Worker exited; replacement scheduled.
    Reviving,
    /// Restart budget exhausted.
    Failed,
}

impl std::fmt::Display for SlotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Vacant => "vacant",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Reviving => "reviving",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

enum SlotState<H> {
    Vacant,
    Starting(H),
    Ready(H),
    Stopping(H),
    Reviving { due: Instant },
    Failed,
}

/// One position in the pool and the worker currently filling it.
pub struct Slot<H: WorkerHandle> {
    index: SlotIndex,
    state: SlotState<H>,
    pending: VecDeque<Connection>,
    restarts: RestartTracker,
}

impl<H: WorkerHandle> Slot<H> {
    pub fn new(index: SlotIndex) -> Self {
        Self {
            index,
            state: SlotState::Vacant,
            pending: VecDeque::new(),
            restarts: RestartTracker::new(),
        }
    }

    pub fn index(&self) -> SlotIndex {
        self.index
    }

    pub fn phase(&self) -> SlotPhase {
        match self.state {
            SlotState::Vacant => SlotPhase::Vacant,
            SlotState::Starting(_) => SlotPhase::Starting,
            SlotState::Ready(_) => SlotPhase::Ready,
            SlotState::Stopping(_) => SlotPhase::Stopping,
            SlotState::Reviving { .. } => SlotPhase::Reviving,
            SlotState::Failed => SlotPhase::Failed,
        }
    }

    fn handle(&self) -> Option<&H> {
        match &self.state {
            SlotState::Starting(h) | SlotState::Ready(h) | SlotState::Stopping(h) => Some(h),
            _ => None,
        }
    }

    pub fn handle_mut(&mut self) -> Option<&mut H> {
        match &mut self.state {
            SlotState::Starting(h) | SlotState::Ready(h) | SlotState::Stopping(h) => Some(h),
            _ => None,
        }
    }

    /// Identity of the live worker, if any.
    pub fn identity(&self) -> Option<WorkerId> {
        self.handle().map(|h| h.identity())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn restarts(&self) -> &RestartTracker {
        &self.restarts
    }

    /// When a scheduled revival is due.
    pub fn revive_due(&self) -> Option<Instant> {
        match self.state {
            SlotState::Reviving { due } => Some(due),
            _ => None,
        }
    }

    /// Install a freshly spawned worker.
    pub fn occupy(&mut self, handle: H) {
        self.state = SlotState::Starting(handle);
    }

    /// Promote a starting worker to ready. Returns false if the slot was
    /// not waiting for a ready signal.
    pub fn mark_ready(&mut self) -> bool {
        match std::mem::replace(&mut self.state, SlotState::Vacant) {
            SlotState::Starting(h) => {
                self.state = SlotState::Ready(h);
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    /// Hand a connection to this slot's worker, or queue it until there is
    /// a ready one.
    pub fn entrust(&mut self, connection: Connection, capacity: usize) -> Result<()> {
        let connection = match &mut self.state {
            SlotState::Ready(handle) => {
                let message = Message::ConnectionHandoff(connection);
                let Err(e) = handle.send(&message) else {
                    return Ok(());
                };
                tracing::warn!(
                    slot = self.index,
                    worker_id = %handle.identity(),
                    error = %e,
                    "Handoff failed; queueing until the slot is revived"
                );
                let Message::ConnectionHandoff(connection) = message else {
                    unreachable!("handoff message holds a connection")
                };
                self.degrade();
                connection
            }
            SlotState::Failed => return Err(PoolError::StaleWorker(self.index)),
            SlotState::Vacant => return Err(PoolError::NotRunning),
            _ => connection,
        };
        self.enqueue(connection, capacity)
    }

    fn enqueue(&mut self, connection: Connection, capacity: usize) -> Result<()> {
        if self.pending.len() >= capacity {
            return Err(PoolError::HandoffQueueFull {
                slot: self.index,
                capacity,
            });
        }
        self.pending.push_back(connection);
        Ok(())
    }

    /// Deliver queued connections to a ready worker, oldest first.
    /// Returns how many were delivered.
    pub fn flush(&mut self) -> usize {
        let mut delivered = 0;
        while let SlotState::Ready(handle) = &mut self.state {
            let Some(connection) = self.pending.pop_front() else {
                break;
            };
            let message = Message::ConnectionHandoff(connection);
            if let Err(e) = handle.send(&message) {
                tracing::warn!(
                    slot = self.index,
                    worker_id = %handle.identity(),
                    error = %e,
                    "Queued handoff failed"
                );
                if let Message::ConnectionHandoff(connection) = message {
                    self.pending.push_front(connection);
                }
                self.degrade();
                break;
            }
            delivered += 1;
        }
        delivered
    }

    /// The worker's channel is unusable: ask it to exit so the slot gets
    /// revived, and route to the queue meanwhile.
    fn degrade(&mut self) {
        match std::mem::replace(&mut self.state, SlotState::Vacant) {
            SlotState::Ready(mut handle) => {
                if let Err(e) = handle.terminate() {
                    tracing::warn!(slot = self.index, error = %e, "Failed to terminate broken worker");
                }
                self.state = SlotState::Stopping(handle);
            }
            other => self.state = other,
        }
    }

    /// Remove the worker after its exit. The queue is kept for the
    /// replacement.
    pub fn take_handle(&mut self) -> Option<H> {
        match std::mem::replace(&mut self.state, SlotState::Vacant) {
            SlotState::Starting(h) | SlotState::Ready(h) | SlotState::Stopping(h) => Some(h),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Count a revival against the restart budget.
    pub fn record_restart(&mut self, policy: &RestartPolicy, now: Instant) -> RestartDecision {
        self.restarts.record(policy, now)
    }

    pub fn schedule_revival(&mut self, due: Instant) {
        self.state = SlotState::Reviving { due };
    }

    /// Give up on the slot. Queued connections are closed; returns how many.
    pub fn fail(&mut self) -> usize {
        self.state = SlotState::Failed;
        self.drain()
    }

    /// Empty the slot on shutdown. Queued connections are closed; returns
    /// how many.
    pub fn vacate(&mut self) -> usize {
        self.state = SlotState::Vacant;
        self.drain()
    }

    fn drain(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}
