//! Slot table, lifecycle and routing for a pool of workers.
//!
//! The [`Supervisor`] is plain single-threaded state. It never blocks:
//! worker readiness and exits arrive as [`PoolEvent`]s fed to
//! [`Supervisor::handle_event`], and delayed revivals are driven by
//! [`Supervisor::revive_due`]. [`super::cluster::Cluster`] runs it on a
//! dedicated thread.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, trace, warn};

use super::gate::{ReadinessGate, ReadyCallback};
use super::policy::{RestartDecision, RestartPolicy};
use super::proc::WorkerHandle;
use super::protocol::{Connection, DEFAULT_PREFIX, SlotIndex, WorkerId};
use super::signals::TerminationReason;
use super::slot::{Slot, SlotPhase};
use super::spawn::{EnvFactory, EventSink, PoolEvent, Spawn};
use crate::error::{PoolError, Result};

/// Retry delay after a replacement worker failed to spawn.
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker slots.
    pub concurrency: usize,
    /// Prefix of the channel frame tags.
    pub prefix: String,
    /// How exited workers are revived.
    pub restart: RestartPolicy,
    /// How long [`super::cluster::Cluster::start_and_wait`] waits for every
    /// worker to become ready.
    pub startup_timeout: Duration,
    /// Connections queued per slot while it has no ready worker.
    pub max_pending: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            prefix: DEFAULT_PREFIX.to_string(),
            restart: RestartPolicy::default(),
            startup_timeout: Duration::from_secs(30),
            max_pending: 64,
        }
    }
}

impl PoolConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(PoolError::Config(
                "Pool needs at least one worker".to_string(),
            ));
        }
        if self.prefix.is_empty() {
            return Err(PoolError::Config(
                "Frame tag prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub index: SlotIndex,
    pub worker: Option<WorkerId>,
    pub phase: SlotPhase,
    pub pending: usize,
    pub restarts: u64,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub running: bool,
    /// Whether the current startup round has completed.
    pub started: bool,
    pub slots: Vec<SlotStatus>,
}

impl PoolStatus {
    pub fn concurrency(&self) -> usize {
        self.slots.len()
    }

    /// Slots whose worker has signalled ready.
    pub fn ready_workers(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.phase == SlotPhase::Ready)
            .count()
    }
}

/// Owns the slot table and every decision about it.
pub struct Supervisor<S: Spawn> {
    spawner: S,
    env: EnvFactory,
    config: PoolConfig,
    events: EventSink,
    slots: Vec<Slot<S::Handle>>,
    running: bool,
    gate: ReadinessGate,
}

impl<S: Spawn> Supervisor<S> {
    /// Build a stopped supervisor. Workers post their events to `events`.
    ///
    /// The spawner is switched to the configured frame tag prefix.
    pub fn new(mut spawner: S, config: PoolConfig, env: EnvFactory, events: EventSink) -> Self {
        spawner.use_prefix(&config.prefix);
        let slots = (0..config.concurrency).map(Slot::new).collect();
        Self {
            spawner,
            env,
            config,
            events,
            slots,
            running: false,
            gate: ReadinessGate::new(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.slots.len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Identity of the worker currently filling `index`.
    pub fn identity(&self, index: SlotIndex) -> Option<WorkerId> {
        self.slots.get(index).and_then(Slot::identity)
    }

    fn check_index(&self, index: SlotIndex) -> Result<()> {
        if index < self.slots.len() {
            Ok(())
        } else {
            Err(PoolError::InvalidSlot {
                index,
                size: self.slots.len(),
            })
        }
    }

    /// Spawn every worker. `callback` runs once, when all of them have
    /// signalled ready.
    ///
    /// If any spawn fails the pool is stopped again and the error returned;
    /// the callback is dropped without running.
    #[instrument(level = "debug", skip(self, callback), fields(workers = self.slots.len()))]
    pub fn start(&mut self, callback: ReadyCallback) -> Result<()> {
        if self.running {
            return Err(PoolError::AlreadyRunning);
        }
        info!(workers = self.slots.len(), "Starting worker pool");

        self.running = true;
        // Fresh restart history for every run
        self.slots = (0..self.slots.len()).map(Slot::new).collect();
        self.gate.begin(self.slots.len(), callback);

        if let Err(e) = self.create_all() {
            error!(error = %e, "Worker pool failed to start");
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Stop every worker. Exits observed afterwards are not revived, and
    /// queued connections are closed. Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!(workers = self.slots.len(), "Stopping worker pool");

        self.running = false;
        self.gate.cancel();
        self.kill_all();
        for slot in &mut self.slots {
            let dropped = slot.vacate();
            if dropped > 0 {
                warn!(
                    slot = slot.index(),
                    dropped, "Closed queued connections on shutdown"
                );
            }
        }
    }

    /// Spawn a worker into `index`, replacing whatever is there.
    ///
    /// The current worker is only terminated once its replacement has
    /// spawned; if the spawn fails the slot is left as it was.
    pub fn create(&mut self, index: SlotIndex) -> Result<()> {
        self.check_index(index)?;
        let env = (self.env)(index);
        let handle = self.spawner.spawn(index, &env, &self.events)?;

        if let Some(mut old) = self.slots[index].take_handle() {
            self.gate.forget(old.identity());
            if let Err(e) = old.terminate() {
                warn!(slot = index, error = %e, "Failed to terminate replaced worker");
            }
        }

        info!(slot = index, worker_id = %handle.identity(), "Worker started");
        self.slots[index].occupy(handle);
        Ok(())
    }

    /// Ask the worker in `index` to terminate. Whether it comes back depends
    /// on whether the pool is running when the exit is observed.
    pub fn kill(&mut self, index: SlotIndex) -> Result<()> {
        self.check_index(index)?;
        match self.slots[index].handle_mut() {
            Some(handle) => {
                debug!(slot = index, worker_id = %handle.identity(), "Terminating worker");
                handle.terminate()
            }
            None => Ok(()),
        }
    }

    fn create_all(&mut self) -> Result<()> {
        for index in (0..self.slots.len()).rev() {
            self.create(index)?;
        }
        Ok(())
    }

    fn kill_all(&mut self) {
        for index in (0..self.slots.len()).rev() {
            if let Err(e) = self.kill(index) {
                warn!(slot = index, error = %e, "Failed to terminate worker");
            }
        }
    }

    /// Route a connection to the worker in `index`.
    ///
    /// With no ready worker in the slot the connection is queued until one
    /// is; a full queue, a disabled slot, a stopped pool or an out of range
    /// index are errors, and the connection is closed.
    pub fn entrust(&mut self, index: SlotIndex, connection: Connection) -> Result<()> {
        self.check_index(index)?;
        if !self.running {
            return Err(PoolError::NotRunning);
        }
        let slot = &mut self.slots[index];
        trace!(
            slot = index,
            worker_id = ?slot.identity(),
            peer = ?connection.peer(),
            phase = %slot.phase(),
            "Entrusting connection"
        );
        slot.entrust(connection, self.config.max_pending)
    }

    /// Apply one observer event.
    pub fn handle_event(&mut self, event: PoolEvent, now: Instant) {
        match event {
            PoolEvent::Ready { slot, worker } => self.on_ready(slot, worker),
            PoolEvent::Exited {
                slot,
                worker,
                reason,
            } => self.on_exit(slot, worker, reason, now),
        }
    }

    fn on_ready(&mut self, index: SlotIndex, worker: WorkerId) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if slot.identity() != Some(worker) {
            trace!(slot = index, worker_id = %worker, "Ignoring ready signal from stale worker");
            return;
        }
        if !slot.mark_ready() {
            return;
        }
        let flushed = slot.flush();
        info!(slot = index, worker_id = %worker, flushed, "Worker ready");

        if let Some(callback) = self.gate.observe(worker) {
            info!(workers = self.slots.len(), "All workers ready");
            callback();
        }
    }

    fn on_exit(
        &mut self,
        index: SlotIndex,
        worker: WorkerId,
        reason: TerminationReason,
        now: Instant,
    ) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if slot.identity() != Some(worker) {
            trace!(slot = index, worker_id = %worker, reason = %reason, "Ignoring exit of stale worker");
            return;
        }
        slot.take_handle();
        self.gate.forget(worker);

        if !self.running {
            slot.vacate();
            debug!(slot = index, worker_id = %worker, reason = %reason, "Worker stopped");
            return;
        }

        if reason.is_clean() {
            info!(slot = index, worker_id = %worker, reason = %reason, "Worker exited");
        } else {
            warn!(
                slot = index,
                worker_id = %worker,
                reason = %reason,
                crash = reason.is_crash(),
                "Worker died unexpectedly"
            );
        }
        self.revive(index, now);
    }

    fn revive(&mut self, index: SlotIndex, now: Instant) {
        match self.slots[index].record_restart(&self.config.restart, now) {
            RestartDecision::Now => self.respawn(index, now),
            RestartDecision::After(delay) => {
                info!(
                    slot = index,
                    delay_ms = delay.as_millis() as u64,
                    "Reviving worker after backoff"
                );
                self.slots[index].schedule_revival(now + delay);
            }
            RestartDecision::GiveUp { restarts } => self.disable(index, restarts),
        }
    }

    fn respawn(&mut self, index: SlotIndex, now: Instant) {
        let Err(e) = self.create(index) else {
            return;
        };
        warn!(slot = index, error = %e, "Failed to spawn replacement worker");
        match self.slots[index].record_restart(&self.config.restart, now) {
            RestartDecision::GiveUp { restarts } => self.disable(index, restarts),
            RestartDecision::Now => self.slots[index].schedule_revival(now + SPAWN_RETRY_DELAY),
            RestartDecision::After(delay) => self
                .slots[index]
                .schedule_revival(now + delay.max(SPAWN_RETRY_DELAY)),
        }
    }

    fn disable(&mut self, index: SlotIndex, restarts: u32) {
        let dropped = self.slots[index].fail();
        error!(
            slot = index,
            restarts,
            dropped,
            window_secs = self.config.restart.window.as_secs(),
            "Restart budget exhausted; slot disabled"
        );
    }

    /// Earliest scheduled revival, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().filter_map(Slot::revive_due).min()
    }

    /// Spawn replacements whose backoff has elapsed.
    pub fn revive_due(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        for index in 0..self.slots.len() {
            if self.slots[index].revive_due().is_some_and(|due| due <= now) {
                self.respawn(index, now);
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            running: self.running,
            started: self.gate.is_complete(),
            slots: self
                .slots
                .iter()
                .map(|slot| SlotStatus {
                    index: slot.index(),
                    worker: slot.identity(),
                    phase: slot.phase(),
                    pending: slot.pending(),
                    restarts: slot.restarts().total(),
                })
                .collect(),
        }
    }
}
