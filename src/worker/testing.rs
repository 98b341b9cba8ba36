//! In-process stand-ins for worker processes.

use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;

use super::proc::WorkerHandle;
use super::protocol::{Connection, Message, SlotIndex, WorkerId};
use super::signals::TerminationReason;
use super::spawn::{EventSink, PoolEvent, Spawn, WorkerEnv};
use crate::error::{PoolError, Result};

/// Everything the fake workers were asked to do.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    pub spawned: Vec<(SlotIndex, WorkerId, WorkerEnv)>,
    /// Worker and the peer port the connection was labelled with.
    pub delivered: Vec<(WorkerId, u16)>,
    pub terminated: Vec<WorkerId>,
}

impl Journal {
    pub fn spawn_order(&self) -> Vec<SlotIndex> {
        self.spawned.iter().map(|(slot, _, _)| *slot).collect()
    }

    pub fn latest(&self, slot: SlotIndex) -> Option<WorkerId> {
        self.spawned
            .iter()
            .rev()
            .find(|(s, _, _)| *s == slot)
            .map(|(_, id, _)| *id)
    }
}

#[derive(Default)]
struct Shared {
    journal: Mutex<Journal>,
    failing: Mutex<HashSet<SlotIndex>>,
    broken: Mutex<HashSet<WorkerId>>,
}

/// Spawner whose workers live in the test process.
///
/// In manual mode the test feeds [`PoolEvent`]s itself. In automatic mode
/// each worker reports ready as soon as it is spawned and reports a SIGTERM
/// exit when terminated, like a well-behaved subprocess.
#[derive(Clone, Default)]
pub struct FakeSpawner {
    shared: Arc<Shared>,
    next_id: Arc<Mutex<u64>>,
    automatic: bool,
}

impl FakeSpawner {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn automatic() -> Self {
        Self {
            automatic: true,
            ..Self::default()
        }
    }

    pub fn journal(&self) -> Journal {
        self.shared.journal.lock().unwrap().clone()
    }

    /// Make spawns for `slot` fail (or succeed again).
    pub fn set_failing(&self, slot: SlotIndex, failing: bool) {
        let mut set = self.shared.failing.lock().unwrap();
        if failing {
            set.insert(slot);
        } else {
            set.remove(&slot);
        }
    }

    /// Make sends to `worker` fail.
    pub fn break_worker(&self, worker: WorkerId) {
        self.shared.broken.lock().unwrap().insert(worker);
    }
}

impl Spawn for FakeSpawner {
    type Handle = FakeWorker;

    fn spawn(&mut self, slot: SlotIndex, env: &WorkerEnv, events: &EventSink) -> Result<FakeWorker> {
        if self.shared.failing.lock().unwrap().contains(&slot) {
            return Err(PoolError::Spawn {
                slot,
                message: "scripted failure".into(),
            });
        }
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            WorkerId::new(*next)
        };
        self.shared
            .journal
            .lock()
            .unwrap()
            .spawned
            .push((slot, id, env.clone()));
        if self.automatic {
            events.emit(PoolEvent::Ready { slot, worker: id });
        }
        Ok(FakeWorker {
            id,
            slot,
            shared: self.shared.clone(),
            events: self.automatic.then(|| events.clone()),
            exited: false,
        })
    }
}

pub struct FakeWorker {
    id: WorkerId,
    slot: SlotIndex,
    shared: Arc<Shared>,
    events: Option<EventSink>,
    exited: bool,
}

impl WorkerHandle for FakeWorker {
    fn identity(&self) -> WorkerId {
        self.id
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        if self.shared.broken.lock().unwrap().contains(&self.id) {
            return Err(PoolError::Worker(format!("worker {} is broken", self.id)));
        }
        if let Message::ConnectionHandoff(connection) = message {
            let port = connection.peer().map_or(0, |p| p.port());
            self.shared
                .journal
                .lock()
                .unwrap()
                .delivered
                .push((self.id, port));
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        self.shared.journal.lock().unwrap().terminated.push(self.id);
        if let Some(events) = &self.events
            && !self.exited
        {
            self.exited = true;
            events.emit(PoolEvent::Exited {
                slot: self.slot,
                worker: self.id,
                reason: TerminationReason::Signaled(Signal::SIGTERM),
            });
        }
        Ok(())
    }
}

/// A connection labelled by a fake peer port.
pub fn labelled(port: u16) -> Connection {
    let (local, _remote) = UnixStream::pair().unwrap();
    Connection::new(OwnedFd::from(local), Some(([127, 0, 0, 1], port).into()))
}
