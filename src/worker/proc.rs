//! Handles to live worker processes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::ipc::Channel;
use super::protocol::{Message, WorkerId};
use crate::error::{PoolError, Result};

/// What the supervisor needs from one spawned worker.
///
/// Exit and readiness are not polled through the handle; the spawner
/// reports them as [`super::spawn::PoolEvent`]s.
pub trait WorkerHandle: Send + 'static {
    /// Identity assigned at spawn.
    fn identity(&self) -> WorkerId;

    /// Deliver a message. On error the message (and any connection in it)
    /// is still owned by the caller.
    fn send(&mut self, message: &Message) -> Result<()>;

    /// Ask the worker to terminate. Does not wait.
    fn terminate(&mut self) -> Result<()>;
}

/// Whether a worker process has been reaped.
///
/// Shared between the handle and the thread that reaps the process. The
/// reaper holds the lock across `waitpid`, and signals are only sent under
/// the lock while the flag is clear, so they never reach a recycled pid.
#[derive(Debug, Clone, Default)]
pub struct Reaped(Arc<Mutex<bool>>);

impl Reaped {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, bool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }
}

/// Handle to a worker subprocess.
#[derive(Debug)]
pub struct WorkerProcess {
    id: WorkerId,
    pid: Pid,
    channel: Channel,
    reaped: Reaped,
}

impl WorkerProcess {
    pub fn new(id: WorkerId, pid: Pid, channel: Channel, reaped: Reaped) -> Self {
        Self {
            id,
            pid,
            channel,
            reaped,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the process has exited and been reaped.
    pub fn has_exited(&self) -> bool {
        self.reaped.is_set()
    }
}

impl WorkerHandle for WorkerProcess {
    fn identity(&self) -> WorkerId {
        self.id
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        if self.has_exited() {
            return Err(PoolError::Worker(format!(
                "Worker {} (pid {}) has exited",
                self.id, self.pid
            )));
        }
        self.channel.send(message)
    }

    /// Send SIGTERM.
    fn terminate(&mut self) -> Result<()> {
        // A reaped pid may already belong to someone else
        let reaped = self.reaped.lock();
        if *reaped {
            return Ok(());
        }
        match signal::kill(self.pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(PoolError::Worker(format!(
                "Failed to send SIGTERM to worker {} (pid {}): {}",
                self.id, self.pid, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::Tags;
    use nix::sys::wait::{WaitStatus, waitpid};
    use std::process::Command;

    #[test]
    fn test_terminate_sends_sigterm() {
        let child = Command::new("sleep").arg("60").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let (channel, _peer) = Channel::pair(&Tags::default()).unwrap();
        let mut proc = WorkerProcess::new(
            WorkerId::new(1),
            pid,
            channel,
            Reaped::new(),
        );

        proc.terminate().unwrap();
        let status = waitpid(pid, None).unwrap();
        assert_eq!(status, WaitStatus::Signaled(pid, Signal::SIGTERM, false));
    }

    #[test]
    fn test_reaped_worker_is_not_signalled() {
        let (channel, _peer) = Channel::pair(&Tags::default()).unwrap();
        let reaped = Reaped::new();
        *reaped.lock() = true;
        let mut proc = WorkerProcess::new(
            WorkerId::new(2),
            // pid 1 would be an error (EPERM) if we actually signalled it
            Pid::from_raw(1),
            channel,
            reaped,
        );

        assert!(proc.has_exited());
        proc.terminate().unwrap();
        assert!(proc.send(&Message::ReadySignal(WorkerId::new(2))).is_err());
    }
}
