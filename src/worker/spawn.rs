//! Worker subprocess spawning.
//!
//! The production spawner re-executes a program (by default the current
//! executable in `worker` mode) with the slot's environment, hands it one
//! end of a packet channel as fd 3, and starts two observer threads per
//! worker: one reaps the process and reports its exit, the other reads the
//! channel and reports readiness.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use crossbeam_channel::Sender;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::wait::{Id, WaitPidFlag, waitid, waitpid};
use nix::unistd::{Pid, dup2, setpgid};

use super::ipc::Channel;
use super::proc::{Reaped, WorkerHandle, WorkerProcess};
use super::protocol::{DEFAULT_PREFIX, Message, SlotIndex, Tags, WorkerId};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{PoolError, Result};

/// Descriptor number the worker finds its channel on.
pub const CHILD_CHANNEL_FD: RawFd = 3;

/// Environment variable naming the channel descriptor.
pub const ENV_CHANNEL_FD: &str = "HANDOFF_CHANNEL_FD";
/// Environment variable carrying the worker's identity.
pub const ENV_WORKER_ID: &str = "HANDOFF_WORKER_ID";
/// Environment variable carrying the frame tag prefix.
pub const ENV_PREFIX: &str = "HANDOFF_PREFIX";
/// Environment variable carrying the slot index (set by [`default_env`]).
pub const ENV_SLOT: &str = "HANDOFF_SLOT";

/// Extra environment for one worker.
pub type WorkerEnv = BTreeMap<String, String>;

/// Computes a worker's environment from its slot. Must be deterministic.
pub type EnvFactory = Arc<dyn Fn(SlotIndex) -> WorkerEnv + Send + Sync>;

/// The default environment: just the slot index.
pub fn default_env(slot: SlotIndex) -> WorkerEnv {
    WorkerEnv::from([(ENV_SLOT.to_string(), slot.to_string())])
}

/// Notifications from worker observers to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// The worker sent its ready signal.
    Ready { slot: SlotIndex, worker: WorkerId },
    /// The worker process exited.
    Exited {
        slot: SlotIndex,
        worker: WorkerId,
        reason: TerminationReason,
    },
}

/// Where observers post [`PoolEvent`]s.
#[derive(Debug, Clone)]
pub struct EventSink(Sender<PoolEvent>);

impl EventSink {
    pub fn new(tx: Sender<PoolEvent>) -> Self {
        Self(tx)
    }

    /// Post an event. Events for a pool that has shut down are dropped.
    pub fn emit(&self, event: PoolEvent) {
        let _ = self.0.send(event);
    }
}

/// The spawn facility the supervisor consumes.
pub trait Spawn: Send + 'static {
    type Handle: WorkerHandle;

    /// Start one worker for `slot`. The spawner must arrange for the
    /// worker's readiness and exit to be posted to `events`.
    fn spawn(&mut self, slot: SlotIndex, env: &WorkerEnv, events: &EventSink)
    -> Result<Self::Handle>;

    /// Frame tag prefix of the pool; called once before the first spawn.
    /// Spawners whose workers do not speak the channel protocol ignore it.
    fn use_prefix(&mut self, _prefix: &str) {}
}

/// Spawns worker subprocesses by re-executing a program.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    tags: Tags,
    prefix: String,
    next_id: u64,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            tags: Tags::default(),
            prefix: DEFAULT_PREFIX.to_string(),
            next_id: 0,
        }
    }

    /// Spawner for the running binary's hidden `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| PoolError::Worker(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(exe).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.use_prefix(prefix);
        self
    }

    fn next_identity(&mut self) -> WorkerId {
        self.next_id += 1;
        WorkerId::new(self.next_id)
    }
}

impl Spawn for ProcessSpawner {
    type Handle = WorkerProcess;

    fn spawn(
        &mut self,
        slot: SlotIndex,
        env: &WorkerEnv,
        events: &EventSink,
    ) -> Result<WorkerProcess> {
        let id = self.next_identity();
        let (master, child_end) = Channel::pair(&self.tags)?;
        let child_fd = child_end.as_raw_fd();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(env)
            .env(ENV_WORKER_ID, id.get().to_string())
            .env(ENV_PREFIX, &self.prefix)
            .env(ENV_CHANNEL_FD, CHILD_CHANNEL_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // Safety: only async-signal-safe calls (setpgid, dup2, fcntl) between
        // fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                // Own process group, so a terminal's Ctrl+C reaches only the
                // master and workers are stopped by the pool
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                let result = if child_fd == CHILD_CHANNEL_FD {
                    // Already in place; just let it survive exec
                    fcntl(child_fd, FcntlArg::F_SETFD(FdFlag::empty())).map(drop)
                } else {
                    // dup2 leaves the new descriptor without close-on-exec
                    dup2(child_fd, CHILD_CHANNEL_FD).map(drop)
                };
                result.map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let child = cmd.spawn().map_err(|e| PoolError::Spawn {
            slot,
            message: format!("{}: {}", self.program.display(), e),
        })?;
        drop(child_end);

        let pid = Pid::from_raw(child.id() as i32);
        // Reaped by the waiter thread below
        drop(child);

        let reaped = Reaped::new();
        spawn_waiter(slot, id, pid, reaped.clone(), events.clone())?;

        let reader = master.try_clone()?;
        if let Err(e) = spawn_reader(slot, id, reader, events.clone()) {
            let mut orphan = WorkerProcess::new(id, pid, master, reaped);
            let _ = orphan.terminate();
            return Err(e);
        }

        tracing::debug!(slot, worker_id = %id, pid = pid.as_raw(), "Spawned worker process");
        Ok(WorkerProcess::new(id, pid, master, reaped))
    }

    fn use_prefix(&mut self, prefix: &str) {
        self.tags = Tags::new(prefix);
        self.prefix = prefix.to_string();
    }
}

/// Reap the worker and report its exit.
fn spawn_waiter(
    slot: SlotIndex,
    id: WorkerId,
    pid: Pid,
    reaped: Reaped,
    events: EventSink,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("handoff-wait-{}", slot))
        .spawn(move || {
            // Wait for the exit but leave the zombie, so the pid stays ours
            // until the flag is set below
            loop {
                match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        tracing::debug!(slot, worker_id = %id, error = %e, "waitid failed");
                        break;
                    }
                }
            }

            let reason = {
                let mut done = reaped.lock();
                let reason = loop {
                    match waitpid(pid, None) {
                        Ok(status) => break analyze_wait_status(status),
                        Err(Errno::EINTR) => continue,
                        Err(e) => {
                            tracing::warn!(slot, worker_id = %id, error = %e, "waitpid failed");
                            break TerminationReason::Unknown;
                        }
                    }
                };
                *done = true;
                reason
            };
            events.emit(PoolEvent::Exited {
                slot,
                worker: id,
                reason,
            });
        })?;
    Ok(())
}

/// Read the worker's channel and report its ready signal.
fn spawn_reader(slot: SlotIndex, id: WorkerId, channel: Channel, events: EventSink) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("handoff-read-{}", slot))
        .spawn(move || {
            loop {
                match channel.recv() {
                    Ok(Some(Message::ReadySignal(worker))) => {
                        if worker != id {
                            tracing::warn!(
                                slot,
                                worker_id = %id,
                                claimed = %worker,
                                "Worker signalled readiness under a different identity"
                            );
                        }
                        events.emit(PoolEvent::Ready { slot, worker });
                    }
                    Ok(Some(Message::ConnectionHandoff(_))) => {
                        tracing::warn!(slot, worker_id = %id, "Worker sent a connection back; closing it");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(slot, worker_id = %id, error = %e, "Worker channel read failed");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}
