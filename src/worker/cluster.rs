//! Thread-safe front end to a [`Supervisor`].
//!
//! The supervisor is owned by one event-loop thread. Callers send it
//! commands; worker observers send it [`PoolEvent`]s; the loop wakes on
//! either, or when a delayed revival is due.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select, unbounded};

use super::gate::ReadyCallback;
use super::protocol::{Connection, SlotIndex};
use super::spawn::{EnvFactory, EventSink, PoolEvent, ProcessSpawner, Spawn, default_env};
use super::supervisor::{PoolConfig, PoolStatus, Supervisor};
use crate::error::{PoolError, Result};

/// Longest the loop sleeps with nothing scheduled.
const IDLE_TICK: Duration = Duration::from_secs(1);

enum Command {
    Start {
        callback: ReadyCallback,
        reply: Sender<Result<()>>,
    },
    Stop {
        reply: Sender<()>,
    },
    Create {
        slot: SlotIndex,
        reply: Sender<Result<()>>,
    },
    Kill {
        slot: SlotIndex,
        reply: Sender<Result<()>>,
    },
    Entrust {
        slot: SlotIndex,
        connection: Connection,
        reply: Sender<Result<()>>,
    },
    Status {
        reply: Sender<PoolStatus>,
    },
    AbandonStartup {
        reply: Sender<PoolStatus>,
    },
    Shutdown,
}

/// A supervised pool of workers, usable from any thread.
///
/// Dropping the cluster stops the pool.
pub struct Cluster {
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    startup_timeout: Duration,
    concurrency: usize,
}

impl Cluster {
    /// Pool of this binary's own `worker` subcommand.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_env(config, Arc::new(default_env))
    }

    /// Pool of this binary's own `worker` subcommand with a custom
    /// environment factory.
    pub fn with_env(config: PoolConfig, env: EnvFactory) -> Result<Self> {
        Self::with_spawner(config, ProcessSpawner::current_exe()?, env)
    }

    /// Pool over an arbitrary spawn facility and environment factory.
    ///
    /// The spawner takes its frame tag prefix from `config`.
    pub fn with_spawner<S: Spawn>(config: PoolConfig, spawner: S, env: EnvFactory) -> Result<Self> {
        config.validate()?;
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let startup_timeout = config.startup_timeout;
        let concurrency = config.concurrency;
        let supervisor = Supervisor::new(spawner, config, env, EventSink::new(event_tx));

        let thread = std::thread::Builder::new()
            .name("handoff-supervisor".to_string())
            .spawn(move || event_loop(supervisor, command_rx, event_rx))?;

        Ok(Self {
            commands: command_tx,
            thread: Some(thread),
            startup_timeout,
            concurrency,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = bounded(1);
        self.commands
            .send(build(reply))
            .map_err(|_| PoolError::ClusterGone)?;
        response.recv().map_err(|_| PoolError::ClusterGone)
    }

    /// Spawn every worker. `callback` runs once all of them are ready.
    ///
    /// The callback runs on the cluster's own thread and must not call back
    /// into the cluster synchronously.
    pub fn start(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        let callback: ReadyCallback = Box::new(callback);
        self.request(|reply| Command::Start { callback, reply })?
    }

    /// Start and block until every worker is ready.
    ///
    /// Gives up after the configured startup timeout, stopping the pool.
    pub fn start_and_wait(&self) -> Result<()> {
        let (ready_tx, ready_rx) = bounded(1);
        self.start(move || {
            let _ = ready_tx.send(());
        })?;

        match ready_rx.recv_timeout(self.startup_timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                let status = self.abandon_startup()?;
                if status.started {
                    // Completed just after the timeout
                    return Ok(());
                }
                Err(PoolError::StartupTimeout {
                    ready: status.ready_workers(),
                    expected: status.concurrency(),
                })
            }
            // The round was cancelled by a concurrent stop
            Err(RecvTimeoutError::Disconnected) => Err(PoolError::NotRunning),
        }
    }

    /// Stop every worker. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply })
    }

    /// Spawn a fresh worker into `slot`, replacing the current one.
    pub fn create(&self, slot: SlotIndex) -> Result<()> {
        self.request(|reply| Command::Create { slot, reply })?
    }

    /// Terminate the worker in `slot`. A running pool revives it.
    pub fn kill(&self, slot: SlotIndex) -> Result<()> {
        self.request(|reply| Command::Kill { slot, reply })?
    }

    /// Hand `connection` to the worker in `slot`.
    pub fn entrust(&self, slot: SlotIndex, connection: impl Into<Connection>) -> Result<()> {
        let connection = connection.into();
        self.request(|reply| Command::Entrust {
            slot,
            connection,
            reply,
        })?
    }

    pub fn status(&self) -> Result<PoolStatus> {
        self.request(|reply| Command::Status { reply })
    }

    /// Stop the pool unless its startup round has completed, as one step on
    /// the supervisor thread. Returns the status seen before stopping.
    fn abandon_startup(&self) -> Result<PoolStatus> {
        self.request(|reply| Command::AbandonStartup { reply })
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("Supervisor thread panicked");
        }
    }
}

fn event_loop<S: Spawn>(
    mut supervisor: Supervisor<S>,
    commands: Receiver<Command>,
    events: Receiver<PoolEvent>,
) {
    loop {
        let timeout = supervisor
            .next_deadline()
            .map_or(IDLE_TICK, |due| due.saturating_duration_since(Instant::now()));

        select! {
            recv(commands) -> command => match command {
                Ok(Command::Shutdown) | Err(_) => break,
                Ok(command) => apply(&mut supervisor, command),
            },
            recv(events) -> event => {
                if let Ok(event) = event {
                    supervisor.handle_event(event, Instant::now());
                }
            },
            default(timeout) => {},
        }
        supervisor.revive_due(Instant::now());
    }

    supervisor.stop();
    tracing::debug!("Supervisor loop exited");
}

fn apply<S: Spawn>(supervisor: &mut Supervisor<S>, command: Command) {
    // Reply errors mean the caller went away; nothing to do about it
    match command {
        Command::Start { callback, reply } => {
            let _ = reply.send(supervisor.start(callback));
        }
        Command::Stop { reply } => {
            supervisor.stop();
            let _ = reply.send(());
        }
        Command::Create { slot, reply } => {
            let _ = reply.send(supervisor.create(slot));
        }
        Command::Kill { slot, reply } => {
            let _ = reply.send(supervisor.kill(slot));
        }
        Command::Entrust {
            slot,
            connection,
            reply,
        } => {
            let _ = reply.send(supervisor.entrust(slot, connection));
        }
        Command::Status { reply } => {
            let _ = reply.send(supervisor.status());
        }
        Command::AbandonStartup { reply } => {
            let status = supervisor.status();
            if !status.started {
                supervisor.stop();
            }
            let _ = reply.send(status);
        }
        Command::Shutdown => {}
    }
}
