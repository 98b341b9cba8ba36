//! Worker side of the pool.
//!
//! Runs inside each worker process: binds the wrapped server on an
//! ephemeral local port, tells the master it is ready, then feeds every
//! connection the master hands over into the server as if the server had
//! accepted it itself.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::thread::JoinHandle;

use nix::fcntl::{FcntlArg, fcntl};
use tracing::{debug, info, trace, warn};

use super::ipc::Channel;
use super::protocol::{Message, SlotIndex, Tags, WorkerId};
use super::spawn::{ENV_CHANNEL_FD, ENV_PREFIX, ENV_SLOT, ENV_WORKER_ID};
use crate::error::{PoolError, Result};

/// The wrapped server only ever listens here.
pub const LOCAL_HOST: &str = "127.0.0.1";

/// A server a worker runs and injects handed-off connections into.
pub trait LocalServer: Send + 'static {
    /// Start listening on `host:port` and return the bound address.
    fn listen(&mut self, host: &str, port: u16) -> io::Result<SocketAddr>;

    /// Serve one connection as though it had been accepted locally.
    /// Must not block for the lifetime of the connection.
    fn connection(&mut self, stream: TcpStream);
}

/// What a worker learns about itself from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub worker: WorkerId,
    pub slot: Option<SlotIndex>,
    pub prefix: String,
    pub channel_fd: RawFd,
}

impl WorkerContext {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| {
                PoolError::Config(format!(
                    "{} is not set; worker mode is only started by the pool",
                    key
                ))
            })
        };

        let channel_fd = required(ENV_CHANNEL_FD)?
            .parse()
            .map_err(|e| PoolError::Config(format!("Invalid {}: {}", ENV_CHANNEL_FD, e)))?;
        let worker = required(ENV_WORKER_ID)?
            .parse()
            .map_err(|e| PoolError::Config(format!("Invalid {}: {}", ENV_WORKER_ID, e)))?;
        let prefix = required(ENV_PREFIX)?;
        let slot = lookup(ENV_SLOT).and_then(|s| s.parse().ok());

        Ok(Self {
            worker,
            slot,
            prefix,
            channel_fd,
        })
    }

    /// Take ownership of the master channel.
    pub fn open_channel(&self) -> Result<Channel> {
        // Refuse to adopt a descriptor that is not open
        fcntl(self.channel_fd, FcntlArg::F_GETFD).map_err(|e| {
            PoolError::Config(format!(
                "Channel descriptor {} is unusable: {}",
                self.channel_fd, e
            ))
        })?;
        // Safety: the spawner placed the channel on this descriptor for us
        // and nothing else in this process owns it.
        Ok(unsafe { Channel::from_raw(self.channel_fd, Tags::new(&self.prefix)) })
    }
}

/// A running worker agent.
#[derive(Debug)]
pub struct WorkerAgent {
    worker: WorkerId,
    local_addr: SocketAddr,
    thread: JoinHandle<Result<()>>,
}

impl WorkerAgent {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Where the wrapped server is listening.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until the master channel closes.
    pub fn wait(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| PoolError::Worker("Worker receive loop panicked".to_string()))?
    }
}

/// Serve `server` inside a worker started by the pool.
pub fn serve<L: LocalServer>(server: L) -> Result<WorkerAgent> {
    let context = WorkerContext::from_env()?;
    let channel = context.open_channel()?;
    serve_on(channel, context.worker, server)
}

/// Serve `server` over an explicit master channel.
///
/// Returns once the server is bound and the ready signal has been sent.
pub fn serve_on<L: LocalServer>(
    channel: Channel,
    worker: WorkerId,
    mut server: L,
) -> Result<WorkerAgent> {
    let local_addr = server.listen(LOCAL_HOST, 0)?;
    debug!(worker_id = %worker, addr = %local_addr, "Local server listening");

    channel.send(&Message::ReadySignal(worker))?;

    let thread = std::thread::Builder::new()
        .name("handoff-agent".to_string())
        .spawn(move || receive_loop(channel, worker, server))?;

    Ok(WorkerAgent {
        worker,
        local_addr,
        thread,
    })
}

fn receive_loop<L: LocalServer>(channel: Channel, worker: WorkerId, mut server: L) -> Result<()> {
    loop {
        match channel.recv()? {
            Some(Message::ConnectionHandoff(connection)) => {
                let peer = connection.peer();
                let stream = connection.into_tcp_stream();
                // The master's listener may have been non-blocking
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(worker_id = %worker, error = %e, "Failed to resume handed-off connection");
                    continue;
                }
                trace!(worker_id = %worker, peer = ?peer, "Accepted handed-off connection");
                server.connection(stream);
            }
            Some(Message::ReadySignal(_)) => {
                trace!(worker_id = %worker, "Ignoring ready signal from master");
            }
            None => {
                info!(worker_id = %worker, "Master channel closed");
                return Ok(());
            }
        }
    }
}

/// Run a worker process to completion.
///
/// Exits 0 when the master goes away and 1 on any error. Termination by
/// the master is SIGTERM's default action.
pub fn run_worker_main<L: LocalServer>(server: L) -> ! {
    // Write errors on dead peers are handled as io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    match serve(server).and_then(WorkerAgent::wait) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}
