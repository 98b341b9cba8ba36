//! Messages exchanged between the master and its workers.
//!
//! Every frame is one JSON object carried in a single packet on the
//! worker's channel. Frames are distinguished by a `tag` built from a
//! configurable prefix, so a channel shared with other traffic only reacts
//! to its own frames. A handoff frame carries the connection itself as an
//! attached file descriptor (see [`super::ipc`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::error::Result;

/// Default tag prefix for pool frames.
pub const DEFAULT_PREFIX: &str = "handoff:";

/// Fixed suffix of the connection handoff tag.
pub const HANDOFF_SUFFIX: &str = "connection";

/// Fixed suffix of the readiness tag.
pub const READY_SUFFIX: &str = "ready";

/// Position of a worker in the pool, in `0..concurrency`.
///
/// A slot outlives the processes that occupy it.
pub type SlotIndex = usize;

/// Identity of one spawned worker process.
///
/// Assigned by the spawner and never reused, so a revived slot always gets
/// a new identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim_start_matches('#').parse().map(Self)
    }
}

/// An accepted network connection in transit to a worker.
///
/// Owning a `Connection` means owning the socket: once it has been handed
/// off, dropping the master's copy leaves the worker as the only holder.
#[derive(Debug)]
pub struct Connection {
    fd: OwnedFd,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(fd: OwnedFd, peer: Option<SocketAddr>) -> Self {
        Self { fd, peer }
    }

    /// Remote address, if known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Reclaim the socket as a TCP stream.
    pub fn into_tcp_stream(self) -> TcpStream {
        TcpStream::from(self.fd)
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl From<TcpStream> for Connection {
    fn from(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            fd: OwnedFd::from(stream),
            peer,
        }
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A decoded pool message.
#[derive(Debug)]
pub enum Message {
    /// Master to worker: take ownership of this connection.
    ConnectionHandoff(Connection),
    /// Worker to master: local listener is bound, ready for handoffs.
    ReadySignal(WorkerId),
}

/// Wire form of a message. The connection itself travels out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
}

/// What a frame announced, before any attached descriptor is joined to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Handoff { peer: Option<SocketAddr> },
    Ready(WorkerId),
}

/// The pair of tags a pool uses on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tags {
    handoff: String,
    ready: String,
}

impl Tags {
    pub fn new(prefix: &str) -> Self {
        Self {
            handoff: format!("{prefix}{HANDOFF_SUFFIX}"),
            ready: format!("{prefix}{READY_SUFFIX}"),
        }
    }

    pub fn handoff(&self) -> &str {
        &self.handoff
    }

    pub fn ready(&self) -> &str {
        &self.ready
    }

    /// Serialize the wire frame for `message`.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let frame = match message {
            Message::ConnectionHandoff(connection) => Frame {
                tag: self.handoff.clone(),
                worker: None,
                peer: connection.peer().map(|addr| addr.to_string()),
            },
            Message::ReadySignal(worker) => Frame {
                tag: self.ready.clone(),
                worker: Some(*worker),
                peer: None,
            },
        };
        Ok(serde_json::to_vec(&frame)?)
    }

    /// Classify a received frame.
    ///
    /// Returns `None` for anything that is not one of this pool's frames:
    /// malformed JSON, foreign tags, or a ready frame without an identity.
    pub fn decode(&self, bytes: &[u8]) -> Option<FrameKind> {
        let frame: Frame = serde_json::from_slice(bytes).ok()?;
        if frame.tag == self.handoff {
            let peer = frame.peer.and_then(|p| p.parse().ok());
            Some(FrameKind::Handoff { peer })
        } else if frame.tag == self.ready {
            frame.worker.map(FrameKind::Ready)
        } else {
            None
        }
    }
}

impl Default for Tags {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}
