//! Packet channel between the master and one worker.
//!
//! Each channel is one end of a Unix `SOCK_SEQPACKET` socket pair: packet
//! boundaries are preserved, so every frame is exactly one send and one
//! receive, and a connection's descriptor rides in the same packet as the
//! frame that announces it (`SCM_RIGHTS`). EINTR is retried transparently.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};

use super::protocol::{Connection, FrameKind, Message, Tags};
use crate::error::{PoolError, Result};

/// Largest frame accepted on a channel (64KB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// One end of a master/worker channel.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
    tags: Tags,
}

impl Channel {
    pub fn new(fd: OwnedFd, tags: Tags) -> Self {
        Self { fd, tags }
    }

    /// Create from an inherited raw descriptor (takes ownership).
    ///
    /// # Safety
    /// `fd` must be an open `SOCK_SEQPACKET` socket not owned elsewhere.
    pub unsafe fn from_raw(fd: RawFd, tags: Tags) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            tags,
        }
    }

    /// Create a connected pair. Both ends are close-on-exec.
    pub fn pair(tags: &Tags) -> Result<(Channel, Channel)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Self::new(a, tags.clone()), Self::new(b, tags.clone())))
    }

    /// A second handle on the same socket, for a dedicated reader thread.
    pub fn try_clone(&self) -> Result<Channel> {
        Ok(Self::new(self.fd.try_clone()?, self.tags.clone()))
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Send one message.
    ///
    /// A handed-off connection is duplicated into the peer by the kernel;
    /// the caller still owns its copy and is expected to drop it once this
    /// returns `Ok`. On error nothing was delivered and the connection can
    /// be retried elsewhere.
    pub fn send(&self, message: &Message) -> Result<()> {
        let payload = self.tags.encode(message)?;
        let attached = match message {
            Message::ConnectionHandoff(connection) => Some(connection.as_raw_fd()),
            Message::ReadySignal(_) => None,
        };
        self.send_frame(&payload, attached)
    }

    /// Send raw frame bytes with an optional descriptor.
    pub(crate) fn send_frame(&self, payload: &[u8], attached: Option<RawFd>) -> Result<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(PoolError::Protocol(format!(
                "frame of {} bytes exceeds {} byte limit",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }

        let iov = [IoSlice::new(payload)];
        let fds: Vec<RawFd> = attached.into_iter().collect();
        let cmsgs: Vec<ControlMessage<'_>> = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(&fds)]
        };

        loop {
            match sendmsg::<()>(
                self.fd.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receive the next message for this pool.
    ///
    /// Frames with foreign or malformed tags are skipped, and any
    /// descriptor they carried is closed. Returns `None` once the peer has
    /// closed its end.
    pub fn recv(&self) -> Result<Option<Message>> {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];

        loop {
            let (len, truncated, fds) = self.recv_packet(&mut buf)?;
            if len == 0 && fds.is_empty() {
                return Ok(None);
            }
            if truncated {
                tracing::warn!(len, "Dropping truncated frame");
                continue;
            }

            let mut fds = fds.into_iter();
            match self.tags.decode(&buf[..len]) {
                Some(FrameKind::Handoff { peer }) => match fds.next() {
                    Some(fd) => return Ok(Some(Message::ConnectionHandoff(Connection::new(fd, peer)))),
                    None => {
                        tracing::warn!("Handoff frame arrived without a connection");
                        continue;
                    }
                },
                Some(FrameKind::Ready(worker)) => return Ok(Some(Message::ReadySignal(worker))),
                None => {
                    tracing::trace!(len, "Ignoring foreign frame");
                    continue;
                }
            }
        }
    }

    /// Read one packet, taking ownership of every descriptor attached to it.
    fn recv_packet(&self, buf: &mut [u8]) -> Result<(usize, bool, Vec<OwnedFd>)> {
        loop {
            let mut cmsg_buf = nix::cmsg_space!([RawFd; 4]);
            let mut iov = [IoSliceMut::new(&mut *buf)];
            let msg = match recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => msg,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    // Safety: the kernel just installed these descriptors for us.
                    fds.extend(
                        received
                            .into_iter()
                            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                    );
                }
            }
            let truncated = msg
                .flags
                .intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC);
            return Ok((msg.bytes, truncated, fds));
        }
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::WorkerId;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_ready_signal_crosses_channel() {
        let (master, worker) = Channel::pair(&Tags::default()).unwrap();
        worker
            .send(&Message::ReadySignal(WorkerId::new(3)))
            .unwrap();

        match master.recv().unwrap() {
            Some(Message::ReadySignal(id)) => assert_eq!(id, WorkerId::new(3)),
            other => panic!("Expected ReadySignal, got {:?}", other),
        }
    }

    #[test]
    fn test_handoff_transfers_descriptor() {
        let (master, worker) = Channel::pair(&Tags::default()).unwrap();
        let (mut client, server_side) = UnixStream::pair().unwrap();

        let message = Message::ConnectionHandoff(Connection::new(OwnedFd::from(server_side), None));
        master.send(&message).unwrap();
        // Master gives up its copy after a successful send
        drop(message);

        let received = match worker.recv().unwrap() {
            Some(Message::ConnectionHandoff(connection)) => connection,
            other => panic!("Expected ConnectionHandoff, got {:?}", other),
        };
        let mut stream = UnixStream::from(received.into_fd());

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_foreign_frames_are_skipped() {
        let (master, worker) = Channel::pair(&Tags::new("mine:")).unwrap();
        let (_keep, stray) = UnixStream::pair().unwrap();

        master.send_frame(b"not json", None).unwrap();
        master
            .send_frame(br#"{"tag":"other:connection"}"#, Some(stray.as_raw_fd()))
            .unwrap();
        master
            .send(&Message::ReadySignal(WorkerId::new(1)))
            .unwrap();

        assert!(matches!(
            worker.recv().unwrap(),
            Some(Message::ReadySignal(id)) if id == WorkerId::new(1)
        ));
    }

    #[test]
    fn test_handoff_without_descriptor_is_skipped() {
        let tags = Tags::default();
        let (master, worker) = Channel::pair(&tags).unwrap();

        let frame = format!(r#"{{"tag":"{}"}}"#, tags.handoff());
        master.send_frame(frame.as_bytes(), None).unwrap();
        drop(master);

        assert!(worker.recv().unwrap().is_none());
    }

    #[test]
    fn test_recv_returns_none_on_close() {
        let (master, worker) = Channel::pair(&Tags::default()).unwrap();
        drop(master);
        assert!(worker.recv().unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let (master, _worker) = Channel::pair(&Tags::default()).unwrap();
        let payload = vec![b'x'; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            master.send_frame(&payload, None),
            Err(PoolError::Protocol(_))
        ));
    }

    #[test]
    fn test_cloned_handle_shares_socket() {
        let (master, worker) = Channel::pair(&Tags::default()).unwrap();
        let reader = master.try_clone().unwrap();
        worker
            .send(&Message::ReadySignal(WorkerId::new(5)))
            .unwrap();
        assert!(matches!(reader.recv().unwrap(), Some(Message::ReadySignal(_))));
    }
}
