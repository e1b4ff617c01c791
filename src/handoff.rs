//! The live-handoff control protocol.
//!
//! Two instances of the relay arbitrate over a local sequenced-packet
//! socket: the newcomer asks the running instance to stop listening, then
//! receives every established peer socket as passed file descriptors
//! (`SCM_RIGHTS`), each tagged with the UID the old instance knew it by.

use std::{
    io::{IoSlice, IoSliceMut},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::Path,
};

use anyhow::{bail, Context};
use byteorder::{ByteOrder, LittleEndian};
use log::*;
use nix::{
    errno::Errno,
    sys::socket::{
        bind, connect, listen, recv, recvmsg, send, sendmsg, socket, AddressFamily,
        ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
    },
};
use thiserror::Error;

/// Most descriptors a single "desc" message may carry.
pub const MAX_DESC_PER_MESSAGE: usize = 256;

/// Only one successor instance talks to us at a time.
const CTRL_BACKLOG: usize = 1;

const MAX_CONTROL_MESSAGE_SIZE: usize = 4 + MAX_DESC_PER_MESSAGE * 4;

const DESC: &[u8] = b"desc";
const EXIT: &[u8] = b"exit";
const UNLISTEN: &[u8] = b"unlisten";
const UNLISTENING: &[u8] = b"unlistening";

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("malformed control message: unknown type")]
    UnknownType,
    #[error("malformed control message: wrong ancillary type")]
    WrongAncillaryType,
    #[error("desc message carries {uids} uids but {fds} descriptors")]
    CountMismatch { uids: usize, fds: usize },
    #[error("recvmsg(control): {0}")]
    Recv(#[from] Errno),
}

/// Outcome of the start-up arbitration against the control path.
pub enum Arbitration {
    /// We bound the path; this instance is the live server.
    Listening(OwnedFd),
    /// An instance was already serving. We hold the connection on which it
    /// will hand its sockets over; it has already stopped listening.
    Inherited(OwnedFd),
    /// connect failed for a reason other than a stale or absent path.
    Unavailable,
}

/// Connect-or-bind arbitration, run before the TCP listeners are bound.
///
/// A refused connection means the path was left behind by a dead instance:
/// unlink it and claim it. Against a live instance, the blocking
/// "unlisten"/"unlistening" handshake completes before this returns, so the
/// predecessor has released the TCP port by the time we bind it.
pub fn arbitrate(path: &Path) -> anyhow::Result<Arbitration> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("socket(AF_UNIX)")?;
    let addr = UnixAddr::new(path).context("control socket address")?;
    match connect(fd.as_raw_fd(), &addr) {
        Ok(()) => {
            send(fd.as_raw_fd(), UNLISTEN, MsgFlags::empty()).context("send(unlisten)")?;
            let mut reply = [0u8; 32];
            let n = recv(fd.as_raw_fd(), &mut reply, MsgFlags::empty())
                .context("recv(unlistening)")?;
            if n == 0 {
                bail!("unexpected EOF from the running server");
            }
            if &reply[..n] != UNLISTENING {
                bail!(
                    "running server reported: {}",
                    String::from_utf8_lossy(&reply[..n])
                );
            }
            Ok(Arbitration::Inherited(fd))
        }
        Err(Errno::ECONNREFUSED) => {
            std::fs::remove_file(path)
                .with_context(|| format!("unlink({})", path.display()))?;
            Ok(Arbitration::Listening(bind_and_listen(fd, &addr)?))
        }
        Err(Errno::ENOENT) => Ok(Arbitration::Listening(bind_and_listen(fd, &addr)?)),
        Err(err) => {
            error!("connect({}): {}", path.display(), err);
            Ok(Arbitration::Unavailable)
        }
    }
}

/// A fresh control listener on `path`; used once the predecessor has
/// unlinked it and said "exit".
pub fn bind_control_listener(path: &Path) -> anyhow::Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("socket(AF_UNIX)")?;
    let addr = UnixAddr::new(path).context("control socket address")?;
    bind_and_listen(fd, &addr)
}

fn bind_and_listen(fd: OwnedFd, addr: &UnixAddr) -> anyhow::Result<OwnedFd> {
    bind(fd.as_raw_fd(), addr).context("bind(control socket)")?;
    listen(&fd, CTRL_BACKLOG).context("listen(control socket)")?;
    Ok(fd)
}

/// Commands a serving instance accepts on an open control connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Unlisten,
}

pub fn parse_command(msg: &[u8]) -> Result<Command, ControlError> {
    if msg == UNLISTEN {
        Ok(Command::Unlisten)
    } else {
        Err(ControlError::UnknownType)
    }
}

/// A control message received by the inheriting side.
#[derive(Debug)]
pub enum Inbound {
    /// Transferred sockets: announced UID (None for unidentified) and the
    /// descriptor, in transfer order.
    Desc(Vec<(Option<u16>, OwnedFd)>),
    /// The predecessor has drained and released the control path.
    Exit,
    /// The peer closed the control connection.
    Closed,
}

/// Receives one control message together with its ancillary descriptors.
///
/// The sender is trusted local code: a wrong ancillary type or a descriptor
/// count that does not match the UID count is a bug, not traffic to
/// tolerate, and surfaces as an error the caller treats as fatal.
pub fn recv_inbound(fd: RawFd) -> Result<Inbound, ControlError> {
    let mut buf = [0u8; MAX_CONTROL_MESSAGE_SIZE];
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_DESC_PER_MESSAGE]);
    let (n, fds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())?;
        let mut fds: Vec<OwnedFd> = Vec::new();
        for cmsg in msg.cmsgs() {
            match cmsg {
                ControlMessageOwned::ScmRights(received) => fds.extend(
                    received
                        .into_iter()
                        .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }),
                ),
                _ => return Err(ControlError::WrongAncillaryType),
            }
        }
        (msg.bytes, fds)
    };
    if n == 0 {
        return Ok(Inbound::Closed);
    }
    let body = &buf[..n];
    if body.len() >= DESC.len() && &body[..DESC.len()] == DESC {
        let uid_bytes = &body[DESC.len()..];
        let uid_count = uid_bytes.len() / 4;
        if uid_count != fds.len() {
            return Err(ControlError::CountMismatch {
                uids: uid_count,
                fds: fds.len(),
            });
        }
        let mut sockets = Vec::with_capacity(uid_count);
        for (i, fd) in fds.into_iter().enumerate() {
            let raw = LittleEndian::read_i32(&uid_bytes[i * 4..i * 4 + 4]);
            sockets.push((u16::try_from(raw).ok(), fd));
        }
        Ok(Inbound::Desc(sockets))
    } else if body == EXIT {
        Ok(Inbound::Exit)
    } else {
        Err(ControlError::UnknownType)
    }
}

/// Ships `sockets` on the control connection as one "desc" message.
///
/// The descriptors stay open locally; the caller closes them only after
/// this returns success, so a failed send never strands a socket.
pub fn send_desc(ctrl: RawFd, sockets: &[(Option<u16>, RawFd)]) -> nix::Result<()> {
    debug_assert!(!sockets.is_empty() && sockets.len() <= MAX_DESC_PER_MESSAGE);
    let mut buf = [0u8; MAX_CONTROL_MESSAGE_SIZE];
    buf[..DESC.len()].copy_from_slice(DESC);
    let mut fds = Vec::with_capacity(sockets.len());
    for (i, &(uid, fd)) in sockets.iter().enumerate() {
        let raw = uid.map_or(-1, i32::from);
        LittleEndian::write_i32(&mut buf[4 + i * 4..8 + i * 4], raw);
        fds.push(fd);
    }
    let len = 4 + sockets.len() * 4;
    let iov = [IoSlice::new(&buf[..len])];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(ctrl, &iov, &cmsgs, MsgFlags::empty(), None)?;
    Ok(())
}

pub fn send_unlistening(ctrl: RawFd) -> nix::Result<()> {
    send(ctrl, UNLISTENING, MsgFlags::empty()).map(drop)
}

pub fn send_exit(ctrl: RawFd) -> nix::Result<()> {
    send(ctrl, EXIT, MsgFlags::empty()).map(drop)
}
