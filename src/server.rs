//! The event loop: accepts peers, frames their traffic, routes messages,
//! and drives the live-handoff state machine.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use log::*;
use nix::{
    errno::Errno,
    sys::{
        epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags},
        socket::{
            accept4, bind, listen, recv, setsockopt, socket, sockopt, AddressFamily, MsgFlags,
            SockFlag, SockProtocol, SockType, SockaddrStorage,
        },
    },
};

use crate::{
    config::Config,
    connection::{ConnKey, Connection, ConnectionArena, Role, UidIndex},
    handoff::{self, Arbitration, Command, ControlError, Inbound},
    router::{self, SourceState},
};

/// Readiness events handled per wakeup.
const MAX_EPOLL_EVENTS: usize = 32;

/// Wait cap so housekeeping runs even when idle.
const EPOLL_WAIT_TIMEOUT_MS: isize = 1000;

/// TCP accept backlog.
const TCP_BACKLOG: usize = 50;

/// Status line interval.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Set from the signal handler; consumed at the top of each loop iteration.
/// The handler touches nothing else.
pub static SHUTDOWN_LISTENERS: AtomicBool = AtomicBool::new(false);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum CtrlState {
    /// No control path is configured.
    None,
    /// This instance is the live server; the local listener is registered.
    Listening,
    /// We connected into a running instance and receive its sockets.
    Client,
    /// A successor's control connection is being serviced.
    Accepted,
    /// "unlistening" has been sent; draining and shipping sockets outward.
    /// There is no way back to Listening from here.
    Decaying,
}

struct CtrlEndpoint {
    state: CtrlState,
    listener: Option<ConnKey>,
    conn: Option<ConnKey>,
}

pub struct Server {
    epoll: Epoll,
    arena: ConnectionArena,
    index: UidIndex,
    listeners: Vec<ConnKey>,
    ctrl: CtrlEndpoint,
    config: Config,
    /// Listeners plus peer connections; control descriptors do not count.
    /// The loop exits when this reaches zero.
    total_sockets: usize,
    sockets_inherited: usize,
    status_at: Instant,
}

impl Server {
    /// Binds everything and runs the start-up arbitration. The handoff
    /// handshake happens before the TCP listeners bind, so a live
    /// predecessor has released the port by the time we claim it.
    pub fn new(config: &Config) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("epoll_create")?;
        let mut server = Self {
            epoll,
            arena: ConnectionArena::new(),
            index: UidIndex::new(),
            listeners: Vec::new(),
            ctrl: CtrlEndpoint {
                state: CtrlState::None,
                listener: None,
                conn: None,
            },
            config: config.clone(),
            total_sockets: 0,
            sockets_inherited: 0,
            status_at: Instant::now(),
        };

        if let Some(path) = &config.control_socket {
            match handoff::arbitrate(path)? {
                Arbitration::Listening(fd) => {
                    let key = server.install(Connection::control(fd, Role::CtrlListener))?;
                    server.ctrl.listener = Some(key);
                    server.ctrl.state = CtrlState::Listening;
                }
                Arbitration::Inherited(fd) => {
                    let key = server.install(Connection::control(fd, Role::CtrlConn))?;
                    server.ctrl.conn = Some(key);
                    server.ctrl.state = CtrlState::Client;
                }
                Arbitration::Unavailable => {}
            }
        }

        for (fd, label) in bind_wildcard_listeners(config.port)? {
            info!("listening on {}", label);
            let key = server.install(Connection::listener(fd, label))?;
            server.listeners.push(key);
            server.total_sockets += 1;
        }
        Ok(server)
    }

    /// Serves until the socket count reaches zero, then runs the decay
    /// epilogue if one is owed.
    pub fn run(&mut self) -> Result<()> {
        let mut events = [EpollEvent::empty(); MAX_EPOLL_EVENTS];
        while self.total_sockets > 0 {
            if SHUTDOWN_LISTENERS.swap(false, Ordering::Relaxed) {
                self.close_listeners();
            }
            if self.status_at.elapsed() >= STATUS_INTERVAL {
                info!(
                    "{} connections, {} identified peers",
                    self.total_sockets - self.listeners.len(),
                    self.index.len()
                );
                self.status_at = Instant::now();
            }

            let num = match self.epoll.wait(&mut events, EPOLL_WAIT_TIMEOUT_MS) {
                Ok(num) => num,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!("epoll_wait: {}", err);
                    continue;
                }
            };
            for event in &events[..num] {
                let key = ConnKey::from_token(event.data());
                // the connection may have died earlier in this same batch;
                // its generation bump makes the event resolve to nothing
                let Some(role) = self.arena.get(key).map(|conn| conn.role) else {
                    continue;
                };
                match role {
                    Role::TcpListener => self.accept_peer(key),
                    Role::TcpPeer => self.serve_peer(key),
                    Role::CtrlListener => self.accept_control(key),
                    Role::CtrlConn => self.serve_control(key)?,
                }
            }
        }
        self.finish_decay();
        info!("exit due to {} sockets left to serve", self.total_sockets);
        Ok(())
    }

    /// Registers a connection for read readiness, keyed by its handle.
    fn install(&mut self, conn: Connection) -> Result<ConnKey> {
        let key = self.arena.insert(conn);
        let conn = self.arena.get(key).expect("just inserted");
        let event = EpollEvent::new(EpollFlags::EPOLLIN, key.token());
        if let Err(err) = self.epoll.add(&conn.fd, event) {
            self.arena.remove(key);
            return Err(err).context("epoll_ctl(ADD)");
        }
        Ok(key)
    }

    fn reregister(&mut self, key: ConnKey) -> Result<()> {
        let conn = self.arena.get(key).context("connection is gone")?;
        let event = EpollEvent::new(EpollFlags::EPOLLIN, key.token());
        self.epoll.add(&conn.fd, event).context("epoll_ctl(ADD)")
    }

    fn deregister(&self, conn: &Connection) {
        if let Err(err) = self.epoll.delete(&conn.fd) {
            warn!("epoll_ctl(DEL): {}", err);
        }
    }

    fn close_listeners(&mut self) {
        for key in std::mem::take(&mut self.listeners) {
            if let Some(conn) = self.arena.remove(key) {
                info!("close server {}", conn.label);
                self.deregister(&conn);
                self.total_sockets -= 1;
            }
        }
    }

    fn accept_peer(&mut self, key: ConnKey) {
        let listener_fd = self.arena.get(key).expect("listener is alive").fd.as_raw_fd();
        let raw = match accept4(listener_fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(raw) => raw,
            Err(Errno::EAGAIN) => return,
            Err(err) => {
                warn!("accept: {}", err);
                return;
            }
        };
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        match self.install(Connection::peer(fd)) {
            Ok(_) => self.total_sockets += 1,
            Err(err) => warn!("failed to register peer: {}", err),
        }
    }

    fn serve_peer(&mut self, key: ConnKey) {
        let decaying = self.ctrl.state == CtrlState::Decaying;
        if decaying && self.arena.get(key).expect("peer is alive").is_idle() {
            // readable while idle: whatever just arrived travels with the
            // descriptor, unread
            debug!("single send");
            self.ship_peer(key);
            return;
        }

        let conn = self.arena.get_mut(key).expect("peer is alive");
        let fd = conn.fd.as_raw_fd();
        let buf_len = conn.buf_len;
        let n = match nix::unistd::read(fd, &mut conn.buf[buf_len..]) {
            Ok(n) => n,
            Err(Errno::EAGAIN | Errno::EINTR | Errno::ECONNRESET) => return,
            Err(err) => {
                warn!("read: {}", err);
                return;
            }
        };
        if n == 0 {
            self.close_peer(key);
            return;
        }
        conn.buf_len += n;

        match router::pump_frames(&mut self.arena, &mut self.index, key, !decaying) {
            SourceState::Open => {}
            SourceState::ProtocolError(err) => {
                warn!("closing peer: {}", err);
                self.close_peer(key);
                return;
            }
        }

        // get rid of drained clients right away instead of waiting for
        // their next message
        if decaying && self.arena.get(key).is_some_and(|conn| conn.is_idle()) {
            debug!("single send");
            self.ship_peer(key);
        }
    }

    /// Normal or protocol-error teardown. The generation bump tombstones
    /// every cache entry pointing here; they are swept on next access.
    fn close_peer(&mut self, key: ConnKey) {
        if let Some(conn) = self.arena.remove(key) {
            self.deregister(&conn);
            if let Some(uid) = conn.uid {
                self.index.remove(uid, key);
            }
            self.total_sockets -= 1;
        }
    }

    /// Hands a single drained peer to the successor.
    fn ship_peer(&mut self, key: ConnKey) {
        let Some(ctrl_fd) = self.control_conn_fd() else {
            warn!("no control connection to ship to");
            return;
        };
        let conn = self.arena.get(key).expect("peer is alive");
        let entry = [(conn.uid, conn.fd.as_raw_fd())];
        match handoff::send_desc(ctrl_fd, &entry) {
            Ok(()) => {
                let conn = self.arena.remove(key).expect("peer is alive");
                self.deregister(&conn);
                if let Some(uid) = conn.uid {
                    self.index.remove(uid, key);
                }
                self.total_sockets -= 1;
                // the local descriptor closes here, after the successful
                // sendmsg
            }
            Err(err) => warn!("sendmsg(desc): {}", err),
        }
    }

    fn control_conn_fd(&self) -> Option<RawFd> {
        let key = self.ctrl.conn?;
        Some(self.arena.get(key)?.fd.as_raw_fd())
    }

    fn accept_control(&mut self, key: ConnKey) {
        let listener_fd = self.arena.get(key).expect("control listener is alive").fd.as_raw_fd();
        let raw = match accept4(listener_fd, SockFlag::SOCK_CLOEXEC) {
            Ok(raw) => raw,
            Err(Errno::EAGAIN) => return,
            Err(err) => {
                warn!("accept(control): {}", err);
                return;
            }
        };
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let conn_key = match self.install(Connection::control(fd, Role::CtrlConn)) {
            Ok(conn_key) => conn_key,
            Err(err) => {
                warn!("failed to register control connection: {}", err);
                return;
            }
        };
        // one successor at a time: park the listener until this one closes
        let listener = self.arena.get(key).expect("control listener is alive");
        self.deregister(listener);
        self.ctrl.conn = Some(conn_key);
        self.ctrl.state = CtrlState::Accepted;
    }

    fn serve_control(&mut self, key: ConnKey) -> Result<()> {
        match self.ctrl.state {
            CtrlState::Client => self.serve_control_client(key),
            CtrlState::Accepted | CtrlState::Decaying => {
                self.serve_control_server(key);
                Ok(())
            }
            CtrlState::None | CtrlState::Listening => Ok(()),
        }
    }

    /// The serving side of an open control connection.
    fn serve_control_server(&mut self, key: ConnKey) {
        let fd = self.arena.get(key).expect("control connection is alive").fd.as_raw_fd();
        let mut buf = [0u8; 32];
        let n = match recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(n) => n,
            Err(Errno::EAGAIN | Errno::EINTR) => return,
            Err(err) => {
                warn!("read(control): {}", err);
                self.close_control_conn(key);
                return;
            }
        };
        if n == 0 {
            self.close_control_conn(key);
            return;
        }
        match handoff::parse_command(&buf[..n]) {
            Ok(Command::Unlisten) if self.ctrl.state == CtrlState::Accepted => {
                self.enter_decay(key)
            }
            // repeated unlisten while already decaying; nothing left to do
            Ok(Command::Unlisten) => {}
            Err(err) => {
                warn!("closing control connection: {}", err);
                self.close_control_conn(key);
            }
        }
    }

    /// Drops the active control connection and, when still serving, brings
    /// the parked local listener back into the readiness set.
    fn close_control_conn(&mut self, key: ConnKey) {
        if let Some(conn) = self.arena.remove(key) {
            self.deregister(&conn);
        }
        self.ctrl.conn = None;
        if self.ctrl.state == CtrlState::Accepted {
            if let Some(listener_key) = self.ctrl.listener {
                if let Err(err) = self.reregister(listener_key) {
                    warn!("failed to restore control listener: {}", err);
                }
            }
            self.ctrl.state = CtrlState::Listening;
        }
        // while decaying: the receiver is gone, remaining sockets drain by
        // closing normally
    }

    /// "unlisten": drop the TCP listeners, acknowledge, then hand every
    /// idle identified peer to the successor in batches.
    fn enter_decay(&mut self, ctrl_key: ConnKey) {
        self.close_listeners();
        let ctrl_fd = self.arena.get(ctrl_key).expect("control connection is alive").fd.as_raw_fd();
        if let Err(err) = handoff::send_unlistening(ctrl_fd) {
            warn!("write(unlistening): {}", err);
            return;
        }
        self.ctrl.state = CtrlState::Decaying;

        // tight drain loop: ship everything idle now; whatever is mid-frame
        // follows one by one as it drains
        loop {
            let idle: Vec<ConnKey> = self
                .index
                .entries()
                .map(|(_, key)| key)
                .filter(|&key| self.arena.get(key).is_some_and(|conn| conn.is_idle()))
                .collect();
            if idle.is_empty() {
                break;
            }
            let mut shipped = 0;
            for chunk in idle.chunks(handoff::MAX_DESC_PER_MESSAGE) {
                let sent = self.ship_batch(ctrl_fd, chunk);
                info!("bulk send: {}", sent);
                shipped += sent;
            }
            if shipped == 0 {
                break;
            }
        }
    }

    /// Ships up to one "desc" message worth of peers; returns how many went.
    fn ship_batch(&mut self, ctrl_fd: RawFd, keys: &[ConnKey]) -> usize {
        let mut entries = Vec::with_capacity(keys.len());
        for &key in keys {
            let conn = self.arena.get(key).expect("batched peer is alive");
            entries.push((conn.uid, conn.fd.as_raw_fd()));
        }
        if entries.is_empty() {
            return 0;
        }
        match handoff::send_desc(ctrl_fd, &entries) {
            Ok(()) => {
                for &key in keys {
                    let conn = self.arena.remove(key).expect("batched peer is alive");
                    self.deregister(&conn);
                    if let Some(uid) = conn.uid {
                        self.index.remove(uid, key);
                    }
                    self.total_sockets -= 1;
                }
                keys.len()
            }
            Err(err) => {
                warn!("sendmsg(desc): {}", err);
                0
            }
        }
    }

    /// The inheriting side of the control connection.
    fn serve_control_client(&mut self, key: ConnKey) -> Result<()> {
        let fd = self.arena.get(key).expect("control connection is alive").fd.as_raw_fd();
        match handoff::recv_inbound(fd) {
            Ok(Inbound::Desc(sockets)) => {
                for (uid, fd) in sockets {
                    self.adopt_peer(uid, fd);
                }
                Ok(())
            }
            Ok(Inbound::Exit) => {
                self.take_over_control_path(key);
                Ok(())
            }
            Ok(Inbound::Closed) => {
                warn!("unexpected close of control connection");
                if let Some(conn) = self.arena.remove(key) {
                    self.deregister(&conn);
                }
                self.ctrl.conn = None;
                self.ctrl.state = CtrlState::None;
                Ok(())
            }
            Err(ControlError::Recv(Errno::EAGAIN | Errno::EINTR)) => Ok(()),
            Err(err @ ControlError::Recv(_)) => {
                warn!("{}", err);
                Ok(())
            }
            Err(err @ ControlError::UnknownType) => {
                warn!("closing control connection: {}", err);
                if let Some(conn) = self.arena.remove(key) {
                    self.deregister(&conn);
                }
                self.ctrl.conn = None;
                self.ctrl.state = CtrlState::None;
                Ok(())
            }
            // a trusted local sender produced garbage ancillary data: that
            // is a bug, not traffic
            Err(err) => Err(err.into()),
        }
    }

    /// Promotes a transferred descriptor to a local peer connection.
    /// Unidentified ones re-announce in-band on their next frame.
    fn adopt_peer(&mut self, uid: Option<u16>, fd: OwnedFd) {
        let mut conn = Connection::peer(fd);
        conn.uid = uid;
        match self.install(conn) {
            Ok(key) => {
                self.total_sockets += 1;
                self.sockets_inherited += 1;
                if let Some(uid) = uid {
                    if let Some(displaced) = self.index.insert(uid, key) {
                        debug!("uid {} claimed again, displacing {}", uid, displaced);
                    }
                }
            }
            Err(err) => warn!("failed to register inherited socket: {}", err),
        }
    }

    /// "exit": the predecessor has drained and unlinked the path; claim it.
    fn take_over_control_path(&mut self, conn_key: ConnKey) {
        if let Some(conn) = self.arena.remove(conn_key) {
            self.deregister(&conn);
        }
        self.ctrl.conn = None;
        let path = self
            .config
            .control_socket
            .clone()
            .expect("client mode implies a control path");
        match handoff::bind_control_listener(&path) {
            Ok(fd) => match self.install(Connection::control(fd, Role::CtrlListener)) {
                Ok(key) => {
                    self.ctrl.listener = Some(key);
                    self.ctrl.state = CtrlState::Listening;
                }
                Err(err) => {
                    error!("failed to register control listener: {:#}", err);
                    self.ctrl.state = CtrlState::None;
                }
            },
            Err(err) => {
                error!("failed to reopen control listener: {:#}", err);
                self.ctrl.state = CtrlState::None;
            }
        }
        info!("{} sockets inherited from the dead", self.sockets_inherited);
    }

    /// The decay epilogue: relinquish the control path and tell the
    /// successor the line is dead.
    fn finish_decay(&mut self) {
        if self.ctrl.state != CtrlState::Decaying {
            return;
        }
        if let Some(key) = self.ctrl.listener.take() {
            // parked since the successor connected; closing is enough
            self.arena.remove(key);
        }
        if let Some(path) = &self.config.control_socket {
            if let Err(err) = std::fs::remove_file(path) {
                warn!("unlink({}): {}", path.display(), err);
            }
        }
        if let Some(key) = self.ctrl.conn.take() {
            if let Some(conn) = self.arena.remove(key) {
                self.deregister(&conn);
                if let Err(err) = handoff::send_exit(conn.fd.as_raw_fd()) {
                    warn!("send(exit): {}", err);
                }
            }
        }
    }
}

/// Dual-stack wildcard listeners: IPv6 with `IPV6_V6ONLY` plus IPv4, both
/// `SO_REUSEADDR`, backlog 50, non-blocking, labeled for logs.
fn bind_wildcard_listeners(port: u16) -> Result<Vec<(OwnedFd, String)>> {
    let addrs: [SocketAddr; 2] = [
        SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into(),
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into(),
    ];
    let mut listeners = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let fd = socket(
            if addr.is_ipv4() {
                AddressFamily::Inet
            } else {
                AddressFamily::Inet6
            },
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::Tcp,
        )
        .context("socket")?;
        if addr.is_ipv6() {
            setsockopt(&fd, sockopt::Ipv6V6Only, &true).context("setsockopt(IPV6_V6ONLY)")?;
        }
        setsockopt(&fd, sockopt::ReuseAddr, &true).context("setsockopt(SO_REUSEADDR)")?;
        bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))
            .with_context(|| format!("bind({})", addr))?;
        listen(&fd, TCP_BACKLOG).context("listen")?;
        listeners.push((fd, addr.to_string()));
    }
    Ok(listeners)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, os::unix::net::UnixStream, path::Path};

    use nix::sys::socket::{connect, send, socket, UnixAddr};

    use super::*;

    fn test_config(name: &str) -> Config {
        let path = std::env::temp_dir().join(format!("peer-relay-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        Config {
            port: 0,
            control_socket: Some(path),
        }
    }

    /// A peer connection wired into the server, with its far end returned.
    fn add_peer(server: &mut Server, uid: Option<u16>) -> (ConnKey, UnixStream) {
        let (local, remote) = UnixStream::pair().expect("socketpair");
        let mut conn = Connection::peer(local.into());
        conn.uid = uid;
        let key = server.install(conn).expect("install");
        server.total_sockets += 1;
        if let Some(uid) = uid {
            server.index.insert(uid, key);
        }
        (key, remote)
    }

    fn connect_successor(path: &Path) -> OwnedFd {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .expect("socket");
        let addr = UnixAddr::new(path).expect("addr");
        connect(fd.as_raw_fd(), &addr).expect("connect");
        fd
    }

    #[test]
    fn handoff_trace_matches_the_protocol() {
        let config = test_config("trace");
        let path = config.control_socket.clone().expect("path");
        let mut server = Server::new(&config).expect("server");
        assert_eq!(server.ctrl.state, CtrlState::Listening);
        assert_eq!(server.total_sockets, 2); // the two wildcard listeners

        let (_a, _a_remote) = add_peer(&mut server, Some(1));
        let (_b, _b_remote) = add_peer(&mut server, Some(2));

        // a peer caught mid-frame: first 6 bytes of a 12-byte message
        let (c, mut c_remote) = add_peer(&mut server, Some(3));
        {
            let conn = server.arena.get_mut(c).expect("alive");
            conn.buf[..6].copy_from_slice(&[0x00, 0x00, 0x00, 0x08, 0x12, 0x34]);
            conn.buf_len = 6;
        }
        assert_eq!(server.total_sockets, 5);

        // successor connects and asks us to stop listening
        let successor = connect_successor(&path);
        let listener = server.ctrl.listener.expect("listening");
        server.accept_control(listener);
        assert_eq!(server.ctrl.state, CtrlState::Accepted);

        send(successor.as_raw_fd(), b"unlisten", MsgFlags::empty()).expect("send");
        let conn = server.ctrl.conn.expect("accepted");
        server.serve_control(conn).expect("serve");
        assert_eq!(server.ctrl.state, CtrlState::Decaying);

        // the reply, then the idle identified peers in one batch
        let mut reply = [0u8; 32];
        let n = recv(successor.as_raw_fd(), &mut reply, MsgFlags::empty()).expect("recv");
        assert_eq!(&reply[..n], b"unlistening");
        let uids = match handoff::recv_inbound(successor.as_raw_fd()).expect("desc") {
            Inbound::Desc(sockets) => sockets.iter().map(|(uid, _)| *uid).collect::<Vec<_>>(),
            other => panic!("unexpected message: {:?}", other),
        };
        assert_eq!(uids, vec![Some(1), Some(2)]);
        assert_eq!(server.total_sockets, 1); // the mid-frame peer remains
        assert_eq!(server.index.len(), 1);

        // the rest of the frame arrives; the peer drains and ships singly,
        // and the consumed frame is not forwarded anywhere
        c_remote
            .write_all(&[0x00, 0x01, 0xde, 0xad, 0xbe, 0xef])
            .expect("write");
        server.serve_peer(c);
        let uids = match handoff::recv_inbound(successor.as_raw_fd()).expect("desc") {
            Inbound::Desc(sockets) => sockets.iter().map(|(uid, _)| *uid).collect::<Vec<_>>(),
            other => panic!("unexpected message: {:?}", other),
        };
        assert_eq!(uids, vec![Some(3)]);
        assert_eq!(server.total_sockets, 0);

        // nothing left to serve: the loop exits, the path is released, and
        // the successor is told the line is dead
        server.run().expect("run");
        assert!(!path.exists());
        assert!(matches!(
            handoff::recv_inbound(successor.as_raw_fd()).expect("exit"),
            Inbound::Exit
        ));
    }

    #[test]
    fn inherited_sockets_are_promoted_and_counted() {
        let config = test_config("inherit");
        let path = config.control_socket.clone().expect("path");

        // a bare listener stands in for the predecessor
        let predecessor = handoff::bind_control_listener(&path).expect("bind");

        // client startup needs the handshake served from another thread
        let handshake = std::thread::spawn(move || {
            let raw = nix::sys::socket::accept(predecessor.as_raw_fd()).expect("accept");
            let conn = unsafe { OwnedFd::from_raw_fd(raw) };
            let mut buf = [0u8; 32];
            let n = recv(conn.as_raw_fd(), &mut buf, MsgFlags::empty()).expect("recv");
            assert_eq!(&buf[..n], b"unlisten");
            handoff::send_unlistening(conn.as_raw_fd()).expect("send");
            conn
        });

        let mut server = Server::new(&config).expect("server");
        let predecessor_conn = handshake.join().expect("handshake thread");
        assert_eq!(server.ctrl.state, CtrlState::Client);

        // two transferred sockets, one of them unidentified
        let (passed_a, _mate_a) = UnixStream::pair().expect("socketpair");
        let (passed_b, _mate_b) = UnixStream::pair().expect("socketpair");
        handoff::send_desc(
            predecessor_conn.as_raw_fd(),
            &[(Some(7), passed_a.as_raw_fd()), (None, passed_b.as_raw_fd())],
        )
        .expect("send_desc");

        let before = server.total_sockets;
        let conn = server.ctrl.conn.expect("client");
        server.serve_control(conn).expect("serve");
        assert_eq!(server.total_sockets, before + 2);
        assert_eq!(server.sockets_inherited, 2);
        let adopted = server.index.find(7).expect("indexed");
        assert_eq!(server.arena.get(adopted).expect("alive").uid, Some(7));
        assert_eq!(server.index.len(), 1); // the unidentified one stays out

        // "exit" hands us the control path back
        std::fs::remove_file(&path).expect("predecessor unlinks");
        handoff::send_exit(predecessor_conn.as_raw_fd()).expect("send_exit");
        server.serve_control(conn).expect("serve");
        assert_eq!(server.ctrl.state, CtrlState::Listening);
        assert!(path.exists());

        std::fs::remove_file(&path).expect("cleanup");
    }
}
