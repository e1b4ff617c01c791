//! The frame pump: drives a source connection's buffered bytes through the
//! parser and forwards addressed messages to their destinations.

use std::os::fd::AsRawFd;

use log::*;
use nix::errno::Errno;

use crate::{
    connection::{ConnKey, ConnectionArena, UidIndex},
    wire,
};

/// What became of the source connection after draining its buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum SourceState {
    /// Any partial frame was compacted to the front of the buffer; the
    /// connection stays registered.
    Open,
    /// Fatal protocol error; the caller must close and destroy the source.
    ProtocolError(wire::FrameError),
}

/// Extracts every complete frame currently buffered on `src`.
///
/// A UID announce updates the index even while decaying. Addressed frames
/// are routed unless `forward` is false, in which case they are consumed
/// and dropped: a decaying instance is no longer authoritative for
/// addressing, so sending on stale descriptors would cross the two
/// instances' UID spaces.
pub fn pump_frames(
    arena: &mut ConnectionArena,
    index: &mut UidIndex,
    src: ConnKey,
    forward: bool,
) -> SourceState {
    let mut head = 0;
    loop {
        let conn = arena.get(src).expect("source connection is alive");
        let buffered = &conn.buf[head..conn.buf_len];
        let Some(size) = wire::frame_size(buffered) else {
            break;
        };
        if size + wire::SIZE_PREFIX > conn.buf.len() {
            return SourceState::ProtocolError(wire::FrameError::Oversize {
                size,
                capacity: conn.buf.len(),
            });
        }
        if size + wire::SIZE_PREFIX > buffered.len() {
            break;
        }
        let frame_end = head + wire::SIZE_PREFIX + size;

        if conn.uid.is_none() {
            if size < wire::ANNOUNCE_HEADER {
                return SourceState::ProtocolError(wire::FrameError::ShortHeader { size });
            }
            let uid = wire::announce_uid(buffered);
            arena
                .get_mut(src)
                .expect("source connection is alive")
                .uid = Some(uid);
            if let Some(displaced) = index.insert(uid, src) {
                debug!("uid {} claimed again, displacing {}", uid, displaced);
            }
            head = frame_end;
            continue;
        }

        if size < wire::ADDRESSED_HEADER {
            return SourceState::ProtocolError(wire::FrameError::ShortHeader { size });
        }
        if forward {
            let uid = wire::dest_uid(buffered);
            route_frame(arena, index, src, uid, head, frame_end);
        }
        head = frame_end;
    }

    if head > 0 {
        let conn = arena.get_mut(src).expect("source connection is alive");
        let remaining = conn.buf_len - head;
        conn.buf.copy_within(head..conn.buf_len, 0);
        conn.buf_len = remaining;
    }
    SourceState::Open
}

/// Resolves the destination, rewrites the header in place, and issues the
/// one and only write attempt. An unknown destination drops the frame; the
/// source is never told.
fn route_frame(
    arena: &mut ConnectionArena,
    index: &UidIndex,
    src: ConnKey,
    dest_uid: u16,
    head: usize,
    frame_end: usize,
) {
    let peer = match arena.cache_find(src, dest_uid) {
        Some(peer) => peer,
        None => match index.find(dest_uid) {
            Some(peer) if arena.get(peer).is_some() => {
                arena.cache_insert(src, peer);
                peer
            }
            _ => {
                trace!("no destination for uid {}, dropping frame", dest_uid);
                return;
            }
        },
    };

    let out_start = {
        let conn = arena.get_mut(src).expect("source connection is alive");
        wire::rewrite_for_delivery(&mut conn.buf[head..frame_end]);
        head + wire::DELIVERY_SHIFT
    };
    let src_conn = arena.get(src).expect("source connection is alive");
    let peer_conn = arena.get(peer).expect("destination resolved above");
    let out = &src_conn.buf[out_start..frame_end];
    match nix::unistd::write(peer_conn.fd.as_raw_fd(), out) {
        Ok(n) if n != out.len() => {
            warn!("short write ({} of {} bytes) to uid {}", n, out.len(), dest_uid);
        }
        Ok(_) => {}
        Err(Errno::EAGAIN | Errno::EINTR | Errno::ECONNRESET | Errno::EPIPE) => {}
        Err(err) => warn!("write to uid {}: {}", dest_uid, err),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{ErrorKind, Read},
        os::unix::net::UnixStream,
    };

    use hex_literal::hex;

    use crate::connection::{Connection, PEER_CACHE_SIZE};

    use super::*;

    /// A peer connection backed by a real socketpair; the far end is
    /// returned so tests can observe what the relay emitted.
    fn peer(arena: &mut ConnectionArena) -> (ConnKey, UnixStream) {
        let (local, remote) = UnixStream::pair().expect("socketpair");
        remote.set_nonblocking(true).expect("set_nonblocking");
        (arena.insert(Connection::peer(local.into())), remote)
    }

    fn push_bytes(arena: &mut ConnectionArena, key: ConnKey, bytes: &[u8]) {
        let conn = arena.get_mut(key).expect("connection is alive");
        conn.buf[conn.buf_len..conn.buf_len + bytes.len()].copy_from_slice(bytes);
        conn.buf_len += bytes.len();
    }

    fn read_available(stream: &mut UnixStream) -> Vec<u8> {
        let mut out = vec![0u8; 1024];
        match stream.read(&mut out) {
            Ok(n) => {
                out.truncate(n);
                out
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Vec::new(),
            Err(err) => panic!("read failed: {}", err),
        }
    }

    #[test]
    fn two_peers_one_message() {
        let mut arena = ConnectionArena::new();
        let mut index = UidIndex::new();
        let (a, mut a_remote) = peer(&mut arena);
        let (b, mut b_remote) = peer(&mut arena);

        push_bytes(&mut arena, a, &hex!("00 00 00 02 00 2a"));
        assert_eq!(pump_frames(&mut arena, &mut index, a, true), SourceState::Open);
        assert_eq!(arena.get(a).expect("alive").uid, Some(42));
        assert_eq!(index.find(42), Some(a));

        push_bytes(
            &mut arena,
            b,
            &hex!("00 00 00 02 00 07 00 00 00 08 12 34 00 2a de ad be ef"),
        );
        assert_eq!(pump_frames(&mut arena, &mut index, b, true), SourceState::Open);

        assert_eq!(
            read_available(&mut a_remote),
            hex!("00 00 00 06 12 34 de ad be ef")
        );
        assert!(read_available(&mut b_remote).is_empty());
        assert_eq!(arena.get(b).expect("alive").buf_len, 0);
    }

    #[test]
    fn unknown_destination_is_dropped_silently() {
        let mut arena = ConnectionArena::new();
        let mut index = UidIndex::new();
        let (a, mut a_remote) = peer(&mut arena);
        let (b, mut b_remote) = peer(&mut arena);

        push_bytes(&mut arena, a, &hex!("00 00 00 02 00 2a"));
        pump_frames(&mut arena, &mut index, a, true);

        push_bytes(
            &mut arena,
            b,
            &hex!("00 00 00 02 00 07 00 00 00 08 12 34 00 63 de ad be ef"),
        );
        assert_eq!(pump_frames(&mut arena, &mut index, b, true), SourceState::Open);

        assert!(read_available(&mut a_remote).is_empty());
        assert!(read_available(&mut b_remote).is_empty());
        assert!(arena.get(b).is_some());
    }

    #[test]
    fn byte_at_a_time_delivery_is_identical() {
        let mut arena = ConnectionArena::new();
        let mut index = UidIndex::new();
        let (a, mut a_remote) = peer(&mut arena);
        let (b, _b_remote) = peer(&mut arena);

        push_bytes(&mut arena, a, &hex!("00 00 00 02 00 2a"));
        pump_frames(&mut arena, &mut index, a, true);

        let bytes = hex!("00 00 00 02 00 07 00 00 00 08 12 34 00 2a de ad be ef");
        for byte in bytes {
            push_bytes(&mut arena, b, &[byte]);
            assert_eq!(pump_frames(&mut arena, &mut index, b, true), SourceState::Open);
        }

        assert_eq!(
            read_available(&mut a_remote),
            hex!("00 00 00 06 12 34 de ad be ef")
        );
    }

    #[test]
    fn oversize_frame_is_a_protocol_error() {
        let mut arena = ConnectionArena::new();
        let mut index = UidIndex::new();
        let (a, _a_remote) = peer(&mut arena);

        push_bytes(&mut arena, a, &hex!("00 00 00 02 00 2a"));
        pump_frames(&mut arena, &mut index, a, true);

        push_bytes(&mut arena, a, &hex!("7f ff ff ff 00 00"));
        match pump_frames(&mut arena, &mut index, a, true) {
            SourceState::ProtocolError(wire::FrameError::Oversize { size, .. }) => {
                assert_eq!(size, 0x7fff_ffff);
            }
            state => panic!("unexpected state: {:?}", state),
        }
    }

    #[test]
    fn undersized_addressed_frame_is_a_protocol_error() {
        let mut arena = ConnectionArena::new();
        let mut index = UidIndex::new();
        let (a, _a_remote) = peer(&mut arena);

        push_bytes(&mut arena, a, &hex!("00 00 00 02 00 2a 00 00 00 02 12 34"));
        assert_eq!(
            pump_frames(&mut arena, &mut index, a, true),
            SourceState::ProtocolError(wire::FrameError::ShortHeader { size: 2 })
        );
    }

    #[test]
    fn seventeen_destinations_evict_the_first() {
        let mut arena = ConnectionArena::new();
        let mut index = UidIndex::new();
        let (a, _a_remote) = peer(&mut arena);
        push_bytes(&mut arena, a, &hex!("00 00 00 02 00 64"));
        pump_frames(&mut arena, &mut index, a, true);

        let mut remotes = Vec::new();
        for uid in 1u16..=17 {
            let (key, remote) = peer(&mut arena);
            arena.get_mut(key).expect("alive").uid = Some(uid);
            index.insert(uid, key);
            remotes.push(remote);
        }

        for uid in 1u16..=17 {
            let mut frame = hex!("00 00 00 04 12 34 00 00").to_vec();
            frame[6..8].copy_from_slice(&uid.to_be_bytes());
            push_bytes(&mut arena, a, &frame);
            assert_eq!(pump_frames(&mut arena, &mut index, a, true), SourceState::Open);
        }

        let cached_uids: Vec<u16> = arena
            .get(a)
            .expect("alive")
            .cache
            .entries()
            .to_vec()
            .into_iter()
            .map(|key| arena.get(key).expect("alive").uid.expect("identified"))
            .collect();
        let expected: Vec<u16> = (2..=17).rev().collect();
        assert_eq!(cached_uids.len(), PEER_CACHE_SIZE);
        assert_eq!(cached_uids, expected);
    }

    #[test]
    fn decay_consumes_without_forwarding() {
        let mut arena = ConnectionArena::new();
        let mut index = UidIndex::new();
        let (a, mut a_remote) = peer(&mut arena);
        let (b, _b_remote) = peer(&mut arena);

        push_bytes(&mut arena, a, &hex!("00 00 00 02 00 2a"));
        pump_frames(&mut arena, &mut index, a, true);

        // announce still lands in the index while draining
        push_bytes(
            &mut arena,
            b,
            &hex!("00 00 00 02 00 07 00 00 00 08 12 34 00 2a de ad be ef"),
        );
        assert_eq!(pump_frames(&mut arena, &mut index, b, false), SourceState::Open);
        assert_eq!(index.find(7), Some(b));
        assert_eq!(arena.get(b).expect("alive").buf_len, 0);
        assert!(read_available(&mut a_remote).is_empty());
    }

    #[test]
    fn closed_destination_is_skipped_after_its_generation_bumps() {
        let mut arena = ConnectionArena::new();
        let mut index = UidIndex::new();
        let (a, _a_remote) = peer(&mut arena);
        let (b, _b_remote) = peer(&mut arena);

        push_bytes(&mut arena, a, &hex!("00 00 00 02 00 64"));
        pump_frames(&mut arena, &mut index, a, true);
        arena.get_mut(b).expect("alive").uid = Some(42);
        index.insert(42, b);

        // warm the cache, then close the destination
        push_bytes(&mut arena, a, &hex!("00 00 00 04 12 34 00 2a"));
        pump_frames(&mut arena, &mut index, a, true);
        let closed = arena.remove(b).expect("alive");
        index.remove(42, b);
        drop(closed);

        // the stale cache entry is swept, the frame dropped, the source kept
        push_bytes(&mut arena, a, &hex!("00 00 00 04 12 34 00 2a"));
        assert_eq!(pump_frames(&mut arena, &mut index, a, true), SourceState::Open);
        assert!(arena.get(a).expect("alive").cache.is_empty());
    }
}
