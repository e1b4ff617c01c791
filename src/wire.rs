//! The peer wire format.
//!
//! Every frame starts with a 4-byte big-endian size counting the bytes that
//! follow it. The first frame on a connection announces the peer's UID;
//! every later frame addresses another peer and is relayed with the
//! destination UID stripped from its header.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Bytes of the length prefix.
pub const SIZE_PREFIX: usize = 4;

/// Bytes following the prefix in an addressed header: port, destination UID.
pub const ADDRESSED_HEADER: usize = 4;

/// Bytes following the prefix in a UID announce.
pub const ANNOUNCE_HEADER: usize = 2;

/// The relayed header is two bytes shorter than the inbound one: the
/// destination UID is elided.
pub const DELIVERY_SHIFT: usize = 2;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {capacity} byte connection buffer")]
    Oversize { size: usize, capacity: usize },
    #[error("frame of {size} bytes is too short for its header")]
    ShortHeader { size: usize },
}

/// The decoded length field, or None if fewer than four bytes are buffered.
pub fn frame_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < SIZE_PREFIX {
        return None;
    }
    Some(BigEndian::read_u32(&buf[..SIZE_PREFIX]) as usize)
}

/// The UID carried by an announce frame.
pub fn announce_uid(frame: &[u8]) -> u16 {
    BigEndian::read_u16(&frame[SIZE_PREFIX..SIZE_PREFIX + 2])
}

/// The destination UID of an addressed frame.
pub fn dest_uid(frame: &[u8]) -> u16 {
    BigEndian::read_u16(&frame[SIZE_PREFIX + 2..SIZE_PREFIX + 4])
}

/// Rewrites an addressed frame into its relayed form in place and returns
/// the outbound bytes.
///
/// The relayed layout overlays the inbound one at a two-byte offset and
/// shares the payload tail, so the payload is never copied.
pub fn rewrite_for_delivery(frame: &mut [u8]) -> &[u8] {
    let size = BigEndian::read_u32(&frame[..SIZE_PREFIX]) as usize;
    let port = BigEndian::read_u16(&frame[SIZE_PREFIX..SIZE_PREFIX + 2]);
    BigEndian::write_u32(
        &mut frame[DELIVERY_SHIFT..DELIVERY_SHIFT + SIZE_PREFIX],
        (size - DELIVERY_SHIFT) as u32,
    );
    BigEndian::write_u16(
        &mut frame[DELIVERY_SHIFT + SIZE_PREFIX..DELIVERY_SHIFT + SIZE_PREFIX + 2],
        port,
    );
    &frame[DELIVERY_SHIFT..]
}
