//! Connection records, the slotted arena that owns them, the global UID
//! index, and the per-connection peer cache.

use std::{collections::BTreeMap, fmt, os::fd::OwnedFd};

/// Capacity of the per-connection peer cache.
pub const PEER_CACHE_SIZE: usize = 16;

/// Read buffer capacity for peer connections. At most one partial frame is
/// buffered, so this also bounds the largest acceptable frame.
pub const PEER_BUF_SIZE: usize = 4032;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Role {
    TcpListener,
    TcpPeer,
    CtrlListener,
    CtrlConn,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Protocol {
    Tcp,
    Local,
}

/// Generational handle to an arena slot.
///
/// Packs losslessly into the u64 payload of an epoll event. A handle stops
/// resolving the moment its connection is removed, so stale peer-cache
/// entries and stale readiness events from the same wakeup batch are
/// harmless.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ConnKey {
    index: u32,
    generation: u32,
}

impl ConnKey {
    pub fn token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// One socket being multiplexed.
pub struct Connection {
    pub fd: OwnedFd,
    pub role: Role,
    pub protocol: Protocol,
    /// Set at most once, from the first frame the peer sends.
    pub uid: Option<u16>,
    pub buf: Box<[u8]>,
    pub buf_len: usize,
    /// Printable bind address; listeners only.
    pub label: String,
    pub cache: PeerCache,
}

impl Connection {
    pub fn peer(fd: OwnedFd) -> Self {
        Self {
            fd,
            role: Role::TcpPeer,
            protocol: Protocol::Tcp,
            uid: None,
            buf: vec![0u8; PEER_BUF_SIZE].into_boxed_slice(),
            buf_len: 0,
            label: String::new(),
            cache: PeerCache::new(),
        }
    }

    pub fn listener(fd: OwnedFd, label: String) -> Self {
        Self {
            fd,
            role: Role::TcpListener,
            protocol: Protocol::Tcp,
            uid: None,
            buf: Vec::new().into_boxed_slice(),
            buf_len: 0,
            label,
            cache: PeerCache::new(),
        }
    }

    pub fn control(fd: OwnedFd, role: Role) -> Self {
        Self {
            fd,
            role,
            protocol: Protocol::Local,
            uid: None,
            buf: Vec::new().into_boxed_slice(),
            buf_len: 0,
            label: String::new(),
            cache: PeerCache::new(),
        }
    }

    /// An idle connection has no partially read frame and may be handed off.
    pub fn is_idle(&self) -> bool {
        self.buf_len == 0
    }
}

struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// Slotted store of connections addressed by generational handles.
///
/// Removal bumps the slot generation, so every outstanding handle to the
/// removed connection stops resolving at once; cache entries are weak by
/// construction and need no cross-connection bookkeeping on close.
#[derive(Default)]
pub struct ConnectionArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl ConnectionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Connection) -> ConnKey {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.conn.is_none());
                slot.conn = Some(conn);
                ConnKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    conn: Some(conn),
                });
                ConnKey {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub fn remove(&mut self, key: ConnKey) -> Option<Connection> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation || slot.conn.is_none() {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        slot.conn.take()
    }

    pub fn get(&self, key: ConnKey) -> Option<&Connection> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.conn.as_ref()
    }

    pub fn get_mut(&mut self, key: ConnKey) -> Option<&mut Connection> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.conn.as_mut()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Peer-cache lookup for `uid` in `src`'s cache. Entries that no longer
    /// resolve, or whose target has lost its UID, are swept as part of the
    /// scan. A hit is not promoted; only insertion refreshes recency.
    pub fn cache_find(&mut self, src: ConnKey, uid: u16) -> Option<ConnKey> {
        let entries = self.get(src)?.cache.entries().to_vec();
        let mut kept = Vec::with_capacity(entries.len());
        let mut hit = None;
        for key in entries {
            match self.get(key).and_then(|conn| conn.uid) {
                // dead or tombstoned target; swept
                None => continue,
                Some(target_uid) => {
                    if hit.is_none() && target_uid == uid {
                        hit = Some(key);
                    }
                    kept.push(key);
                }
            }
        }
        if let Some(conn) = self.get_mut(src) {
            conn.cache.replace_entries(kept);
        }
        hit
    }

    pub fn cache_insert(&mut self, src: ConnKey, peer: ConnKey) {
        if let Some(conn) = self.get_mut(src) {
            conn.cache.insert(peer);
        }
    }
}

/// Bounded MRU of destination handles, newest first.
///
/// Amortises UID-index lookups for chatty peer pairs without a global
/// structure that would grow with the square of the peer count.
pub struct PeerCache {
    entries: Vec<ConnKey>,
}

impl PeerCache {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(PEER_CACHE_SIZE),
        }
    }

    pub fn entries(&self) -> &[ConnKey] {
        &self.entries
    }

    fn replace_entries(&mut self, entries: Vec<ConnKey>) {
        self.entries = entries;
    }

    /// Inserts at the front; the entry pushed beyond capacity is evicted.
    pub fn insert(&mut self, key: ConnKey) {
        self.entries.insert(0, key);
        self.entries.truncate(PEER_CACHE_SIZE);
    }

    pub fn remove(&mut self, key: ConnKey) {
        self.entries.retain(|k| *k != key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PeerCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Global routing table: peer UID → connection handle, unique keys.
#[derive(Default)]
pub struct UidIndex {
    map: BTreeMap<u16, ConnKey>,
}

impl UidIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// A duplicate claim replaces the prior entry; the displaced handle is
    /// returned so the caller can log it. The displaced connection keeps
    /// functioning but is no longer addressable by this UID.
    pub fn insert(&mut self, uid: u16, key: ConnKey) -> Option<ConnKey> {
        self.map.insert(uid, key)
    }

    pub fn find(&self, uid: u16) -> Option<ConnKey> {
        self.map.get(&uid).copied()
    }

    /// Identity-checked erase: a displaced connection closing must not evict
    /// its successor's mapping.
    pub fn remove(&mut self, uid: u16, key: ConnKey) {
        if self.map.get(&uid) == Some(&key) {
            self.map.remove(&uid);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (u16, ConnKey)> + '_ {
        self.map.iter().map(|(uid, key)| (*uid, *key))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
