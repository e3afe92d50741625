//! Process-wide memo tables for tetrahedron navigation.
//!
//! Three fixed-size, direct-mapped tables, all keyed by a 64-bit hash of
//! `(anchor, level, type)`: key lookup (`Tet` → [`TetKey`]), parent lookup
//! (`Tet` → parent `Tet`), and parent-type lookup (`Tet` → type byte,
//! consulted when the parent table misses so a freshly derived type can
//! still seed the parent it belongs to). A collision simply overwrites the
//! slot, and a miss falls through to recomputation, so the tables are never
//! a source of errors — only of saved work.
//!
//! The shared instance is created at first use and lives for the process.
//! Each slot sits behind its own `parking_lot::Mutex`, which keeps a read
//! and a concurrent overwrite of the same slot from ever mixing one entry's
//! key with another's value. A thread-local mirror is available for
//! workloads where even per-slot locking shows up in profiles.

use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::tet::tet::Tet;
use crate::tet::tet_key::TetKey;

const TM_SLOTS: usize = 65_536;
const PARENT_SLOTS: usize = 16_384;
const PARENT_TYPE_SLOTS: usize = 65_536;

struct Table<V: Copy> {
    slots: Box<[Mutex<Option<(Tet, V)>>]>,
}

impl<V: Copy> Table<V> {
    fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Table {
            slots: (0..len).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn slot(&self, key: &Tet) -> &Mutex<Option<(Tet, V)>> {
        &self.slots[(hash(key) as usize) & (self.slots.len() - 1)]
    }

    fn get(&self, key: &Tet) -> Option<V> {
        match *self.slot(key).lock() {
            Some((stored, value)) if stored == *key => Some(value),
            _ => None,
        }
    }

    fn put(&self, key: &Tet, value: V) {
        *self.slot(key).lock() = Some((*key, value));
    }
}

fn hash(tet: &Tet) -> u64 {
    let a = tet.anchor();
    let mut h = a[0]
        ^ a[1].rotate_left(21)
        ^ a[2].rotate_left(42)
        ^ ((tet.level() as u64) << 56)
        ^ ((tet.tet_type() as u64) << 59);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h
}

pub struct TetCache {
    tm: Table<TetKey>,
    parent: Table<Tet>,
    parent_type: Table<u8>,
}

impl TetCache {
    pub fn new() -> Self {
        TetCache {
            tm: Table::new(TM_SLOTS),
            parent: Table::new(PARENT_SLOTS),
            parent_type: Table::new(PARENT_TYPE_SLOTS),
        }
    }

    pub fn get_tm(&self, tet: &Tet) -> Option<TetKey> {
        self.tm.get(tet)
    }

    pub fn put_tm(&self, tet: &Tet, key: TetKey) {
        self.tm.put(tet, key);
    }

    pub fn get_parent(&self, tet: &Tet) -> Option<Tet> {
        self.parent.get(tet)
    }

    pub fn put_parent(&self, tet: &Tet, parent: Tet) {
        self.parent.put(tet, parent);
    }

    pub fn get_parent_type(&self, tet: &Tet) -> Option<u8> {
        self.parent_type.get(tet)
    }

    pub fn put_parent_type(&self, tet: &Tet, tet_type: u8) {
        self.parent_type.put(tet, tet_type);
    }
}

impl Default for TetCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared process-wide cache.
pub fn global() -> &'static TetCache {
    static CACHE: OnceLock<TetCache> = OnceLock::new();
    CACHE.get_or_init(TetCache::new)
}

thread_local! {
    static LOCAL: TetCache = TetCache::new();
}

/// Run `f` against this thread's private cache instead of the shared one.
pub fn with_thread_local<R>(f: impl FnOnce(&TetCache) -> R) -> R {
    LOCAL.with(|cache| f(cache))
}
