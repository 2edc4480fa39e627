// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! One SELECT-able database: the prime table and everything bound to it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use dash::{Cursor, DashTable, Layout};

use crate::hooks::WatchHandle;
use crate::intent_lock::LockTable;
use crate::stats::{DbTableStats, SlotStats};
use crate::top_keys::TopKeys;
use crate::{DbIndex, ExpirePeriod, Key, Value, SLOT_COUNT};

pub type PrimeTable = DashTable<Key, Value>;
pub type ExpireTable = DashTable<Key, ExpirePeriod>;
pub type McFlagTable = DashTable<Key, u32>;

pub(crate) type WatchedMap = HashMap<Box<[u8]>, Vec<Rc<WatchHandle>>, ahash::RandomState>;

/// A single database within a shard. Tables are reference-counted so a
/// snapshot can retain a frozen view across a flush; the slice is the only
/// mutator.
pub struct DbTable {
    pub prime: PrimeTable,
    pub expire: ExpireTable,
    pub mcflag: McFlagTable,

    /// Transaction intent locks.
    pub trans_locks: LockTable,

    /// Waiters per watched key.
    pub(crate) watched_keys: WatchedMap,

    pub stats: DbTableStats,
    pub slots_stats: Vec<SlotStats>,
    pub expire_cursor: Cursor,

    pub top_keys: TopKeys,
    pub index: DbIndex,
}

impl DbTable {
    pub fn new(
        prime_layout: Layout,
        expire_layout: Layout,
        index: DbIndex,
        cluster_enabled: bool,
    ) -> Self {
        let slots_stats = if cluster_enabled {
            vec![SlotStats::default(); SLOT_COUNT]
        } else {
            Vec::new()
        };
        Self {
            prime: PrimeTable::new(prime_layout),
            expire: ExpireTable::new(expire_layout),
            mcflag: McFlagTable::new(expire_layout),
            trans_locks: LockTable::default(),
            watched_keys: WatchedMap::default(),
            stats: DbTableStats::default(),
            slots_stats,
            expire_cursor: Cursor::default(),
            top_keys: TopKeys::new(0, 1),
            index,
        }
    }

    /// Table memory: the hash structures themselves, not the objects.
    pub fn table_mem_usage(&self) -> usize {
        self.prime.mem_usage() + self.expire.mem_usage()
    }
}

pub type DbTableRef = Rc<RefCell<DbTable>>;
