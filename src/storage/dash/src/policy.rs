// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::table::DashTable;
use crate::TableKey;

/// The buckets probed by an insert that found no room, handed to the policy so
/// it can clean up exactly the neighborhood that is under pressure.
#[derive(Clone, Copy, Debug)]
pub struct Hotspot {
    pub(crate) segment: u32,
    pub(crate) regular: [u32; 2],
    pub(crate) key_hash: u64,
}

impl Hotspot {
    /// Segment id of the hotspot.
    #[inline]
    pub fn segment(&self) -> u32 {
        self.segment
    }

    /// The probed regular buckets: the home bucket and its neighbor.
    #[inline]
    pub fn regular_buckets(&self) -> [u32; 2] {
        self.regular
    }

    /// Hash of the key being inserted; used to spread stash eviction.
    #[inline]
    pub fn key_hash(&self) -> u64 {
        self.key_hash
    }
}

/// Decides what an insert may do when its target segment is out of room.
/// Consulted in a fixed order: grow, then collect garbage, then evict.
pub trait InsertPolicy<K: TableKey, V> {
    /// Called once per segment split so the policy can debit its budget.
    fn record_split(&mut self, table: &DashTable<K, V>);

    /// May the directory spend more memory?
    fn can_grow(&self, table: &DashTable<K, V>) -> bool;

    /// Synchronously clean the hotspot neighborhood; returns freed slots.
    fn garbage_collect(&mut self, hotspot: &Hotspot, table: &mut DashTable<K, V>) -> usize;

    /// Evict from the hotspot's stash buckets; returns freed slots. Must not
    /// evict entries the caller has pinned (sticky or locked).
    fn evict(&mut self, hotspot: &Hotspot, table: &mut DashTable<K, V>) -> usize;
}

/// Policy for tables without a memory ceiling: always grow, never clean.
#[derive(Default)]
pub struct UnboundedGrowth;

impl<K: TableKey, V> InsertPolicy<K, V> for UnboundedGrowth {
    fn record_split(&mut self, _table: &DashTable<K, V>) {}

    fn can_grow(&self, _table: &DashTable<K, V>) -> bool {
        true
    }

    fn garbage_collect(&mut self, _hotspot: &Hotspot, _table: &mut DashTable<K, V>) -> usize {
        0
    }

    fn evict(&mut self, _hotspot: &Hotspot, _table: &mut DashTable<K, V>) -> usize {
        0
    }
}

/// Policy that refuses everything; inserts into a full segment fail. Useful
/// for tests that pin the directory shape.
#[derive(Default)]
pub struct NeverGrow;

impl<K: TableKey, V> InsertPolicy<K, V> for NeverGrow {
    fn record_split(&mut self, _table: &DashTable<K, V>) {}

    fn can_grow(&self, _table: &DashTable<K, V>) -> bool {
        false
    }

    fn garbage_collect(&mut self, _hotspot: &Hotspot, _table: &mut DashTable<K, V>) -> usize {
        0
    }

    fn evict(&mut self, _hotspot: &Hotspot, _table: &mut DashTable<K, V>) -> usize {
        0
    }
}

/// Decides whether an entry may be demoted to make room for a promoted one.
pub trait BumpPolicy<K: TableKey> {
    /// Returns true if `key`'s entry can be made less important, i.e. moved
    /// away from its lookup-optimal position.
    fn can_bump_down(&self, key: &K) -> bool;
}

impl<K: TableKey, F: Fn(&K) -> bool> BumpPolicy<K> for F {
    fn can_bump_down(&self, key: &K) -> bool {
        self(key)
    }
}
