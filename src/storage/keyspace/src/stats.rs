// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Per-table and per-slice statistics. These are plain data returned to
//! callers; aggregation across shards happens above this crate.

use log::error;
use serde::Serialize;

use crate::{ObjType, SlotId};

/// Number of object types tracked by per-type memory accounting.
pub const OBJ_TYPE_MAX: usize = 6;

/// Statistics owned by one database table.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DbTableStats {
    /// Entries whose key is stored in place.
    pub inline_keys: u64,

    /// Object memory usage besides table capacity; any non-inline payload.
    pub obj_memory_usage: u64,

    pub listpack_blob_cnt: u64,
    pub listpack_bytes: u64,
    pub tiered_entries: u64,
    pub tiered_size: u64,

    memory_usage_by_type: [u64; OBJ_TYPE_MAX],
}

impl DbTableStats {
    /// Apply a signed delta to one type's memory usage and the total.
    /// Underflow indicates an accounting bug; it is logged and clamped.
    pub fn add_type_memory_usage(&mut self, obj_type: ObjType, delta: i64) {
        let slot = &mut self.memory_usage_by_type[obj_type as usize];
        if delta < 0 && slot.checked_sub(delta.unsigned_abs()).is_none() {
            error!(
                "memory usage for type {:?} underflowed by {}",
                obj_type,
                delta.unsigned_abs() - *slot
            );
            self.obj_memory_usage = self.obj_memory_usage.saturating_sub(*slot);
            *slot = 0;
            return;
        }
        *slot = slot.wrapping_add_signed(delta);
        if delta < 0 {
            self.obj_memory_usage = self.obj_memory_usage.saturating_sub(delta.unsigned_abs());
        } else {
            self.obj_memory_usage += delta as u64;
        }
    }

    pub fn memory_usage_by_type(&self, obj_type: ObjType) -> u64 {
        self.memory_usage_by_type[obj_type as usize]
    }
}

impl core::ops::AddAssign<&DbTableStats> for DbTableStats {
    fn add_assign(&mut self, o: &DbTableStats) {
        self.inline_keys += o.inline_keys;
        self.obj_memory_usage += o.obj_memory_usage;
        self.listpack_blob_cnt += o.listpack_blob_cnt;
        self.listpack_bytes += o.listpack_bytes;
        self.tiered_entries += o.tiered_entries;
        self.tiered_size += o.tiered_size;
        for (mine, theirs) in self
            .memory_usage_by_type
            .iter_mut()
            .zip(o.memory_usage_by_type.iter())
        {
            *mine += theirs;
        }
    }
}

/// Statistics for one cluster slot; kept only when cluster mode is enabled.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SlotStats {
    pub key_count: u64,
    pub total_reads: u64,
    pub total_writes: u64,
    pub memory_bytes: i64,
}

impl core::ops::AddAssign<&SlotStats> for SlotStats {
    fn add_assign(&mut self, o: &SlotStats) {
        self.key_count += o.key_count;
        self.total_reads += o.total_reads;
        self.total_writes += o.total_writes;
        self.memory_bytes += o.memory_bytes;
    }
}

pub(crate) fn account_slot_memory(slots: &mut [SlotStats], slot: SlotId, delta: i64) {
    if let Some(s) = slots.get_mut(slot as usize) {
        s.memory_bytes += delta;
    }
}

/// One database's stats snapshot: the table stats plus derived table-level
/// figures.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DbStats {
    #[serde(flatten)]
    pub table: DbTableStats,
    pub key_count: u64,
    pub expire_count: u64,
    pub bucket_count: u64,
    pub table_mem_usage: u64,
}

impl core::ops::AddAssign<&DbStats> for DbStats {
    fn add_assign(&mut self, o: &DbStats) {
        self.table += &o.table;
        self.key_count += o.key_count;
        self.expire_count += o.expire_count;
        self.bucket_count += o.bucket_count;
        self.table_mem_usage += o.table_mem_usage;
    }
}

/// Event counters for one slice, monotonically increasing.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SliceEvents {
    pub evicted_keys: u64,
    pub hard_evictions: u64,
    pub expired_keys: u64,
    pub garbage_collected: u64,
    pub stash_unloaded: u64,
    pub bumpups: u64,
    pub garbage_checked: u64,
    pub hits: u64,
    pub misses: u64,
    pub mutations: u64,
    pub insertion_rejections: u64,
    pub update: u64,
}

impl core::ops::AddAssign<&SliceEvents> for SliceEvents {
    fn add_assign(&mut self, o: &SliceEvents) {
        self.evicted_keys += o.evicted_keys;
        self.hard_evictions += o.hard_evictions;
        self.expired_keys += o.expired_keys;
        self.garbage_collected += o.garbage_collected;
        self.stash_unloaded += o.stash_unloaded;
        self.bumpups += o.bumpups;
        self.garbage_checked += o.garbage_checked;
        self.hits += o.hits;
        self.misses += o.misses;
        self.mutations += o.mutations;
        self.insertion_rejections += o.insertion_rejections;
        self.update += o.update;
    }
}

/// Full slice snapshot returned by `DbSlice::get_stats`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Stats {
    pub events: SliceEvents,
    pub db_stats: Vec<DbStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_memory_accounting_balances() {
        let mut stats = DbTableStats::default();
        stats.add_type_memory_usage(ObjType::String, 100);
        stats.add_type_memory_usage(ObjType::Hash, 50);
        assert_eq!(stats.obj_memory_usage, 150);
        stats.add_type_memory_usage(ObjType::String, -100);
        stats.add_type_memory_usage(ObjType::Hash, -50);
        assert_eq!(stats.obj_memory_usage, 0);
        assert_eq!(stats.memory_usage_by_type(ObjType::String), 0);
    }

    #[test]
    fn underflow_is_clamped() {
        let mut stats = DbTableStats::default();
        stats.add_type_memory_usage(ObjType::Set, 10);
        stats.add_type_memory_usage(ObjType::Set, -25);
        assert_eq!(stats.memory_usage_by_type(ObjType::Set), 0);
    }

    #[test]
    fn merge_adds_fields() {
        let mut a = SliceEvents::default();
        let mut b = SliceEvents::default();
        a.hits = 3;
        b.hits = 4;
        b.expired_keys = 1;
        a += &b;
        assert_eq!(a.hits, 7);
        assert_eq!(a.expired_keys, 1);
    }
}
