// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Eviction and cache-promotion policies.
//!
//! [`PrimeEvictionPolicy`] is the handle the prime table calls back into when
//! an insert finds its segment full: it decides between growing the
//! directory, garbage-collecting expired neighbors of the hotspot, and
//! evicting a cold stash entry. [`PrimeBumpPolicy`] guards cache promotion:
//! sticky entries and entries already promoted in the current batch are never
//! demoted to make room.

use dash::{BumpPolicy, DashTable, Hotspot, InsertPolicy};
use log::debug;

use crate::db_slice::{expire_if_needed, lock_key, perform_deletion, KeySet, SliceParts,
    TableSansPrime};
use crate::{Key, Value};

type PrimeTable = DashTable<Key, Value>;

/// Insert-pressure policy bound to one insert call. Wraps the slice state and
/// the sibling tables of the database being inserted into.
pub struct PrimeEvictionPolicy<'a, 'p> {
    parts: &'a mut SliceParts<'p>,
    rest: &'a mut TableSansPrime<'p>,
    mem_budget: i64,
    soft_limit: i64,
    bytes_per_object: i64,
    can_evict: bool,
    apply_memory_limit: bool,
    evicted: u32,
    checked: u32,
}

impl<'a, 'p> PrimeEvictionPolicy<'a, 'p> {
    pub(crate) fn new(
        parts: &'a mut SliceParts<'p>,
        rest: &'a mut TableSansPrime<'p>,
        mem_budget: i64,
        soft_limit: i64,
        bytes_per_object: i64,
        can_evict: bool,
        apply_memory_limit: bool,
    ) -> Self {
        Self {
            parts,
            rest,
            mem_budget,
            soft_limit,
            bytes_per_object,
            can_evict,
            apply_memory_limit,
            evicted: 0,
            checked: 0,
        }
    }

    pub fn mem_budget(&self) -> i64 {
        self.mem_budget
    }

    pub fn evicted(&self) -> u32 {
        self.evicted
    }

    pub fn checked(&self) -> u32 {
        self.checked
    }

    fn segment_bytes(table: &PrimeTable) -> i64 {
        (table.mem_usage() / table.segment_count()) as i64
    }
}

impl InsertPolicy<Key, Value> for PrimeEvictionPolicy<'_, '_> {
    fn record_split(&mut self, table: &PrimeTable) {
        self.mem_budget -= Self::segment_bytes(table);
        debug!("segment split, budget now {}", self.mem_budget);
    }

    fn can_grow(&self, table: &PrimeTable) -> bool {
        if !self.apply_memory_limit || self.mem_budget > self.soft_limit {
            return true;
        }
        debug_assert!(table.len() <= table.capacity());

        // Under the soft limit, estimate what the current capacity will cost
        // once filled, not what it costs today: growth that fits now can
        // still blow the budget as the half-empty segments fill up.
        let new_available = (table.capacity() - table.len()) as i64
            + table.layout().segment_capacity() as i64;
        let projected = Self::segment_bytes(table) as f64
            + self.bytes_per_object as f64 * new_available as f64 * 1.1;
        self.mem_budget as f64 > projected
    }

    fn garbage_collect(&mut self, hotspot: &Hotspot, table: &mut PrimeTable) -> usize {
        let mut freed = 0;
        // regular buckets only: stash buckets fill last, so the chance they
        // hold expired entries is much smaller
        for bucket in hotspot.regular_buckets() {
            for slot in 0..table.layout().slots() {
                let Some(it) = table.entry_at(hotspot.segment(), bucket, slot) else {
                    continue;
                };
                if !table.value_at(it).has_expire() {
                    continue;
                }
                self.checked += 1;
                if expire_if_needed(self.parts, table, self.rest, it) {
                    freed += 1;
                }
            }
        }
        freed
    }

    fn evict(&mut self, hotspot: &Hotspot, table: &mut PrimeTable) -> usize {
        if !self.can_evict {
            return 0;
        }
        let layout = table.layout();
        // spread eviction across stash buckets by the incoming key's hash
        let stash_bucket = layout.regular_buckets()
            + (hotspot.key_hash() % layout.stash_buckets() as u64) as u32;
        let victim = (0..layout.slots())
            .rev()
            .find_map(|slot| table.entry_at(hotspot.segment(), stash_bucket, slot));
        let Some(victim) = victim else {
            return 0;
        };
        if table.key_at(victim).is_sticky() {
            return 0;
        }
        let key: Box<[u8]> = table.key_at(victim).as_bytes().into();
        if self
            .rest
            .trans_locks
            .contains_key(lock_key(self.parts.cluster, &key))
        {
            return 0;
        }

        // replicas learn of the eviction as an expiration
        if let Some(journal) = self.parts.journal {
            let slot = self
                .parts
                .cluster
                .is_enabled()
                .then(|| self.parts.cluster.key_slot(&key));
            journal.record_expired(self.rest.index, slot, &key);
        }

        perform_deletion(self.parts, table, self.rest, victim);
        self.evicted += 1;
        1
    }
}

/// Guards cache promotion: an entry may be demoted out of its slot only if it
/// is neither sticky nor already promoted in the current batch.
pub(crate) struct PrimeBumpPolicy<'a> {
    bumped: &'a KeySet,
}

impl<'a> PrimeBumpPolicy<'a> {
    pub(crate) fn new(bumped: &'a KeySet) -> Self {
        Self { bumped }
    }
}

impl BumpPolicy<Key> for PrimeBumpPolicy<'_> {
    fn can_bump_down(&self, key: &Key) -> bool {
        !key.is_sticky() && !self.bumped.contains(key.as_bytes())
    }
}

/// Aggressive in-segment reclamation used when an insert leaves the budget
/// negative: walk the inserted entry's segment, stash buckets first, then
/// regular buckets rotating from the inserted bucket, deleting until the
/// goal is met. Skips the inserted entry and sticky items.
#[cfg(feature = "hard-eviction")]
pub(crate) fn evict_objects(
    parts: &mut SliceParts<'_>,
    prime: &mut PrimeTable,
    rest: &mut TableSansPrime<'_>,
    memory_to_free: usize,
    keep: dash::EntryRef,
) -> usize {
    if parts.is_replica {
        return 0;
    }
    let layout = prime.layout();
    let seg = keep.segment();
    let mut freed = 0usize;
    let mut evicted = 0u64;

    'done: {
        for bucket in layout.regular_buckets()..layout.total_buckets() {
            for slot in (0..layout.slots()).rev() {
                let Some(it) = prime.entry_at(seg, bucket, slot) else {
                    continue;
                };
                let locked = rest
                    .trans_locks
                    .contains_key(lock_key(parts.cluster, prime.key_at(it).as_bytes()));
                if it == keep || prime.key_at(it).is_sticky() || locked {
                    continue;
                }
                freed += prime.key_at(it).mem_used() + prime.value_at(it).mem_used();
                perform_deletion(parts, prime, rest, it);
                evicted += 1;
                if freed > memory_to_free {
                    break 'done;
                }
            }
        }

        for slot in (0..layout.slots()).rev() {
            for i in 0..layout.regular_buckets() {
                let bucket = (keep.bucket() + i) % layout.regular_buckets();
                let Some(it) = prime.entry_at(seg, bucket, slot) else {
                    continue;
                };
                let locked = rest
                    .trans_locks
                    .contains_key(lock_key(parts.cluster, prime.key_at(it).as_bytes()));
                if it == keep || prime.key_at(it).is_sticky() || locked {
                    continue;
                }
                freed += prime.key_at(it).mem_used() + prime.value_at(it).mem_used();
                perform_deletion(parts, prime, rest, it);
                evicted += 1;
                if freed > memory_to_free {
                    break 'done;
                }
            }
        }
    }

    if evicted > 0 {
        debug!("hard eviction removed {} items, freed {} bytes", evicted, freed);
        parts.events.evicted_keys += evicted;
        parts.events.hard_evictions += evicted;
    }
    freed
}
