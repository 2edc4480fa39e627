// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Shard-level scheduling around the slice: the heartbeat.
//!
//! The heartbeat is a periodic cooperative task pinned to the shard thread.
//! Each tick it advances the expired-key sweep, reclaims memory by eviction
//! when usage crosses the armed threshold, and tears down tables retired by
//! flushes, all without yielding mid-walk.

use config::Heartbeat;

use crate::db_slice::{Context, DbSlice};
use crate::DbIndex;

/// Expire rows inspected per database per tick.
const EXPIRE_STEP: u32 = 20;

/// Outcome of one heartbeat tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeartbeatStats {
    pub expired_deleted: u32,
    pub evicted: usize,
    pub tables_finalized: usize,
}

/// One shard's context: the slice plus its periodic duties.
pub struct ShardContext {
    slice: DbSlice,
    heartbeat: Heartbeat,
    memory_limit: usize,
}

impl ShardContext {
    pub fn new(slice: DbSlice, heartbeat: Heartbeat, memory_limit: usize) -> Self {
        Self {
            slice,
            heartbeat,
            memory_limit,
        }
    }

    pub fn slice(&self) -> &DbSlice {
        &self.slice
    }

    pub fn slice_mut(&mut self) -> &mut DbSlice {
        &mut self.slice
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Run one tick of the shard's periodic duties.
    pub fn heartbeat(&mut self, time_now_ms: u64) -> HeartbeatStats {
        let mut stats = HeartbeatStats::default();

        for db_index in 0..self.slice.db_array_size() as DbIndex {
            if !self.slice.is_db_valid(db_index) {
                continue;
            }
            let cntx = Context::new(db_index, time_now_ms);
            let swept = self.slice.delete_expired_step(cntx, EXPIRE_STEP);
            stats.expired_deleted += swept.deleted;
        }

        // memory pressure: evict down to the armed threshold
        if !self.slice.is_replica() {
            let used = self.slice.used_memory();
            let threshold =
                (self.memory_limit as f64 * self.heartbeat.eviction_memory_ratio()) as usize;
            if used > threshold {
                let goal = used - threshold;
                for db_index in 0..self.slice.db_array_size() as DbIndex {
                    if !self.slice.is_db_valid(db_index) {
                        continue;
                    }
                    let cntx = Context::new(db_index, time_now_ms);
                    stats.evicted += self.slice.free_mem_with_eviction_step(cntx, goal);
                    if self.slice.used_memory() <= threshold {
                        break;
                    }
                }
            }
        }

        stats.tables_finalized = self.slice.finalize_retired_tables();
        stats
    }
}
