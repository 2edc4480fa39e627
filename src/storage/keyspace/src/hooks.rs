// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Seams to the collaborators around the keyspace core: journaling, tiered
//! storage, cluster topology, the cooperative scheduler, and connection
//! tracking. Everything is an object-safe trait with a do-nothing default
//! implementation so the core is testable in isolation.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{DbIndex, SlotId};

/// Total cluster slots.
pub const SLOT_COUNT: usize = 16384;

/// Journal opcode. Only the opcodes the core emits are listed; the command
/// layer extends the stream with its own entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalOp {
    Command,
    Expired,
}

/// Replication/persistence journal. The core records an `Expired` entry for
/// every eviction and passive expiry so replicas converge.
pub trait Journal {
    #[allow(clippy::too_many_arguments)]
    fn record_entry(
        &self,
        txid: u64,
        op: JournalOp,
        db_index: DbIndex,
        shard_count: u32,
        slot: Option<SlotId>,
        cmd: &str,
        args: &[&[u8]],
        multi_shard: bool,
    );

    fn record_expired(&self, db_index: DbIndex, slot: Option<SlotId>, key: &[u8]) {
        self.record_entry(
            0,
            JournalOp::Expired,
            db_index,
            1,
            slot,
            "DEL",
            &[key],
            false,
        );
    }
}

/// Paged value storage. `load` may suspend the calling fiber; the slice
/// re-resolves its iterators after it returns.
pub trait TieredStorage {
    /// Read an offloaded value back into memory. `None` means the extent is
    /// gone and the entry should be treated as lost.
    fn load(&self, db_index: DbIndex, key: &[u8]) -> Option<Vec<u8>>;

    /// Release the extent backing an offloaded value.
    fn free(&self, db_index: DbIndex, key: &[u8], handle: (u64, u32));

    /// Cancel one in-flight write.
    fn cancel_io(&self, db_index: DbIndex, request: u64);

    /// Cancel every in-flight write for a database; used by flush.
    fn cancel_all_ios(&self, db_index: DbIndex);
}

/// Cluster topology as the core needs it: slot math and membership.
pub trait ClusterView {
    fn is_enabled(&self) -> bool;

    fn is_emulated(&self) -> bool {
        false
    }

    fn key_slot(&self, key: &[u8]) -> SlotId;

    fn is_my_slot(&self, key: &[u8]) -> bool {
        let _ = key;
        true
    }
}

/// Cluster disabled: slot math still answers (slot 0) but nothing is kept.
#[derive(Default)]
pub struct NoCluster;

impl ClusterView for NoCluster {
    fn is_enabled(&self) -> bool {
        false
    }

    fn key_slot(&self, _key: &[u8]) -> SlotId {
        0
    }
}

/// CRC16 (XMODEM), the function the wire protocol prescribes for slot
/// placement.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// The hash-tag substring: the first non-empty `{...}` span, if any.
pub(crate) fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close) = key[open + 1..].iter().position(|&b| b == b'}') {
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

/// Standard slot placement over 16384 slots with hash-tag support.
pub struct RedisClusterView {
    emulated: bool,
}

impl RedisClusterView {
    pub fn new(emulated: bool) -> Self {
        Self { emulated }
    }
}

impl ClusterView for RedisClusterView {
    fn is_enabled(&self) -> bool {
        true
    }

    fn is_emulated(&self) -> bool {
        self.emulated
    }

    fn key_slot(&self, key: &[u8]) -> SlotId {
        crc16(hash_tag(key)) % SLOT_COUNT as u16
    }
}

/// Cooperative scheduling seam. Long traversals call `yield_now` at their
/// yield points and stop early when the process is shutting down.
pub trait Scheduler {
    fn yield_now(&self);

    fn is_shutting_down(&self) -> bool {
        false
    }
}

/// Scheduler for tests and single-task embeddings: yields are no-ops.
#[derive(Default)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn yield_now(&self) {}
}

/// The process-wide pool used to fan invalidation messages out to connection
/// threads. `dispatch_brief` invokes the callback once per pool thread, on
/// that thread.
pub trait ThreadPool {
    fn thread_count(&self) -> usize;

    fn dispatch_brief(&self, cb: Box<dyn FnMut(usize)>);
}

/// Single-threaded pool: runs the callback inline for thread 0.
#[derive(Default)]
pub struct InlinePool;

impl ThreadPool for InlinePool {
    fn thread_count(&self) -> usize {
        1
    }

    fn dispatch_brief(&self, mut cb: Box<dyn FnMut(usize)>) {
        cb(0);
    }
}

/// A connection that subscribed to client-side caching invalidation. The
/// slice holds weak references only; a dropped connection simply stops
/// receiving messages.
pub trait TrackedClient {
    /// Index of the thread that owns the connection.
    fn thread(&self) -> usize;

    fn is_tracking_on(&self) -> bool;

    fn send_invalidation(&self, key: &[u8]);
}

/// Per-connection WATCH marker. The slice flips `dirty` once on the first
/// mutation of any watched key; the transaction layer reads and resets it.
#[derive(Default, Debug)]
pub struct WatchHandle {
    dirty: AtomicBool,
}

impl WatchHandle {
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.dirty.store(false, Ordering::Relaxed);
    }
}

/// Coarse process state, shared with the slice by the server runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalState {
    Loading,
    Running,
    ShuttingDown,
}

/// Injected replica/loading state. On replicas, passive expiry and eviction
/// are disabled; while loading, memory limits are not applied to inserts.
pub struct ServerState {
    replica: Cell<bool>,
    gstate: Cell<GlobalState>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            replica: Cell::new(false),
            gstate: Cell::new(GlobalState::Running),
        }
    }
}

impl ServerState {
    pub fn is_replica(&self) -> bool {
        self.replica.get()
    }

    pub fn set_replica(&self, replica: bool) {
        self.replica.set(replica);
    }

    pub fn gstate(&self) -> GlobalState {
        self.gstate.get()
    }

    pub fn set_gstate(&self, state: GlobalState) {
        self.gstate.set(state);
    }
}
