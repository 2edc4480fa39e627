// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Shard-local keyspace custodian.
//!
//! A shard is one thread's exclusive partition of the key space. Its
//! [`DbSlice`] owns every numbered database assigned to the shard and
//! mediates all access to them: lookups with expiration-on-access, inserts
//! under a memory-aware eviction policy, scoped update commits, intent
//! locking, change callbacks for snapshot and replication consumers, watch
//! and client-tracking invalidation, and flushes.
//!
//! The [`ShardContext`] wraps a slice together with its periodic duties: the
//! heartbeat sweeps expired keys, evicts under memory pressure when caching
//! is enabled, and tears down retired tables off the hot path.
//!
//! All mutation is single-threaded and cooperative: operations may only
//! suspend at the explicit points documented on them (tiered loads, flush
//! yields), and everything else runs to completion on the shard thread.

mod db_slice;
mod eviction;
mod expire;
mod hooks;
mod intent_lock;
mod object;
mod shard;
mod stats;
mod table;
mod top_keys;

pub use db_slice::{
    AddOrFindResult, AutoUpdater, ChangeCallback, ChangeReq, Context, DbSlice, DbSliceBuilder,
    DeleteExpiredStats, DocDeletionCallback, ExpireFlags, ExpireParams, ItAndUpdater, SlotSet,
    TimeUnit,
};
pub use eviction::PrimeEvictionPolicy;
pub use expire::{ExpirePeriod, MAX_EXPIRE_DEADLINE_SEC};
pub use hooks::{
    ClusterView, GlobalState, InlinePool, InlineScheduler, Journal, JournalOp, NoCluster,
    RedisClusterView, Scheduler, ServerState, ThreadPool, TieredStorage, TrackedClient,
    WatchHandle, SLOT_COUNT,
};
pub use intent_lock::{IntentLock, KeyLockArgs, LockMode, LockTable};
pub use object::{Encoding, Key, ObjType, Payload, Value};
pub use shard::{HeartbeatStats, ShardContext};
pub use stats::{DbStats, DbTableStats, SliceEvents, SlotStats, Stats, OBJ_TYPE_MAX};
pub use table::{DbTable, DbTableRef, ExpireTable, McFlagTable, PrimeTable};
pub use top_keys::TopKeys;

pub use dash::{BucketRef, Cursor, EntryRef, Layout};

use thiserror::Error;

/// Index of one SELECT-able database within a shard.
pub type DbIndex = u16;

/// Cluster slot id.
pub type SlotId = u16;

/// Sentinel database index addressing every active database at once.
pub const DB_ALL: DbIndex = DbIndex::MAX;

/// Outcome of a keyspace operation that did not succeed. These surface to the
/// command layer as-is; none of them is an internal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpStatus {
    #[error("key not found")]
    KeyNotFound,
    #[error("wrong object type")]
    WrongType,
    #[error("out of memory")]
    OutOfMemory,
    #[error("precondition failed")]
    Skipped,
    #[error("value out of range")]
    OutOfRange,
    #[error("invalid argument")]
    InvalidArgument,
}

pub type OpResult<T> = Result<T, OpStatus>;
