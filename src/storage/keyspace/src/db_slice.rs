// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The shard's custodian. One `DbSlice` owns every database of a shard and
//! mediates all access: lookups with expiration-on-access and cache
//! promotion, inserts under a memory-aware eviction policy, scoped update
//! commits, deletes, flushes, intent locks, change callbacks, watches, and
//! client-tracking invalidation.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use config::{Heartbeat, Keyspace, Table};
use dash::{Cursor, EntryRef, Layout, UnboundedGrowth};
use log::{debug, error};
use rand::Rng;

use crate::eviction::{PrimeBumpPolicy, PrimeEvictionPolicy};
use crate::hooks::{hash_tag, WatchHandle};
use crate::intent_lock::{KeyLockArgs, LockMode, LockTable};
use crate::stats::account_slot_memory;
use crate::table::{DbTable, DbTableRef, ExpireTable, McFlagTable, PrimeTable, WatchedMap};
use crate::top_keys::TopKeys;
use crate::{
    ClusterView, DbIndex, DbStats, DbTableStats, ExpirePeriod, GlobalState, Journal, Key, ObjType,
    OpResult, OpStatus, Scheduler, ServerState, SliceEvents, SlotId, SlotStats, Stats, ThreadPool,
    TieredStorage, TrackedClient, Value, DB_ALL, MAX_EXPIRE_DEADLINE_SEC,
};

/// Per-operation context: which database, and the shard clock.
#[derive(Clone, Copy, Debug)]
pub struct Context {
    pub db_index: DbIndex,
    pub time_now_ms: u64,
}

impl Context {
    pub fn new(db_index: DbIndex, time_now_ms: u64) -> Self {
        Self {
            db_index,
            time_now_ms,
        }
    }
}

/// What a change callback observes, immediately before the mutation happens.
pub enum ChangeReq<'a> {
    /// The key is about to be inserted and is not yet in the table.
    NewKey(&'a [u8]),
    /// The entry is about to change or be removed.
    Entry {
        table: &'a PrimeTable,
        entry: EntryRef,
    },
    /// The bucket's entries are about to be relocated by a cache bump.
    Bucket {
        table: &'a PrimeTable,
        bucket: dash::BucketRef,
    },
}

/// Pre-mutation hook for snapshot and replication consumers. Callbacks must
/// not re-enter the slice.
pub type ChangeCallback = Box<dyn FnMut(DbIndex, &ChangeReq)>;

/// Invoked before complex types (hash, json) are deleted so secondary
/// indices can be updated.
pub type DocDeletionCallback = Box<dyn Fn(&[u8], &Context, &Value)>;

pub(crate) type KeySet = HashSet<Box<[u8]>, ahash::RandomState>;
pub(crate) type TrackingMap =
    HashMap<Box<[u8]>, Vec<Weak<dyn TrackedClient>>, ahash::RandomState>;

/// Slots addressed by `flush_slots`.
pub type SlotSet = HashSet<SlotId, ahash::RandomState>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeUnit {
    Sec,
    Msec,
}

/// Conditional-expire flags, mirroring the command surface (NX/XX/GT/LT).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpireFlags(u8);

impl ExpireFlags {
    pub const NONE: ExpireFlags = ExpireFlags(0);
    pub const NX: ExpireFlags = ExpireFlags(1);
    pub const XX: ExpireFlags = ExpireFlags(2);
    pub const GT: ExpireFlags = ExpireFlags(4);
    pub const LT: ExpireFlags = ExpireFlags(8);

    pub fn contains(&self, other: ExpireFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl core::ops::BitOr for ExpireFlags {
    type Output = ExpireFlags;

    fn bitor(self, rhs: ExpireFlags) -> ExpireFlags {
        ExpireFlags(self.0 | rhs.0)
    }
}

/// A deadline update request.
#[derive(Clone, Copy, Debug)]
pub struct ExpireParams {
    pub value: i64,
    pub unit: TimeUnit,
    pub absolute: bool,
    pub persist: bool,
    pub flags: ExpireFlags,
}

impl ExpireParams {
    /// Returns (relative msec, absolute msec) for `now_ms`.
    pub fn calculate(&self, now_ms: i64) -> (i64, i64) {
        if self.persist {
            return (0, 0);
        }
        let msec = match self.unit {
            TimeUnit::Sec => self.value * 1000,
            TimeUnit::Msec => self.value,
        };
        let rel_msec = if self.absolute { msec - now_ms } else { msec };
        (rel_msec, now_ms + rel_msec)
    }
}

/// Scoped post-update commit. Captured on a mutable find; must be consumed
/// with [`AutoUpdater::run`] after the mutation, or explicitly cancelled.
/// Dropping an armed updater is a bug in the caller and panics.
#[must_use = "run() commits the update accounting; cancel() discards it"]
#[derive(Debug)]
pub struct AutoUpdater {
    fields: Option<UpdaterFields>,
}

#[derive(Debug)]
struct UpdaterFields {
    db_ind: DbIndex,
    it: EntryRef,
    key: Box<[u8]>,
    orig_heap_size: usize,
    db_size: usize,
    deletion_count: u64,
}

impl AutoUpdater {
    fn new(fields: UpdaterFields) -> Self {
        Self {
            fields: Some(fields),
        }
    }

    /// Commit: validate that the entry survived untouched by structural
    /// changes, then account the value delta and fire watchers.
    pub fn run(mut self, slice: &mut DbSlice) {
        let fields = self.fields.take().expect("updater already consumed");
        slice.post_update(fields);
    }

    pub fn cancel(mut self) {
        self.fields = None;
    }
}

impl Drop for AutoUpdater {
    fn drop(&mut self) {
        if self.fields.is_some() && !std::thread::panicking() {
            panic!("post-update guard dropped without run() or cancel()");
        }
    }
}

/// Result of a mutable find.
pub struct ItAndUpdater {
    pub it: EntryRef,
    pub exp_it: Option<EntryRef>,
    pub post_updater: AutoUpdater,
}

/// Result of `add_or_find` and friends.
#[derive(Debug)]
pub struct AddOrFindResult {
    pub it: EntryRef,
    pub exp_it: Option<EntryRef>,
    pub is_new: bool,
    pub post_updater: AutoUpdater,
}

/// Outcome of one expired-key sweep step.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteExpiredStats {
    pub deleted: u32,
    pub traversed: u32,
    pub survivor_ttl_sum: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum UpdateStatsMode {
    Mutable,
    Read,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    Load,
    DontLoad,
}

// ---------------------------------------------------------------------------
// internal split-borrow plumbing
//
// The eviction policy and the deletion helpers run while the prime table is
// mutably borrowed (inside insert_new, or during a traversal). They receive
// the rest of the database table and the slice state they need as disjoint
// borrows instead of reaching back through `self`.
// ---------------------------------------------------------------------------

pub(crate) struct SliceParts<'a> {
    pub cntx: Context,
    pub events: &'a mut SliceEvents,
    pub change_cb: &'a mut Vec<(u64, ChangeCallback)>,
    pub version: &'a mut u64,
    pub deletion_count: &'a mut u64,
    pub memory_budget: &'a mut i64,
    pub bumped: &'a mut KeySet,
    pub tracking: &'a mut TrackingMap,
    pub expire_base: u64,
    pub expire_allowed: bool,
    pub is_replica: bool,
    pub journal: Option<&'a dyn Journal>,
    pub tiered: Option<&'a dyn TieredStorage>,
    pub cluster: &'a dyn ClusterView,
    pub pool: &'a dyn ThreadPool,
    pub doc_del_cb: Option<&'a DocDeletionCallback>,
}

impl SliceParts<'_> {
    pub(crate) fn next_version(&mut self) -> u64 {
        let v = *self.version;
        *self.version += 1;
        v
    }
}

pub(crate) struct TableSansPrime<'a> {
    pub expire: &'a mut ExpireTable,
    pub mcflag: &'a mut McFlagTable,
    pub stats: &'a mut DbTableStats,
    pub slots_stats: &'a mut Vec<SlotStats>,
    pub watched_keys: &'a mut WatchedMap,
    pub trans_locks: &'a LockTable,
    pub top_keys: &'a mut TopKeys,
    pub index: DbIndex,
}

pub(crate) fn split_table(dbt: &mut DbTable) -> (&mut PrimeTable, TableSansPrime<'_>) {
    let DbTable {
        prime,
        expire,
        mcflag,
        trans_locks,
        watched_keys,
        stats,
        slots_stats,
        top_keys,
        index,
        ..
    } = dbt;
    (
        prime,
        TableSansPrime {
            expire,
            mcflag,
            stats,
            slots_stats,
            watched_keys,
            trans_locks,
            top_keys,
            index: *index,
        },
    )
}

/// Key used for lock-table rows: the hash tag when cluster mode is on, so
/// multi-key operations on one slot contend on one lock.
pub(crate) fn lock_key<'k>(cluster: &dyn ClusterView, key: &'k [u8]) -> &'k [u8] {
    if cluster.is_enabled() {
        hash_tag(key)
    } else {
        key
    }
}

pub(crate) fn notify_entry(
    change_cb: &mut [(u64, ChangeCallback)],
    db_ind: DbIndex,
    table: &PrimeTable,
    entry: EntryRef,
) {
    for (_, cb) in change_cb.iter_mut() {
        cb(db_ind, &ChangeReq::Entry { table, entry });
    }
}

pub(crate) fn account_object_memory(
    stats: &mut DbTableStats,
    slots_stats: &mut [SlotStats],
    cluster: &dyn ClusterView,
    key: &[u8],
    obj_type: ObjType,
    delta: i64,
) {
    stats.add_type_memory_usage(obj_type, delta);
    if cluster.is_enabled() {
        account_slot_memory(slots_stats, cluster.key_slot(key), delta);
    }
}

fn mark_watched_dirty(watched: &mut WatchedMap, key: &[u8]) {
    if let Some(handles) = watched.remove(key) {
        for handle in handles {
            handle.mark_dirty();
        }
    }
}

fn send_invalidation(tracking: &mut TrackingMap, pool: &dyn ThreadPool, key: &[u8]) {
    if let Some(clients) = tracking.remove(key) {
        let key: Box<[u8]> = key.into();
        pool.dispatch_brief(Box::new(move |thread| {
            for weak in &clients {
                let Some(conn) = weak.upgrade() else { continue };
                if conn.thread() == thread && conn.is_tracking_on() {
                    conn.send_invalidation(&key);
                }
            }
        }));
    }
}

/// Remove one entry and every row bound to it. Fires change callbacks with
/// the pre-image, keeps the expire/mcflag/tiered/stats/slot bookkeeping
/// consistent, and dispatches watcher and tracking invalidation.
pub(crate) fn perform_deletion(
    parts: &mut SliceParts<'_>,
    prime: &mut PrimeTable,
    rest: &mut TableSansPrime<'_>,
    del_it: EntryRef,
) {
    notify_entry(parts.change_cb, rest.index, prime, del_it);

    let key_bytes: Box<[u8]> = prime.key_at(del_it).as_bytes().into();

    {
        let value = prime.value_at(del_it);
        if value.has_expire() && rest.expire.erase_key(&key_bytes) == 0 {
            error!("expire row should be present but was not found");
        }
        if value.has_flag() && rest.mcflag.erase_key(&key_bytes) == 0 {
            error!("mcflag row should be present but was not found");
        }
        if let Some(handle) = value.external_handle() {
            if let Some(tiered) = parts.tiered {
                tiered.free(rest.index, &key_bytes, handle);
            }
            rest.stats.tiered_entries = rest.stats.tiered_entries.saturating_sub(1);
            rest.stats.tiered_size = rest.stats.tiered_size.saturating_sub(handle.1 as u64);
        } else if let Some(request) = value.io_request() {
            if let Some(tiered) = parts.tiered {
                tiered.cancel_io(rest.index, request);
            }
        }
    }

    let (key, value) = prime.erase(del_it);
    rest.stats.inline_keys -= key.is_inline() as u64;
    account_object_memory(
        rest.stats,
        rest.slots_stats,
        parts.cluster,
        &key_bytes,
        ObjType::String,
        -(key.mem_used() as i64),
    );
    account_object_memory(
        rest.stats,
        rest.slots_stats,
        parts.cluster,
        &key_bytes,
        value.obj_type(),
        -(value.mem_used() as i64),
    );
    if matches!(value.obj_type(), ObjType::Hash | ObjType::ZSet)
        && value.encoding() == crate::Encoding::ListPack
    {
        rest.stats.listpack_blob_cnt = rest.stats.listpack_blob_cnt.saturating_sub(1);
    }
    if parts.cluster.is_enabled() {
        let sid = parts.cluster.key_slot(&key_bytes);
        if let Some(slot) = rest.slots_stats.get_mut(sid as usize) {
            slot.key_count -= 1;
        }
    }

    mark_watched_dirty(rest.watched_keys, &key_bytes);
    send_invalidation(parts.tracking, parts.pool, &key_bytes);
}

/// Advance the persistent expire cursor by `steps` buckets, deleting due
/// entries and accumulating sweep statistics.
fn sweep_expired(
    parts: &mut SliceParts<'_>,
    dbt: &mut DbTable,
    steps: u32,
    result: &mut DeleteExpiredStats,
) {
    let DbTable {
        prime,
        expire,
        mcflag,
        trans_locks,
        watched_keys,
        stats,
        slots_stats,
        expire_cursor,
        top_keys,
        index,
    } = dbt;

    let mut cb = |expire_tbl: &mut ExpireTable, exp_ref: EntryRef| {
        let key: Box<[u8]> = expire_tbl.key_at(exp_ref).as_bytes().into();
        // entries under an incompatible lock are left for a later pass
        let lk = lock_key(parts.cluster, &key);
        if let Some(lock) = trans_locks.get(lk) {
            if !lock.check(LockMode::Exclusive) {
                return;
            }
        }
        result.traversed += 1;
        let deadline = expire_tbl.value_at(exp_ref).expire_time(parts.expire_base);
        let ttl = deadline as i64 - parts.cntx.time_now_ms as i64;
        if ttl <= 0 {
            let prime_it = prime.find(&key).expect("expire row without a prime entry");
            let mut rest = TableSansPrime {
                expire: expire_tbl,
                mcflag: &mut *mcflag,
                stats: &mut *stats,
                slots_stats: &mut *slots_stats,
                watched_keys: &mut *watched_keys,
                trans_locks: &*trans_locks,
                top_keys: &mut *top_keys,
                index: *index,
            };
            if expire_if_needed(parts, prime, &mut rest, prime_it) {
                result.deleted += 1;
            }
        } else {
            result.survivor_ttl_sum += ttl as u64;
        }
    };

    for _ in 0..steps {
        *expire_cursor = expire.traverse(*expire_cursor, &mut cb).unwrap_or_default();
    }
}

/// Delete `it` if its deadline has passed. Never deletes on replicas or when
/// expiration is disabled. Returns whether the entry was removed.
pub(crate) fn expire_if_needed(
    parts: &mut SliceParts<'_>,
    prime: &mut PrimeTable,
    rest: &mut TableSansPrime<'_>,
    it: EntryRef,
) -> bool {
    debug_assert!(prime.value_at(it).has_expire());
    let key_bytes: Box<[u8]> = prime.key_at(it).as_bytes().into();

    let exp_it = rest
        .expire
        .find(&key_bytes)
        .expect("entry has the expire bit but no expire row");
    let expire_time = rest.expire.value_at(exp_it).expire_time(parts.expire_base);

    if parts.cntx.time_now_ms < expire_time || parts.is_replica || !parts.expire_allowed {
        return false;
    }

    if let Some(journal) = parts.journal {
        let slot = parts
            .cluster
            .is_enabled()
            .then(|| parts.cluster.key_slot(&key_bytes));
        journal.record_expired(rest.index, slot, &key_bytes);
    }

    {
        let value = prime.value_at(it);
        if matches!(value.obj_type(), ObjType::Hash | ObjType::Json) {
            if let Some(cb) = parts.doc_del_cb {
                cb(&key_bytes, &parts.cntx, value);
            }
        }
    }

    perform_deletion(parts, prime, rest, it);
    parts.events.expired_keys += 1;
    true
}

// ---------------------------------------------------------------------------
// DbSlice
// ---------------------------------------------------------------------------

/// Builder for a [`DbSlice`]; collaborators default to no-ops so a slice can
/// run standalone.
pub struct DbSliceBuilder {
    shard_id: u32,
    caching_mode: bool,
    prime_layout: Layout,
    expire_layout: Layout,
    memory_budget: i64,
    soft_budget_limit: Option<i64>,
    heartbeat: Heartbeat,
    journal: Option<Rc<dyn Journal>>,
    tiered: Option<Rc<dyn TieredStorage>>,
    cluster: Rc<dyn ClusterView>,
    scheduler: Rc<dyn Scheduler>,
    pool: Rc<dyn ThreadPool>,
    server_state: Rc<ServerState>,
}

impl DbSliceBuilder {
    pub fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            caching_mode: false,
            prime_layout: Layout::DEFAULT,
            expire_layout: Layout::new(56, 4, 10),
            memory_budget: i64::MAX,
            soft_budget_limit: None,
            heartbeat: Heartbeat::default(),
            journal: None,
            tiered: None,
            cluster: Rc::new(crate::NoCluster),
            scheduler: Rc::new(crate::InlineScheduler),
            pool: Rc::new(crate::InlinePool),
            server_state: Rc::new(ServerState::default()),
        }
    }

    pub fn caching_mode(mut self, on: bool) -> Self {
        self.caching_mode = on;
        self
    }

    pub fn memory_budget(mut self, bytes: i64) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn soft_budget_limit(mut self, bytes: i64) -> Self {
        self.soft_budget_limit = Some(bytes);
        self
    }

    pub fn prime_layout(mut self, layout: Layout) -> Self {
        self.prime_layout = layout;
        self
    }

    pub fn expire_layout(mut self, layout: Layout) -> Self {
        self.expire_layout = layout;
        self
    }

    /// Apply the sizing knobs of a [`Table`] config block.
    pub fn table_config(mut self, cfg: &Table) -> Self {
        self.prime_layout = Layout::new(cfg.regular_buckets(), cfg.stash_buckets(), cfg.slots());
        self.expire_layout = Layout::new(
            cfg.expire_regular_buckets(),
            cfg.expire_stash_buckets(),
            cfg.expire_slots(),
        );
        self
    }

    /// Apply the mode and budget knobs of a [`Keyspace`] config block.
    pub fn keyspace_config(mut self, cfg: &Keyspace) -> Self {
        self.caching_mode = cfg.cache_mode();
        self.memory_budget = cfg.memory_budget().min(i64::MAX as usize) as i64;
        self.soft_budget_limit = Some(
            (cfg.memory_budget().min(i64::MAX as usize) as f64 * cfg.soft_memory_ratio()) as i64,
        );
        self
    }

    pub fn heartbeat(mut self, cfg: Heartbeat) -> Self {
        self.heartbeat = cfg;
        self
    }

    pub fn journal(mut self, journal: Rc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn tiered(mut self, tiered: Rc<dyn TieredStorage>) -> Self {
        self.tiered = Some(tiered);
        self
    }

    pub fn cluster(mut self, cluster: Rc<dyn ClusterView>) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn scheduler(mut self, scheduler: Rc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn pool(mut self, pool: Rc<dyn ThreadPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn server_state(mut self, state: Rc<ServerState>) -> Self {
        self.server_state = state;
        self
    }

    pub fn build(self) -> DbSlice {
        let soft = self
            .soft_budget_limit
            .unwrap_or((self.memory_budget as f64 * 0.3) as i64);
        let mut slice = DbSlice {
            shard_id: self.shard_id,
            caching_mode: self.caching_mode,
            expire_allowed: true,
            prime_layout: self.prime_layout,
            expire_layout: self.expire_layout,
            db_arr: Vec::new(),
            expire_base: [0, 0],
            version: 1,
            memory_budget: self.memory_budget,
            soft_budget_limit: soft,
            deletion_count: 0,
            events: SliceEvents::default(),
            bumped_items: KeySet::default(),
            change_cb: Vec::new(),
            doc_del_cb: None,
            client_tracking_map: TrackingMap::default(),
            uniq_keys: KeySet::default(),
            retired_tables: Vec::new(),
            heartbeat: self.heartbeat,
            journal: self.journal,
            tiered: self.tiered,
            cluster: self.cluster,
            scheduler: self.scheduler,
            pool: self.pool,
            server_state: self.server_state,
        };
        slice.activate_db(0);
        slice
    }
}

pub struct DbSlice {
    shard_id: u32,
    caching_mode: bool,
    expire_allowed: bool,
    prime_layout: Layout,
    expire_layout: Layout,
    db_arr: Vec<Option<DbTableRef>>,
    expire_base: [u64; 2],
    version: u64,
    memory_budget: i64,
    soft_budget_limit: i64,
    deletion_count: u64,
    events: SliceEvents,
    bumped_items: KeySet,
    change_cb: Vec<(u64, ChangeCallback)>,
    doc_del_cb: Option<DocDeletionCallback>,
    client_tracking_map: TrackingMap,
    uniq_keys: KeySet,
    retired_tables: Vec<DbTableRef>,
    heartbeat: Heartbeat,
    journal: Option<Rc<dyn Journal>>,
    tiered: Option<Rc<dyn TieredStorage>>,
    cluster: Rc<dyn ClusterView>,
    scheduler: Rc<dyn Scheduler>,
    pool: Rc<dyn ThreadPool>,
    server_state: Rc<ServerState>,
}

impl DbSlice {
    pub fn builder(shard_id: u32) -> DbSliceBuilder {
        DbSliceBuilder::new(shard_id)
    }

    // ----- accessors -----

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn caching_mode(&self) -> bool {
        self.caching_mode
    }

    pub fn events(&self) -> &SliceEvents {
        &self.events
    }

    pub fn memory_budget(&self) -> i64 {
        self.memory_budget
    }

    pub fn expire_base(&self, generation: usize) -> u64 {
        self.expire_base[generation]
    }

    pub fn set_expire_allowed(&mut self, allowed: bool) {
        self.expire_allowed = allowed;
    }

    pub fn db_array_size(&self) -> usize {
        self.db_arr.len()
    }

    pub fn is_db_valid(&self, db_ind: DbIndex) -> bool {
        (db_ind as usize) < self.db_arr.len() && self.db_arr[db_ind as usize].is_some()
    }

    pub fn get_db_table(&self, db_ind: DbIndex) -> Option<DbTableRef> {
        self.db_arr.get(db_ind as usize).and_then(|db| db.clone())
    }

    pub fn db_size(&self, db_ind: DbIndex) -> usize {
        self.get_db_table(db_ind)
            .map(|db| db.borrow().prime.len())
            .unwrap_or(0)
    }

    pub fn set_doc_deletion_callback(&mut self, cb: Option<DocDeletionCallback>) {
        self.doc_del_cb = cb;
    }

    pub fn reset_events(&mut self) {
        self.events = SliceEvents::default();
    }

    pub fn reset_update_events(&mut self) {
        self.events.update = 0;
    }

    /// Bytes used by this slice: object memory plus table structures.
    pub fn used_memory(&self) -> usize {
        self.db_arr
            .iter()
            .flatten()
            .map(|db| {
                let db = db.borrow();
                db.stats.obj_memory_usage as usize + db.table_mem_usage()
            })
            .sum()
    }

    /// Average object heap footprint, used by growth decisions.
    pub fn bytes_per_object(&self) -> i64 {
        let (mem, count) = self
            .db_arr
            .iter()
            .flatten()
            .map(|db| {
                let db = db.borrow();
                (db.stats.obj_memory_usage, db.prime.len() as u64)
            })
            .fold((0u64, 0u64), |acc, x| (acc.0 + x.0, acc.1 + x.1));
        if count == 0 {
            0
        } else {
            (mem / count) as i64
        }
    }

    pub fn get_stats(&self) -> Stats {
        let mut stats = Stats {
            events: self.events,
            db_stats: vec![DbStats::default(); self.db_arr.len()],
        };
        for (i, db) in self.db_arr.iter().enumerate() {
            let Some(db) = db else { continue };
            let db = db.borrow();
            let entry = &mut stats.db_stats[i];
            entry.table = db.stats.clone();
            entry.key_count = db.prime.len() as u64;
            entry.bucket_count = db.prime.bucket_count() as u64;
            entry.expire_count = db.expire.len() as u64;
            entry.table_mem_usage = db.table_mem_usage() as u64;
        }
        stats
    }

    pub fn get_slot_stats(&self, sid: SlotId) -> SlotStats {
        let db = self.get_db_table(0).expect("database 0 always exists");
        let db = db.borrow();
        db.slots_stats
            .get(sid as usize)
            .copied()
            .unwrap_or_default()
    }

    // ----- database lifecycle -----

    /// Materialize a database index on demand.
    pub fn activate_db(&mut self, db_ind: DbIndex) {
        if self.db_arr.len() <= db_ind as usize {
            self.db_arr.resize(db_ind as usize + 1, None);
        }
        if self.db_arr[db_ind as usize].is_none() {
            self.db_arr[db_ind as usize] = Some(Rc::new(RefCell::new(DbTable::new(
                self.prime_layout,
                self.expire_layout,
                db_ind,
                self.cluster.is_enabled(),
            ))));
        }
    }

    /// Pre-size a database ahead of a bulk load.
    pub fn reserve(&mut self, db_ind: DbIndex, key_count: usize) {
        self.activate_db(db_ind);
        let db = self.get_db_table(db_ind).expect("just activated");
        db.borrow_mut().prime.reserve(key_count);
    }

    fn next_version(&mut self) -> u64 {
        let v = self.version;
        self.version += 1;
        v
    }

    fn parts(&mut self, cntx: Context) -> SliceParts<'_> {
        SliceParts {
            cntx,
            events: &mut self.events,
            change_cb: &mut self.change_cb,
            version: &mut self.version,
            deletion_count: &mut self.deletion_count,
            memory_budget: &mut self.memory_budget,
            bumped: &mut self.bumped_items,
            tracking: &mut self.client_tracking_map,
            expire_base: self.expire_base[0],
            expire_allowed: self.expire_allowed,
            is_replica: self.server_state.is_replica(),
            journal: self.journal.as_deref(),
            tiered: self.tiered.as_deref(),
            cluster: &*self.cluster,
            pool: &*self.pool,
            doc_del_cb: self.doc_del_cb.as_ref(),
        }
    }

    // ----- lookup -----

    pub fn find_read_only(
        &mut self,
        cntx: Context,
        key: &[u8],
        req_type: Option<ObjType>,
    ) -> OpResult<EntryRef> {
        self.find_internal(cntx, key, req_type, UpdateStatsMode::Read, LoadMode::DontLoad)
            .map(|(it, _)| it)
    }

    /// Read-only find that pages an offloaded value back in. May suspend.
    pub fn find_and_fetch_read_only(
        &mut self,
        cntx: Context,
        key: &[u8],
        req_type: Option<ObjType>,
    ) -> OpResult<EntryRef> {
        self.find_internal(cntx, key, req_type, UpdateStatsMode::Read, LoadMode::Load)
            .map(|(it, _)| it)
    }

    pub fn find_mutable(
        &mut self,
        cntx: Context,
        key: &[u8],
        req_type: Option<ObjType>,
    ) -> OpResult<ItAndUpdater> {
        let (it, exp_it) = self.find_internal(
            cntx,
            key,
            req_type,
            UpdateStatsMode::Mutable,
            LoadMode::DontLoad,
        )?;
        let post_updater = self.pre_update_and_guard(cntx, it, key);
        Ok(ItAndUpdater {
            it,
            exp_it,
            post_updater,
        })
    }

    /// Mutable find that pages an offloaded value back in. May suspend.
    pub fn find_and_fetch_mutable(
        &mut self,
        cntx: Context,
        key: &[u8],
        req_type: Option<ObjType>,
    ) -> OpResult<ItAndUpdater> {
        let (it, exp_it) = self.find_internal(
            cntx,
            key,
            req_type,
            UpdateStatsMode::Mutable,
            LoadMode::Load,
        )?;
        let post_updater = self.pre_update_and_guard(cntx, it, key);
        Ok(ItAndUpdater {
            it,
            exp_it,
            post_updater,
        })
    }

    /// First present key of `keys`; returns the entry and the argument index.
    pub fn find_first_read_only(
        &mut self,
        cntx: Context,
        keys: &[&[u8]],
        req_type: Option<ObjType>,
    ) -> OpResult<(EntryRef, usize)> {
        debug_assert!(!keys.is_empty());
        for (i, key) in keys.iter().enumerate() {
            match self.find_read_only(cntx, key, req_type) {
                Ok(it) => return Ok((it, i)),
                Err(OpStatus::KeyNotFound) => continue,
                Err(status) => return Err(status),
            }
        }
        Err(OpStatus::KeyNotFound)
    }

    fn find_internal(
        &mut self,
        cntx: Context,
        key: &[u8],
        req_type: Option<ObjType>,
        stats_mode: UpdateStatsMode,
        load_mode: LoadMode,
    ) -> OpResult<(EntryRef, Option<EntryRef>)> {
        let caching = self.caching_mode;
        let Some(db) = self.get_db_table(cntx.db_index) else {
            self.count_miss(stats_mode);
            return Err(OpStatus::KeyNotFound);
        };
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;
        let mut parts = self.parts(cntx);
        let (prime, mut rest) = split_table(dbt);

        let miss = |parts: &mut SliceParts| match stats_mode {
            UpdateStatsMode::Mutable => parts.events.mutations += 1,
            UpdateStatsMode::Read => parts.events.misses += 1,
        };

        let Some(mut it) = prime.find(key) else {
            miss(&mut parts);
            return Err(OpStatus::KeyNotFound);
        };

        if let Some(req) = req_type {
            if prime.value_at(it).obj_type() != req {
                miss(&mut parts);
                return Err(OpStatus::WrongType);
            }
        }

        if let Some(tiered) = parts.tiered {
            if load_mode == LoadMode::Load {
                if let Some(request) = prime.value_at(it).io_request() {
                    tiered.cancel_io(rest.index, request);
                } else if let Some(handle) = prime.value_at(it).external_handle() {
                    // the load reads from disk and may suspend; the position
                    // is re-resolved afterwards
                    let loaded = tiered.load(rest.index, key);
                    let Some(bytes) = loaded else {
                        miss(&mut parts);
                        return Err(OpStatus::KeyNotFound);
                    };
                    let Some(reloaded) = prime.find(key) else {
                        miss(&mut parts);
                        return Err(OpStatus::KeyNotFound);
                    };
                    it = reloaded;
                    let obj_type = {
                        let value = prime.value_at_mut(it);
                        value.set_resident(&bytes);
                        value.obj_type()
                    };
                    rest.stats.tiered_entries = rest.stats.tiered_entries.saturating_sub(1);
                    rest.stats.tiered_size =
                        rest.stats.tiered_size.saturating_sub(handle.1 as u64);
                    account_object_memory(
                        rest.stats,
                        rest.slots_stats,
                        parts.cluster,
                        key,
                        obj_type,
                        bytes.len() as i64,
                    );
                }
            }
        }

        if prime.value_at(it).has_expire() {
            if expire_if_needed(&mut parts, prime, &mut rest, it) {
                miss(&mut parts);
                return Err(OpStatus::KeyNotFound);
            }
        }

        if caching && !parts.bumped.contains(key) {
            if let Some(watermark) = parts.change_cb.last().map(|(v, _)| *v) {
                let mut touched = Vec::new();
                prime.cvc_upon_bump(watermark, it, |bucket| touched.push(bucket));
                for bucket in touched {
                    for (_, cb) in parts.change_cb.iter_mut() {
                        cb(
                            rest.index,
                            &ChangeReq::Bucket {
                                table: prime,
                                bucket,
                            },
                        );
                    }
                }
            }
            let policy = PrimeBumpPolicy::new(&*parts.bumped);
            it = prime.bump_up(it, &policy);
            parts.events.bumpups += 1;
            parts.bumped.insert(key.into());
        }

        rest.top_keys.touch(key);

        match stats_mode {
            UpdateStatsMode::Mutable => parts.events.mutations += 1,
            UpdateStatsMode::Read => {
                parts.events.hits += 1;
                if parts.cluster.is_enabled() {
                    let sid = parts.cluster.key_slot(key);
                    if let Some(slot) = rest.slots_stats.get_mut(sid as usize) {
                        slot.total_reads += 1;
                    }
                }
            }
        }

        let exp_it = if prime.value_at(it).has_expire() {
            rest.expire.find(key)
        } else {
            None
        };
        Ok((it, exp_it))
    }

    fn count_miss(&mut self, stats_mode: UpdateStatsMode) {
        match stats_mode {
            UpdateStatsMode::Mutable => self.events.mutations += 1,
            UpdateStatsMode::Read => self.events.misses += 1,
        }
    }

    // ----- pre/post update -----

    fn pre_update_and_guard(&mut self, cntx: Context, it: EntryRef, key: &[u8]) -> AutoUpdater {
        let db = self.get_db_table(cntx.db_index).expect("database is active");
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;

        notify_entry(&mut self.change_cb, cntx.db_index, &dbt.prime, it);
        let version = self.next_version();
        dbt.prime.set_version(it, version);

        AutoUpdater::new(UpdaterFields {
            db_ind: cntx.db_index,
            it,
            key: key.into(),
            orig_heap_size: dbt.prime.value_at(it).mem_used(),
            db_size: dbt.prime.len(),
            deletion_count: self.deletion_count,
        })
    }

    fn post_update(&mut self, fields: UpdaterFields) {
        let db = self
            .get_db_table(fields.db_ind)
            .expect("database vanished under a post-update guard");
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;

        // structural changes between the pre-update hook and this commit are
        // bugs in the caller
        assert!(
            dbt.prime.find(&fields.key).is_some(),
            "key was removed before the post-update commit"
        );
        assert_eq!(
            fields.db_size,
            dbt.prime.len(),
            "table size changed before the post-update commit"
        );
        assert_eq!(
            fields.deletion_count, self.deletion_count,
            "a deletion was issued before the post-update commit"
        );

        let (obj_type, delta) = {
            let value = dbt.prime.value_at(fields.it);
            (
                value.obj_type(),
                value.mem_used() as i64 - fields.orig_heap_size as i64,
            )
        };
        account_object_memory(
            &mut dbt.stats,
            &mut dbt.slots_stats,
            &*self.cluster,
            &fields.key,
            obj_type,
            delta,
        );
        mark_watched_dirty(&mut dbt.watched_keys, &fields.key);
        self.events.update += 1;
        if self.cluster.is_enabled() {
            let sid = self.cluster.key_slot(&fields.key);
            if let Some(slot) = dbt.slots_stats.get_mut(sid as usize) {
                slot.total_writes += 1;
            }
        }
        send_invalidation(&mut self.client_tracking_map, &*self.pool, &fields.key);
    }

    // ----- insert -----

    pub fn add_or_find(&mut self, cntx: Context, key: &[u8]) -> OpResult<AddOrFindResult> {
        match self.find_internal(
            cntx,
            key,
            None,
            UpdateStatsMode::Mutable,
            LoadMode::DontLoad,
        ) {
            Ok((it, exp_it)) => {
                let post_updater = self.pre_update_and_guard(cntx, it, key);
                Ok(AddOrFindResult {
                    it,
                    exp_it,
                    is_new: false,
                    post_updater,
                })
            }
            Err(OpStatus::KeyNotFound) => self.add_new_entry(cntx, key),
            Err(status) => Err(status),
        }
    }

    fn add_new_entry(&mut self, cntx: Context, key: &[u8]) -> OpResult<AddOrFindResult> {
        let caching = self.caching_mode;
        let is_replica = self.server_state.is_replica();
        let loading = self.server_state.gstate() == GlobalState::Loading;
        // When loading a snapshot or applying replication, the directory tree
        // is rebuilt in a different shape than the writer had; conservative
        // growth checks would reject entries that fit on the origin. Only the
        // hard limit applies there.
        let apply_memory_limit = !is_replica && !loading;
        let mem_budget = self.memory_budget - key.len() as i64;
        let soft_limit = self.soft_budget_limit;
        let bytes_per_object = self.bytes_per_object();

        let db = self.get_db_table(cntx.db_index).expect("database is active");
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;

        for (_, cb) in self.change_cb.iter_mut() {
            cb(cntx.db_index, &ChangeReq::NewKey(key));
        }

        if apply_memory_limit && !caching && mem_budget < 0 {
            debug!("insert rejected: budget {}", mem_budget);
            self.events.insertion_rejections += 1;
            return Err(OpStatus::OutOfMemory);
        }

        let mut parts = self.parts(cntx);
        let (prime, mut rest) = split_table(dbt);

        let mut policy = PrimeEvictionPolicy::new(
            &mut parts,
            &mut rest,
            mem_budget,
            soft_limit,
            bytes_per_object,
            caching && !is_replica,
            apply_memory_limit,
        );
        let inserted = prime.insert_new(Key::new(key), Value::default(), &mut policy);
        let evicted = policy.evicted();
        let checked = policy.checked();
        let final_budget = policy.mem_budget();
        drop(policy);

        let it = match inserted {
            Ok(it) => it,
            Err(_) => {
                debug!("insert rejected by the table, budget {}", final_budget);
                parts.events.insertion_rejections += 1;
                return Err(OpStatus::OutOfMemory);
            }
        };

        rest.stats.inline_keys += prime.key_at(it).is_inline() as u64;
        let key_mem = prime.key_at(it).mem_used() as i64;
        account_object_memory(
            rest.stats,
            rest.slots_stats,
            parts.cluster,
            key,
            ObjType::String,
            key_mem,
        );
        debug_assert_eq!(prime.value_at(it).mem_used(), 0);

        let version = parts.next_version();
        prime.set_version(it, version);

        parts.events.garbage_collected = prime.garbage_collected();
        parts.events.stash_unloaded = prime.stash_unloaded();
        parts.events.evicted_keys += evicted as u64;
        parts.events.garbage_checked += checked as u64;

        if parts.cluster.is_enabled() {
            let sid = parts.cluster.key_slot(key);
            if let Some(slot) = rest.slots_stats.get_mut(sid as usize) {
                slot.key_count += 1;
            }
        }

        #[cfg(feature = "hard-eviction")]
        let evicted_obj_bytes = if final_budget < 0 {
            crate::eviction::evict_objects(
                &mut parts,
                prime,
                &mut rest,
                (-final_budget) as usize,
                it,
            )
        } else {
            0
        };
        #[cfg(not(feature = "hard-eviction"))]
        let evicted_obj_bytes = 0usize;

        *parts.memory_budget = final_budget + evicted_obj_bytes as i64;

        let post_updater = AutoUpdater::new(UpdaterFields {
            db_ind: cntx.db_index,
            it,
            key: key.into(),
            orig_heap_size: 0,
            db_size: prime.len(),
            deletion_count: *parts.deletion_count,
        });
        Ok(AddOrFindResult {
            it,
            exp_it: None,
            is_new: true,
            post_updater,
        })
    }

    /// Insert or overwrite, installing the deadline. The returned updater
    /// must be run (or cancelled) by the caller.
    pub fn add_or_update(
        &mut self,
        cntx: Context,
        key: &[u8],
        obj: Value,
        expire_at_ms: u64,
    ) -> OpResult<AddOrFindResult> {
        self.add_or_update_internal(cntx, key, obj, expire_at_ms, true)
    }

    /// Insert that must not find an existing entry.
    pub fn add_new(
        &mut self,
        cntx: Context,
        key: &[u8],
        obj: Value,
        expire_at_ms: u64,
    ) -> OpResult<ItAndUpdater> {
        let res = self.add_or_update_internal(cntx, key, obj, expire_at_ms, false)?;
        assert!(res.is_new, "add_new on a key that already exists");
        Ok(ItAndUpdater {
            it: res.it,
            exp_it: res.exp_it,
            post_updater: res.post_updater,
        })
    }

    fn add_or_update_internal(
        &mut self,
        cntx: Context,
        key: &[u8],
        obj: Value,
        expire_at_ms: u64,
        force_update: bool,
    ) -> OpResult<AddOrFindResult> {
        let mut res = self.add_or_find(cntx, key)?;
        if !res.is_new && !force_update {
            return Ok(res);
        }

        let db = self.get_db_table(cntx.db_index).expect("database is active");
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;

        let had_expire = dbt.prime.value_at(res.it).has_expire();
        let had_flag = dbt.prime.value_at(res.it).has_flag();

        let mut obj = obj;
        // the aux row outlives value overwrites
        obj.set_flag(had_flag);
        *dbt.prime.value_at_mut(res.it) = obj;

        if expire_at_ms != 0 {
            dbt.prime.value_at_mut(res.it).set_expire(true);
            let period = ExpirePeriod::from_absolute_time(self.expire_base[0], expire_at_ms);
            let (exp_it, _) = dbt
                .expire
                .insert(Key::new(key), period, &mut UnboundedGrowth)
                .map_err(|_| OpStatus::OutOfMemory)?;
            res.exp_it = Some(exp_it);
        } else if had_expire {
            // the overwrite dropped the deadline; both sides stay consistent
            dbt.expire.erase_key(key);
            res.exp_it = None;
        }
        Ok(res)
    }

    /// Flip an entry's sticky bit, shielding it from every eviction path.
    pub fn set_sticky(&mut self, db_ind: DbIndex, it: EntryRef, sticky: bool) {
        let db = self.get_db_table(db_ind).expect("database is active");
        db.borrow_mut().prime.key_at_mut(it).set_sticky(sticky);
    }

    // ----- delete -----

    pub fn del(&mut self, cntx: Context, it: EntryRef) -> bool {
        let Some(db) = self.get_db_table(cntx.db_index) else {
            return false;
        };
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;

        {
            let value = dbt.prime.value_at(it);
            if matches!(value.obj_type(), ObjType::Hash | ObjType::Json) {
                if let Some(cb) = self.doc_del_cb.as_ref() {
                    let key = dbt.prime.key_at(it).as_bytes();
                    cb(key, &cntx, value);
                }
            }
        }
        let key_bytes: Box<[u8]> = dbt.prime.key_at(it).as_bytes().into();
        self.bumped_items.remove(&key_bytes[..]);

        let mut parts = self.parts(cntx);
        let (prime, mut rest) = split_table(dbt);
        perform_deletion(&mut parts, prime, &mut rest, it);
        *parts.deletion_count += 1;
        true
    }

    // ----- expiration -----

    pub fn add_expire(&mut self, db_ind: DbIndex, it: EntryRef, at_ms: u64) {
        let db = self.get_db_table(db_ind).expect("database is active");
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;
        let key = Key::new(dbt.prime.key_at(it).as_bytes());
        let period = ExpirePeriod::from_absolute_time(self.expire_base[0], at_ms);
        let (_, inserted) = dbt
            .expire
            .insert(key, period, &mut UnboundedGrowth)
            .expect("expire table insert cannot fail without a memory cap");
        assert!(inserted, "add_expire on an entry that already has a row");
        dbt.prime.value_at_mut(it).set_expire(true);
    }

    pub fn remove_expire(&mut self, db_ind: DbIndex, it: EntryRef) -> bool {
        let db = self.get_db_table(db_ind).expect("database is active");
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;
        if !dbt.prime.value_at(it).has_expire() {
            return false;
        }
        let erased = {
            let key = dbt.prime.key_at(it).as_bytes().to_vec();
            dbt.expire.erase_key(&key)
        };
        assert_eq!(1, erased, "expire bit set but no expire row");
        dbt.prime.value_at_mut(it).set_expire(false);
        true
    }

    /// Install or clear a deadline; returns whether state changed.
    pub fn update_expire_state(&mut self, db_ind: DbIndex, it: EntryRef, at_ms: u64) -> bool {
        if at_ms == 0 {
            return self.remove_expire(db_ind, it);
        }
        let has = {
            let db = self.get_db_table(db_ind).expect("database is active");
            let has = db.borrow().prime.value_at(it).has_expire();
            has
        };
        if !has {
            self.add_expire(db_ind, it, at_ms);
            return true;
        }
        false
    }

    /// Full conditional deadline update (NX/XX/GT/LT, persist, relative or
    /// absolute). Returns the new absolute deadline in ms, 0 for persist, or
    /// −1 when the non-positive deadline deleted the key.
    pub fn update_expire(
        &mut self,
        cntx: Context,
        it: EntryRef,
        exp_it: Option<EntryRef>,
        params: &ExpireParams,
    ) -> OpResult<i64> {
        if params.persist {
            self.remove_expire(cntx.db_index, it);
            return Ok(0);
        }

        let (rel_msec, abs_msec) = params.calculate(cntx.time_now_ms as i64);
        if rel_msec > MAX_EXPIRE_DEADLINE_SEC as i64 * 1000 {
            return Err(OpStatus::OutOfRange);
        }

        if rel_msec <= 0 {
            // an already-passed deadline deletes immediately
            let deleted = self.del(cntx, it);
            assert!(deleted);
            return Ok(-1);
        }

        if let Some(exp_it) = exp_it {
            if params.flags.contains(ExpireFlags::NX) {
                return Err(OpStatus::Skipped);
            }
            let db = self.get_db_table(cntx.db_index).expect("database is active");
            let current = db
                .borrow()
                .expire
                .value_at(exp_it)
                .expire_time(self.expire_base[0]) as i64;
            if params.flags.contains(ExpireFlags::LT) && current <= abs_msec {
                return Err(OpStatus::Skipped);
            }
            if params.flags.contains(ExpireFlags::GT) && current >= abs_msec {
                return Err(OpStatus::Skipped);
            }
            *db.borrow_mut().expire.value_at_mut(exp_it) =
                ExpirePeriod::from_absolute_time(self.expire_base[0], abs_msec as u64);
            Ok(abs_msec)
        } else {
            if params.flags.contains(ExpireFlags::XX) {
                return Err(OpStatus::Skipped);
            }
            self.add_expire(cntx.db_index, it, abs_msec as u64);
            Ok(abs_msec)
        }
    }

    /// Check one entry's deadline and delete it if due. Public variant of the
    /// on-access check, for callers that hold a position.
    pub fn expire_if_needed(&mut self, cntx: Context, it: EntryRef) -> bool {
        let db = self.get_db_table(cntx.db_index).expect("database is active");
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;
        let mut parts = self.parts(cntx);
        let (prime, mut rest) = split_table(dbt);
        expire_if_needed(&mut parts, prime, &mut rest, it)
    }

    /// One step of the periodic expired-key sweep. Inspects `count / 3`
    /// expire rows from the persistent cursor; when the deletion rate
    /// exceeds a quarter of the sample it keeps going up to `count`.
    pub fn delete_expired_step(&mut self, cntx: Context, count: u32) -> DeleteExpiredStats {
        let Some(db) = self.get_db_table(cntx.db_index) else {
            return DeleteExpiredStats::default();
        };
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;
        let mut parts = self.parts(cntx);

        let mut result = DeleteExpiredStats::default();
        sweep_expired(&mut parts, dbt, count / 3, &mut result);
        // keep sweeping only when the first sample showed a strong rate
        if result.deleted * 4 > result.traversed {
            sweep_expired(&mut parts, dbt, count - count / 3, &mut result);
        }
        result
    }

    /// Sweep every database completely. Used on mode transitions where
    /// lazily-expired entries must not linger.
    pub fn expire_all_if_needed(&mut self, time_now_ms: u64) {
        for db_index in 0..self.db_arr.len() as DbIndex {
            let Some(db) = self.get_db_table(db_index) else {
                continue;
            };
            let cntx = Context::new(db_index, time_now_ms);
            let mut dbt = db.borrow_mut();
            let dbt = &mut *dbt;
            let mut parts = self.parts(cntx);

            let DbTable {
                prime,
                expire,
                mcflag,
                trans_locks,
                watched_keys,
                stats,
                slots_stats,
                top_keys,
                index,
                ..
            } = dbt;

            let mut cursor = Cursor::default();
            loop {
                let next = expire.traverse(cursor, |expire_tbl, exp_ref| {
                    let key: Box<[u8]> = expire_tbl.key_at(exp_ref).as_bytes().into();
                    let Some(prime_it) = prime.find(&key) else {
                        error!("expire row not found in the prime table");
                        return;
                    };
                    let mut rest = TableSansPrime {
                        expire: expire_tbl,
                        mcflag: &mut *mcflag,
                        stats: &mut *stats,
                        slots_stats: &mut *slots_stats,
                        watched_keys: &mut *watched_keys,
                        trans_locks: &*trans_locks,
                        top_keys: &mut *top_keys,
                        index: *index,
                    };
                    expire_if_needed(&mut parts, prime, &mut rest, prime_it);
                });
                match next {
                    Some(c) => cursor = c,
                    None => break,
                }
            }
        }
    }

    // ----- heartbeat eviction -----

    /// Evict cold entries until `increase_goal_bytes` have been reclaimed or
    /// the per-heartbeat cap is reached. Only runs in caching mode with
    /// expiration allowed; never on a replica. Returns keys evicted.
    pub fn free_mem_with_eviction_step(
        &mut self,
        cntx: Context,
        increase_goal_bytes: usize,
    ) -> usize {
        debug_assert!(!self.server_state.is_replica());
        if !self.caching_mode
            || !self.expire_allowed
            || !self.heartbeat.enable_heartbeat_eviction()
        {
            return 0;
        }
        let max_eviction_per_hb = self.heartbeat.max_eviction_per_heartbeat() as usize;
        let max_segment_to_consider = self.heartbeat.max_segment_to_consider() as usize;

        let Some(db) = self.get_db_table(cntx.db_index) else {
            return 0;
        };
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;
        let mut parts = self.parts(cntx);
        let (prime, mut rest) = split_table(dbt);

        let db_used = |prime: &PrimeTable, rest: &TableSansPrime| -> usize {
            rest.stats.obj_memory_usage as usize + prime.mem_usage() + rest.expire.mem_usage()
        };
        let used_memory_before = db_used(prime, &rest);
        let mut used_memory_after = used_memory_before;

        let layout = prime.layout();
        let num_segments = prime.segment_count();
        let starting_segment = rand::thread_rng().gen_range(0..num_segments) as u32;

        let mut evicted = 0usize;
        let mut keys_to_journal: Vec<Box<[u8]>> = Vec::new();

        'finish: for slot_id in (0..layout.slots()).rev() {
            for bucket_id in (0..layout.total_buckets()).rev() {
                // segment order carries no recency, so a random start is fair
                let mut segment_id = starting_segment;
                for _ in 0..max_segment_to_consider {
                    let next_segment = (segment_id + 1) % num_segments as u32;
                    let Some(evict_it) = prime.entry_at(segment_id, bucket_id, slot_id) else {
                        segment_id = next_segment;
                        continue;
                    };
                    if prime.key_at(evict_it).is_sticky() {
                        segment_id = next_segment;
                        continue;
                    }
                    let key_bytes: Box<[u8]> = prime.key_at(evict_it).as_bytes().into();
                    if rest
                        .trans_locks
                        .contains_key(lock_key(parts.cluster, &key_bytes))
                    {
                        segment_id = next_segment;
                        continue;
                    }

                    if parts.journal.is_some() {
                        keys_to_journal.push(key_bytes);
                    }
                    perform_deletion(&mut parts, prime, &mut rest, evict_it);
                    evicted += 1;
                    used_memory_after = db_used(prime, &rest);

                    if evicted == max_eviction_per_hb
                        || used_memory_before.saturating_sub(used_memory_after)
                            >= increase_goal_bytes
                    {
                        break 'finish;
                    }
                    segment_id = next_segment;
                }
            }
        }

        // replicas learn of the evictions as expirations; recorded after the
        // scan since journal writes may suspend
        if let Some(journal) = parts.journal {
            for key in &keys_to_journal {
                let slot = parts
                    .cluster
                    .is_enabled()
                    .then(|| parts.cluster.key_slot(key));
                journal.record_expired(rest.index, slot, key);
            }
        }

        parts.events.evicted_keys += evicted as u64;
        debug!(
            "heartbeat eviction: {} keys, {} bytes freed (goal {})",
            evicted,
            used_memory_before.saturating_sub(used_memory_after),
            increase_goal_bytes
        );
        evicted
    }

    // ----- flush -----

    /// Replace one database (or all of them) with a fresh table. Ongoing
    /// transactions keep their locks; the old tables are retired for
    /// off-hot-path teardown.
    pub fn flush_db(&mut self, db_ind: DbIndex) {
        self.client_tracking_map.clear();
        if db_ind != DB_ALL {
            self.flush_db_indexes(&[db_ind]);
            return;
        }
        let indexes: Vec<DbIndex> = (0..self.db_arr.len() as DbIndex)
            .filter(|&i| self.is_db_valid(i))
            .collect();
        self.flush_db_indexes(&indexes);
    }

    fn flush_db_indexes(&mut self, indexes: &[DbIndex]) {
        debug_assert!(self.bumped_items.is_empty(), "flush mid-batch");
        for &db_ind in indexes {
            self.invalidate_db_watches(db_ind);
            let fresh = Rc::new(RefCell::new(DbTable::new(
                self.prime_layout,
                self.expire_layout,
                db_ind,
                self.cluster.is_enabled(),
            )));
            let old = self.db_arr[db_ind as usize]
                .replace(fresh.clone())
                .expect("flush of an inactive database");
            core::mem::swap(
                &mut old.borrow_mut().trans_locks,
                &mut fresh.borrow_mut().trans_locks,
            );
            if let Some(tiered) = &self.tiered {
                tiered.cancel_all_ios(db_ind);
            }
            self.retired_tables.push(old);
        }
    }

    /// Tables retired by flushes, for the shard's background finalizer.
    pub fn take_retired_tables(&mut self) -> Vec<DbTableRef> {
        core::mem::take(&mut self.retired_tables)
    }

    /// Tear down retired tables: release tiered extents still referenced by
    /// offloaded values, then drop our reference. A snapshot holding the
    /// table keeps it alive; the extents are gone either way. Returns how
    /// many tables were finalized.
    pub fn finalize_retired_tables(&mut self) -> usize {
        let retired = self.take_retired_tables();
        let count = retired.len();
        for table in retired {
            let mut dbt = table.borrow_mut();
            if dbt.stats.tiered_entries == 0 {
                continue;
            }
            let external: Vec<_> = dbt
                .prime
                .refs()
                .filter(|&r| dbt.prime.value_at(r).is_external())
                .collect();
            for it in external {
                let handle = dbt.prime.value_at(it).external_handle().expect("external");
                if let Some(tiered) = &self.tiered {
                    let key = dbt.prime.key_at(it).as_bytes().to_vec();
                    tiered.free(dbt.index, &key, handle);
                }
                dbt.stats.tiered_entries = dbt.stats.tiered_entries.saturating_sub(1);
                dbt.stats.tiered_size = dbt.stats.tiered_size.saturating_sub(handle.1 as u64);
            }
            debug_assert_eq!(dbt.stats.tiered_entries, 0);
        }
        count
    }

    pub fn is_replica(&self) -> bool {
        self.server_state.is_replica()
    }

    /// Delete every key of database 0 whose slot is in `slot_ids`. Runs as a
    /// cooperative task: yields every 100 visited entries and stops early on
    /// shutdown. Only keys that existed when the flush started are removed.
    pub fn flush_slots(&mut self, cntx: Context, slot_ids: &SlotSet) {
        self.invalidate_slot_watches(slot_ids);
        self.flush_slots_fb(cntx, slot_ids);
    }

    fn flush_slots_fb(&mut self, cntx: Context, slot_ids: &SlotSet) {
        let next_version = self.next_version();
        let scheduler = self.scheduler.clone();
        let Some(db) = self.get_db_table(cntx.db_index) else {
            return;
        };
        let mut dbt = db.borrow_mut();
        let dbt = &mut *dbt;
        let mut parts = self.parts(cntx);

        let DbTable {
            prime,
            expire,
            mcflag,
            trans_locks,
            watched_keys,
            stats,
            slots_stats,
            top_keys,
            index,
            ..
        } = dbt;

        let mut iterations = 0u64;
        let mut cursor = Cursor::default();
        loop {
            let next = prime.traverse(cursor, |prime_tbl, it| {
                iterations += 1;
                if iterations % 100 == 0 {
                    scheduler.yield_now();
                }
                let key: Box<[u8]> = prime_tbl.key_at(it).as_bytes().into();
                let sid = parts.cluster.key_slot(&key);
                if slot_ids.contains(&sid) && prime_tbl.version_of(it) < next_version {
                    let mut rest = TableSansPrime {
                        expire: &mut *expire,
                        mcflag: &mut *mcflag,
                        stats: &mut *stats,
                        slots_stats: &mut *slots_stats,
                        watched_keys: &mut *watched_keys,
                        trans_locks: &*trans_locks,
                        top_keys: &mut *top_keys,
                        index: *index,
                    };
                    perform_deletion(&mut parts, prime_tbl, &mut rest, it);
                }
            });
            match next {
                Some(c) if !scheduler.is_shutting_down() => cursor = c,
                _ => break,
            }
        }
    }

    // ----- intent locks -----

    /// Acquire `mode` on every unique key. All-or-nothing: on a conflict the
    /// keys taken by this call are rolled back and `false` is returned.
    pub fn acquire(&mut self, mode: LockMode, args: &KeyLockArgs) -> bool {
        if args.keys.is_empty() {
            return true;
        }
        debug_assert!(args.key_step >= 1);
        let db = self
            .get_db_table(args.db_index)
            .expect("database is active");
        let mut dbt = db.borrow_mut();
        let lt = &mut dbt.trans_locks;

        self.uniq_keys.clear();
        let mut taken: Vec<Box<[u8]>> = Vec::new();
        let mut acquired = true;
        for i in (0..args.keys.len()).step_by(args.key_step) {
            let key: Box<[u8]> = lock_key(&*self.cluster, args.keys[i]).into();
            if !self.uniq_keys.insert(key.clone()) {
                continue;
            }
            let lock = lt.entry(key.clone()).or_default();
            if lock.acquire(mode) {
                taken.push(key);
            } else {
                acquired = false;
                break;
            }
        }

        if !acquired {
            for key in taken {
                let lock = lt.get_mut(&key).expect("lock row just acquired");
                lock.release(mode);
                if lock.is_free() {
                    lt.remove(&key);
                }
            }
        }
        debug!(
            "acquire {} for {} keys: {}",
            mode.name(),
            self.uniq_keys.len(),
            acquired
        );
        acquired
    }

    /// Release `mode` on every unique key of a balanced prior acquire.
    pub fn release(&mut self, mode: LockMode, args: &KeyLockArgs) {
        if args.keys.is_empty() {
            return;
        }
        let db = self
            .get_db_table(args.db_index)
            .expect("database is active");
        let mut dbt = db.borrow_mut();
        let lt = &mut dbt.trans_locks;

        self.uniq_keys.clear();
        for i in (0..args.keys.len()).step_by(args.key_step) {
            let key: Box<[u8]> = lock_key(&*self.cluster, args.keys[i]).into();
            if !self.uniq_keys.insert(key.clone()) {
                continue;
            }
            let lock = lt
                .get_mut(&key)
                .expect("release of a key that is not locked");
            lock.release(mode);
            if lock.is_free() {
                lt.remove(&key);
            }
        }
        self.uniq_keys.clear();
    }

    /// Would an acquire succeed, without acquiring?
    pub fn check_lock(&self, mode: LockMode, db_ind: DbIndex, key: &[u8]) -> bool {
        let Some(db) = self.get_db_table(db_ind) else {
            return true;
        };
        let dbt = db.borrow();
        dbt.trans_locks
            .get(lock_key(&*self.cluster, key))
            .map(|lock| lock.check(mode))
            .unwrap_or(true)
    }

    pub fn check_lock_args(&self, mode: LockMode, args: &KeyLockArgs) -> bool {
        (0..args.keys.len())
            .step_by(args.key_step)
            .all(|i| self.check_lock(mode, args.db_index, args.keys[i]))
    }

    // ----- memcached flags -----

    pub fn set_mc_flag(&mut self, db_ind: DbIndex, key: &[u8], flag: u32) {
        let db = self.get_db_table(db_ind).expect("database is active");
        let mut dbt = db.borrow_mut();
        if flag == 0 {
            if dbt.mcflag.erase_key(key) == 0 {
                error!("inconsistent state: mcflag should be present but was not found");
            }
        } else {
            let _ = dbt.mcflag.insert(Key::new(key), flag, &mut UnboundedGrowth);
        }
        // keep the presence bit on the value in step with the aux row
        if let Some(it) = dbt.prime.find(key) {
            dbt.prime.value_at_mut(it).set_flag(flag != 0);
        }
    }

    pub fn get_mc_flag(&self, db_ind: DbIndex, key: &[u8]) -> u32 {
        let db = self.get_db_table(db_ind).expect("database is active");
        let dbt = db.borrow();
        match dbt.mcflag.find(key) {
            Some(it) => *dbt.mcflag.value_at(it),
            None => {
                error!("inconsistent state: mcflag should be present but was not found");
                0
            }
        }
    }

    // ----- change callbacks -----

    /// Subscribe to pre-mutation notifications. The callback is stamped with
    /// the current version; it observes exactly the mutations whose entry
    /// version crosses it.
    pub fn register_on_change(&mut self, cb: ChangeCallback) -> u64 {
        let version = self.next_version();
        self.change_cb.push((version, cb));
        version
    }

    pub fn unregister_on_change(&mut self, id: u64) {
        match self.change_cb.iter().position(|(v, _)| *v == id) {
            Some(pos) => {
                self.change_cb.remove(pos);
            }
            None => error!("no change callback registered under {}", id),
        }
    }

    /// Notify only the callbacks registered strictly before the entry's
    /// bucket version and strictly before `upper_bound`. Used by snapshotting
    /// to drain pending pre-images.
    pub fn flush_change_to_earlier_callbacks(
        &mut self,
        db_ind: DbIndex,
        it: EntryRef,
        upper_bound: u64,
    ) {
        let Some(db) = self.get_db_table(db_ind) else {
            return;
        };
        let dbt = db.borrow();
        let bucket_version = dbt.prime.version_of(it);
        for (version, cb) in self.change_cb.iter_mut() {
            debug_assert!(*version <= upper_bound);
            if *version == upper_bound {
                return;
            }
            if bucket_version < *version {
                cb(
                    db_ind,
                    &ChangeReq::Entry {
                        table: &dbt.prime,
                        entry: it,
                    },
                );
            }
        }
    }

    /// End of one client callback batch: entries become bumpable again.
    pub fn on_cb_finish(&mut self) {
        self.bumped_items.clear();
    }

    // ----- watches -----

    pub fn register_watched_key(
        &mut self,
        db_ind: DbIndex,
        key: &[u8],
        handle: &Rc<WatchHandle>,
    ) {
        let db = self.get_db_table(db_ind).expect("database is active");
        db.borrow_mut()
            .watched_keys
            .entry(key.into())
            .or_default()
            .push(handle.clone());
    }

    /// Drop one connection's watch on one key.
    pub fn unregister_watched_key(
        &mut self,
        db_ind: DbIndex,
        key: &[u8],
        handle: &Rc<WatchHandle>,
    ) {
        let Some(db) = self.get_db_table(db_ind) else {
            return;
        };
        let mut dbt = db.borrow_mut();
        if let Some(handles) = dbt.watched_keys.get_mut(key) {
            handles.retain(|h| !Rc::ptr_eq(h, handle));
            if handles.is_empty() {
                dbt.watched_keys.remove(key);
            }
        }
    }

    fn invalidate_db_watches(&mut self, db_ind: DbIndex) {
        let Some(db) = self.get_db_table(db_ind) else {
            return;
        };
        for handles in db.borrow().watched_keys.values() {
            for handle in handles {
                handle.mark_dirty();
            }
        }
    }

    fn invalidate_slot_watches(&mut self, slot_ids: &SlotSet) {
        let Some(db) = self.get_db_table(0) else {
            return;
        };
        for (key, handles) in db.borrow().watched_keys.iter() {
            if !slot_ids.contains(&self.cluster.key_slot(key)) {
                continue;
            }
            for handle in handles {
                handle.mark_dirty();
            }
        }
    }

    // ----- client tracking -----

    /// Subscribe a connection to invalidation messages for `keys`.
    pub fn track_keys(&mut self, conn: &Weak<dyn TrackedClient>, keys: &[&[u8]]) {
        if conn.upgrade().is_none() {
            debug!("connection expired, not tracking");
            return;
        }
        for key in keys {
            let clients = self.client_tracking_map.entry((*key).into()).or_default();
            if !clients.iter().any(|w| w.ptr_eq(conn)) {
                clients.push(conn.clone());
            }
        }
    }
}
