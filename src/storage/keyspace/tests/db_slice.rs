// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end behavior of one shard slice: expiration, caching eviction,
//! change callbacks, slot flushes, heartbeat bounds, locks, and accounting.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use config::Heartbeat;
use keyspace::{
    Context, DbSlice, ExpireFlags, ExpireParams, Journal, JournalOp, KeyLockArgs, Layout,
    LockMode, ObjType, OpStatus, RedisClusterView, Scheduler, ShardContext, SlotSet, TimeUnit,
    TrackedClient, Value, WatchHandle,
};

fn ctx(time_now_ms: u64) -> Context {
    Context::new(0, time_now_ms)
}

fn set(slice: &mut DbSlice, t: u64, key: &[u8], value: &[u8], expire_at_ms: u64) {
    let res = slice
        .add_or_update(ctx(t), key, Value::string(value), expire_at_ms)
        .unwrap();
    res.post_updater.run(slice);
}

fn get(slice: &mut DbSlice, t: u64, key: &[u8]) -> Option<Vec<u8>> {
    match slice.find_read_only(ctx(t), key, None) {
        Ok(it) => {
            let db = slice.get_db_table(0).unwrap();
            let value = db.borrow().prime.value_at(it).as_bytes().unwrap().to_vec();
            Some(value)
        }
        Err(_) => None,
    }
}

#[derive(Default)]
struct TestJournal {
    entries: RefCell<Vec<(JournalOp, Vec<u8>)>>,
}

impl Journal for TestJournal {
    fn record_entry(
        &self,
        _txid: u64,
        op: JournalOp,
        _db_index: u16,
        _shard_count: u32,
        _slot: Option<u16>,
        _cmd: &str,
        args: &[&[u8]],
        _multi_shard: bool,
    ) {
        self.entries.borrow_mut().push((op, args[0].to_vec()));
    }
}

#[derive(Default)]
struct CountingScheduler {
    yields: Cell<usize>,
}

impl Scheduler for CountingScheduler {
    fn yield_now(&self) {
        self.yields.set(self.yields.get() + 1);
    }
}

#[derive(Default)]
struct TestClient {
    received: RefCell<Vec<Vec<u8>>>,
}

impl TrackedClient for TestClient {
    fn thread(&self) -> usize {
        0
    }

    fn is_tracking_on(&self) -> bool {
        true
    }

    fn send_invalidation(&self, key: &[u8]) {
        self.received.borrow_mut().push(key.to_vec());
    }
}

// insert with a deadline, read before and after it
#[test]
fn set_get_expire_flow() {
    let mut slice = DbSlice::builder(0).build();

    set(&mut slice, 0, b"a", b"1", 1000);

    assert_eq!(get(&mut slice, 500, b"a"), Some(b"1".to_vec()));
    assert_eq!(slice.events().hits, 1);
    assert_eq!(slice.events().expired_keys, 0);

    assert_eq!(get(&mut slice, 1001, b"a"), None);
    assert_eq!(slice.events().expired_keys, 1);
    assert_eq!(slice.events().misses, 1);

    // both sides of the expire pairing are gone
    let db = slice.get_db_table(0).unwrap();
    assert_eq!(db.borrow().prime.len(), 0);
    assert_eq!(db.borrow().expire.len(), 0);
}

// a full caching shard evicts a cold stash entry, not the
// recently read key
#[test]
fn caching_insert_evicts_cold_stash_entry() {
    // one segment, 12 slots; probes cover the whole segment so it fills
    // completely before the policy is consulted
    let mut slice = DbSlice::builder(0)
        .caching_mode(true)
        .prime_layout(Layout::new(2, 2, 3))
        .memory_budget(0)
        .soft_budget_limit(0)
        .build();

    for i in 0..12 {
        let key = format!("k{:02}", i);
        set(&mut slice, 0, key.as_bytes(), b"v", 0);
    }
    assert_eq!(slice.db_size(0), 12);
    assert_eq!(slice.events().evicted_keys, 0);

    // touch k00 so it is promoted and cannot be the victim
    assert!(get(&mut slice, 0, b"k00").is_some());

    set(&mut slice, 0, b"k12", b"v", 0);
    assert_eq!(slice.events().evicted_keys, 1);
    assert_eq!(slice.db_size(0), 12);
    assert!(get(&mut slice, 0, b"k00").is_some());
    assert!(get(&mut slice, 0, b"k12").is_some());
}

// a callback registered at v₀ observes new-key, update, delete
// in order
#[test]
fn change_callbacks_observe_insert_update_delete() {
    let mut slice = DbSlice::builder(0).build();
    let log: Rc<RefCell<Vec<(String, u64)>>> = Rc::default();

    let sink = log.clone();
    let v0 = slice.register_on_change(Box::new(move |_db, req| {
        let mut log = sink.borrow_mut();
        match req {
            keyspace::ChangeReq::NewKey(key) => {
                log.push((format!("new:{}", String::from_utf8_lossy(key)), 0));
            }
            keyspace::ChangeReq::Entry { table, entry } => {
                log.push(("entry".to_string(), table.version_of(*entry)));
            }
            keyspace::ChangeReq::Bucket { .. } => {
                log.push(("bucket".to_string(), 0));
            }
        }
    }));

    set(&mut slice, 0, b"k", b"x", 0);
    set(&mut slice, 0, b"k", b"y", 0);
    let it = slice.find_read_only(ctx(0), b"k", None).unwrap();
    assert!(slice.del(ctx(0), it));

    let log = log.borrow();
    assert_eq!(log.len(), 3, "exactly three notifications: {:?}", *log);
    assert_eq!(log[0].0, "new:k");
    assert_eq!(log[1].0, "entry");
    assert!(log[1].1 > v0, "update observed with a pre-registration version");
    assert_eq!(log[2].0, "entry");
}

// repeated reads of a hot key bump it at most once per batch
#[test]
fn hot_key_bumped_once_per_batch() {
    let mut slice = DbSlice::builder(0).caching_mode(true).build();
    set(&mut slice, 0, b"hot", b"v", 0);

    assert!(get(&mut slice, 0, b"hot").is_some());
    assert!(get(&mut slice, 0, b"hot").is_some());
    assert_eq!(slice.events().bumpups, 1);

    slice.on_cb_finish();
    assert!(get(&mut slice, 0, b"hot").is_some());
    assert_eq!(slice.events().bumpups, 2);
}

// flushing a slot set deletes exactly its keys and yields
// along the way
#[test]
fn flush_slots_deletes_only_matching_slots() {
    let cluster = Rc::new(RedisClusterView::new(false));
    let scheduler = Rc::new(CountingScheduler::default());
    let mut slice = DbSlice::builder(0)
        .cluster(cluster.clone())
        .scheduler(scheduler.clone())
        .build();

    let n = 10_000;
    let mut ttl_keys = 0u64;
    for i in 0..n {
        let key = format!("key:{}", i);
        let expire_at = if i % 10 == 0 { 10_000_000 } else { 0 };
        if expire_at != 0 {
            ttl_keys += 1;
        }
        set(&mut slice, 0, key.as_bytes(), b"v", expire_at);
    }
    assert_eq!(slice.db_size(0), n);

    use keyspace::ClusterView;
    let mut slots = SlotSet::default();
    slots.insert(cluster.key_slot(b"key:0"));
    slots.insert(cluster.key_slot(b"key:17"));

    let mut expected_gone = Vec::new();
    let mut ttl_gone = 0u64;
    for i in 0..n {
        let key = format!("key:{}", i);
        if slots.contains(&cluster.key_slot(key.as_bytes())) {
            expected_gone.push(key.clone());
            if i % 10 == 0 {
                ttl_gone += 1;
            }
        }
    }
    assert!(!expected_gone.is_empty());

    slice.flush_slots(ctx(0), &slots);

    assert_eq!(slice.db_size(0), n - expected_gone.len());
    for key in &expected_gone {
        assert!(get(&mut slice, 0, key.as_bytes()).is_none());
    }
    let db = slice.get_db_table(0).unwrap();
    assert_eq!(db.borrow().expire.len() as u64, ttl_keys - ttl_gone);

    assert!(
        scheduler.yields.get() >= n / 100,
        "only {} yields for {} visited entries",
        scheduler.yields.get(),
        n
    );
}

// heartbeat eviction stays within its bounds and never touches
// a locked key
#[test]
fn heartbeat_eviction_respects_bounds_and_locks() {
    let journal = Rc::new(TestJournal::default());
    let mut slice = DbSlice::builder(0)
        .caching_mode(true)
        .journal(journal.clone())
        .build();

    for i in 0..500 {
        let key = format!("cold:{}", i);
        set(&mut slice, 0, key.as_bytes(), b"payload", 0);
    }

    let locked: &[&[u8]] = &[b"cold:42"];
    assert!(slice.acquire(LockMode::Exclusive, &KeyLockArgs::new(0, locked)));

    let evicted = slice.free_mem_with_eviction_step(ctx(0), 1 << 20);
    assert!(evicted > 0);
    assert!(evicted <= 100, "exceeded max evictions: {}", evicted);
    assert_eq!(slice.events().evicted_keys, evicted as u64);

    // the locked key survived and every eviction was journaled as expired
    assert!(get(&mut slice, 0, b"cold:42").is_some());
    let entries = journal.entries.borrow();
    assert_eq!(entries.len(), evicted);
    assert!(entries.iter().all(|(op, _)| *op == JournalOp::Expired));
    assert!(entries.iter().all(|(_, key)| key != b"cold:42"));
}

#[test]
fn mcflag_roundtrip_and_inconsistency() {
    let mut slice = DbSlice::builder(0).build();
    set(&mut slice, 0, b"memcached", b"v", 0);

    slice.set_mc_flag(0, b"memcached", 7);
    assert_eq!(slice.get_mc_flag(0, b"memcached"), 7);

    slice.set_mc_flag(0, b"memcached", 0);
    // the row is gone; the read logs the inconsistency and answers 0
    assert_eq!(slice.get_mc_flag(0, b"memcached"), 0);
}

#[test]
fn lock_acquire_release_roundtrip() {
    let mut slice = DbSlice::builder(0).build();
    let keys: &[&[u8]] = &[b"k"];
    let args = KeyLockArgs::new(0, keys);

    assert!(slice.acquire(LockMode::Exclusive, &args));
    assert!(!slice.acquire(LockMode::Exclusive, &args));
    slice.release(LockMode::Exclusive, &args);
    assert!(slice.acquire(LockMode::Exclusive, &args));
    slice.release(LockMode::Exclusive, &args);

    // a balanced sequence leaves the table empty
    let db = slice.get_db_table(0).unwrap();
    assert!(db.borrow().trans_locks.is_empty());
}

#[test]
fn failed_multi_key_acquire_rolls_back() {
    let mut slice = DbSlice::builder(0).build();
    let held: &[&[u8]] = &[b"k1"];
    assert!(slice.acquire(LockMode::Shared, &KeyLockArgs::new(0, held)));

    let both: &[&[u8]] = &[b"k0", b"k0", b"k1"];
    assert!(!slice.acquire(LockMode::Exclusive, &KeyLockArgs::new(0, both)));

    let db = slice.get_db_table(0).unwrap();
    let db = db.borrow();
    // k0 was taken then rolled back; k1 keeps its original shared holder
    assert!(!db.trans_locks.contains_key(&b"k0"[..]));
    assert!(db.trans_locks.get(&b"k1"[..]).unwrap().check(LockMode::Shared));
}

#[test]
fn update_expire_conditional_flags() {
    let mut slice = DbSlice::builder(0).build();
    set(&mut slice, 0, b"ttl", b"v", 5000);
    set(&mut slice, 0, b"plain", b"v", 0);

    let with_flags = |flags: ExpireFlags, value: i64| ExpireParams {
        value,
        unit: TimeUnit::Msec,
        absolute: false,
        persist: false,
        flags,
    };

    // NX on an existing deadline
    let found = slice.find_mutable(ctx(0), b"ttl", None).unwrap();
    found.post_updater.run(&mut slice);
    let err = slice
        .update_expire(ctx(0), found.it, found.exp_it, &with_flags(ExpireFlags::NX, 9000))
        .unwrap_err();
    assert_eq!(err, OpStatus::Skipped);

    // XX on a key without one
    let found = slice.find_mutable(ctx(0), b"plain", None).unwrap();
    found.post_updater.run(&mut slice);
    let err = slice
        .update_expire(ctx(0), found.it, found.exp_it, &with_flags(ExpireFlags::XX, 9000))
        .unwrap_err();
    assert_eq!(err, OpStatus::Skipped);

    // GT with a smaller deadline, LT with a larger one
    let found = slice.find_mutable(ctx(0), b"ttl", None).unwrap();
    found.post_updater.run(&mut slice);
    let err = slice
        .update_expire(ctx(0), found.it, found.exp_it, &with_flags(ExpireFlags::GT, 1000))
        .unwrap_err();
    assert_eq!(err, OpStatus::Skipped);
    let err = slice
        .update_expire(ctx(0), found.it, found.exp_it, &with_flags(ExpireFlags::LT, 9000))
        .unwrap_err();
    assert_eq!(err, OpStatus::Skipped);

    // an acceptable GT moves the deadline
    let found = slice.find_mutable(ctx(0), b"ttl", None).unwrap();
    found.post_updater.run(&mut slice);
    let at = slice
        .update_expire(ctx(0), found.it, found.exp_it, &with_flags(ExpireFlags::GT, 9000))
        .unwrap();
    assert_eq!(at, 9000);

    // beyond the representable horizon
    let found = slice.find_mutable(ctx(0), b"ttl", None).unwrap();
    found.post_updater.run(&mut slice);
    let err = slice
        .update_expire(
            ctx(0),
            found.it,
            found.exp_it,
            &with_flags(ExpireFlags::NONE, 200 * 365 * 24 * 3600 * 1000),
        )
        .unwrap_err();
    assert_eq!(err, OpStatus::OutOfRange);

    // persist removes the row
    let found = slice.find_mutable(ctx(0), b"ttl", None).unwrap();
    found.post_updater.run(&mut slice);
    let persist = ExpireParams {
        value: 0,
        unit: TimeUnit::Msec,
        absolute: false,
        persist: true,
        flags: ExpireFlags::NONE,
    };
    assert_eq!(slice.update_expire(ctx(0), found.it, None, &persist).unwrap(), 0);
    let db = slice.get_db_table(0).unwrap();
    assert_eq!(db.borrow().expire.len(), 0);
}

#[test]
fn memory_accounting_matches_recomputation() {
    let mut slice = DbSlice::builder(0).build();

    for i in 0..200 {
        let key = format!("key-with-some-length-{:04}", i);
        let value = vec![b'x'; (i % 61) as usize];
        set(&mut slice, 0, key.as_bytes(), &value, 0);
    }
    // overwrite some, delete some
    for i in (0..200).step_by(3) {
        let key = format!("key-with-some-length-{:04}", i);
        set(&mut slice, 0, key.as_bytes(), b"short", 0);
    }
    for i in (0..200).step_by(7) {
        let key = format!("key-with-some-length-{:04}", i);
        if let Ok(it) = slice.find_read_only(ctx(0), key.as_bytes(), None) {
            slice.del(ctx(0), it);
        }
    }

    let db = slice.get_db_table(0).unwrap();
    let db = db.borrow();
    let mut recomputed = 0u64;
    let mut inline = 0u64;
    for r in db.prime.refs() {
        let (key, value) = db.prime.pair_at(r);
        recomputed += key.mem_used() as u64 + value.mem_used() as u64;
        inline += key.is_inline() as u64;
    }
    assert_eq!(db.stats.obj_memory_usage, recomputed);
    assert_eq!(db.stats.inline_keys, inline);
}

#[test]
fn sticky_entries_are_never_evicted() {
    let mut slice = DbSlice::builder(0)
        .caching_mode(true)
        .prime_layout(Layout::new(2, 2, 3))
        .memory_budget(0)
        .soft_budget_limit(0)
        .build();

    for i in 0..12 {
        let key = format!("s{:02}", i);
        set(&mut slice, 0, key.as_bytes(), b"v", 0);
        let it = slice.find_read_only(ctx(0), key.as_bytes(), None).unwrap();
        slice.set_sticky(0, it, true);
    }
    slice.on_cb_finish();

    // the segment is full of sticky entries: nothing may be evicted, so the
    // insert is rejected
    let err = slice.add_or_find(ctx(0), b"s12").unwrap_err();
    assert_eq!(err, OpStatus::OutOfMemory);
    assert_eq!(slice.events().insertion_rejections, 1);
    assert_eq!(slice.events().evicted_keys, 0);

    // heartbeat eviction walks the table but skips every sticky entry
    let evicted = slice.free_mem_with_eviction_step(ctx(0), 1 << 20);
    assert_eq!(evicted, 0);
    assert_eq!(slice.db_size(0), 12);
}

#[test]
fn watch_marks_dirty_once_and_clears() {
    let mut slice = DbSlice::builder(0).build();
    set(&mut slice, 0, b"watched", b"v", 0);

    let handle = Rc::new(WatchHandle::default());
    slice.register_watched_key(0, b"watched", &handle);
    assert!(!handle.is_dirty());

    set(&mut slice, 0, b"watched", b"v2", 0);
    assert!(handle.is_dirty());

    // one-shot: the next mutation finds no watcher list
    handle.reset();
    set(&mut slice, 0, b"watched", b"v3", 0);
    assert!(!handle.is_dirty());
}

#[test]
fn tracking_invalidation_on_mutation() {
    let mut slice = DbSlice::builder(0).build();
    set(&mut slice, 0, b"cached", b"v", 0);

    let client = Rc::new(TestClient::default());
    let as_dyn: Rc<dyn TrackedClient> = client.clone();
    let weak: Weak<dyn TrackedClient> = Rc::downgrade(&as_dyn);
    slice.track_keys(&weak, &[b"cached"]);

    set(&mut slice, 0, b"cached", b"v2", 0);
    assert_eq!(client.received.borrow().as_slice(), &[b"cached".to_vec()]);

    // the tracking entry was consumed by the dispatch
    set(&mut slice, 0, b"cached", b"v3", 0);
    assert_eq!(client.received.borrow().len(), 1);
}

#[test]
fn journal_records_passive_expiry() {
    let journal = Rc::new(TestJournal::default());
    let mut slice = DbSlice::builder(0).journal(journal.clone()).build();

    set(&mut slice, 0, b"short-lived", b"v", 100);
    assert_eq!(get(&mut slice, 200, b"short-lived"), None);

    let entries = journal.entries.borrow();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, JournalOp::Expired);
    assert_eq!(entries[0].1, b"short-lived".to_vec());
}

#[test]
fn replica_never_expires_passively() {
    let state = Rc::new(keyspace::ServerState::default());
    state.set_replica(true);
    let mut slice = DbSlice::builder(0).server_state(state).build();

    set(&mut slice, 0, b"kept", b"v", 100);
    // well past the deadline, but a replica keeps the entry
    assert_eq!(get(&mut slice, 10_000, b"kept"), Some(b"v".to_vec()));
    assert_eq!(slice.events().expired_keys, 0);
}

#[test]
fn flush_db_preserves_locks_and_retires_tables() {
    let mut slice = DbSlice::builder(0).build();
    for i in 0..50 {
        let key = format!("f{}", i);
        set(&mut slice, 0, key.as_bytes(), b"v", 0);
    }
    let keys: &[&[u8]] = &[b"f1"];
    assert!(slice.acquire(LockMode::Exclusive, &KeyLockArgs::new(0, keys)));

    // a snapshot retains the old table across the flush
    let snapshot = slice.get_db_table(0).unwrap();
    slice.flush_db(0);

    assert_eq!(slice.db_size(0), 0);
    assert_eq!(snapshot.borrow().prime.len(), 50);

    // the lock moved to the fresh table: ongoing transactions stay sound
    assert!(!slice.acquire(LockMode::Exclusive, &KeyLockArgs::new(0, keys)));
    slice.release(LockMode::Exclusive, &KeyLockArgs::new(0, keys));
    assert!(slice.acquire(LockMode::Exclusive, &KeyLockArgs::new(0, keys)));
    slice.release(LockMode::Exclusive, &KeyLockArgs::new(0, keys));

    assert_eq!(slice.finalize_retired_tables(), 1);
}

#[test]
fn expired_sweep_is_eventually_exhaustive() {
    let mut slice = DbSlice::builder(0).build();
    for i in 0..300 {
        let key = format!("e{}", i);
        set(&mut slice, 0, key.as_bytes(), b"v", 50);
    }
    // everything is past due; repeated steps drain the table
    let mut guard = 0;
    while slice.db_size(0) > 0 {
        slice.delete_expired_step(ctx(100), 30);
        guard += 1;
        assert!(guard < 10_000, "sweep failed to converge");
    }
    assert_eq!(slice.events().expired_keys, 300);
    let db = slice.get_db_table(0).unwrap();
    assert_eq!(db.borrow().expire.len(), 0);
}

#[test]
fn shard_heartbeat_sweeps_and_finalizes() {
    let slice = DbSlice::builder(0).build();
    let mut shard = ShardContext::new(slice, Heartbeat::default(), usize::MAX);

    for i in 0..30 {
        let key = format!("h{}", i);
        set(shard.slice_mut(), 0, key.as_bytes(), b"v", 10);
    }
    shard.slice_mut().flush_db(0);

    let stats = shard.heartbeat(1000);
    assert_eq!(stats.tables_finalized, 1);
    assert_eq!(stats.evicted, 0);
}

#[test]
fn find_first_returns_first_present_key() {
    let mut slice = DbSlice::builder(0).build();
    set(&mut slice, 0, b"second", b"v", 0);

    let keys: &[&[u8]] = &[b"first", b"second", b"third"];
    let (_, index) = slice.find_first_read_only(ctx(0), keys, None).unwrap();
    assert_eq!(index, 1);
    assert_eq!(slice.events().hits, 1);
    assert_eq!(slice.events().misses, 1);

    let missing: &[&[u8]] = &[b"nope"];
    assert_eq!(
        slice.find_first_read_only(ctx(0), missing, None).unwrap_err(),
        OpStatus::KeyNotFound
    );
}

#[test]
fn wrong_type_is_reported() {
    let mut slice = DbSlice::builder(0).build();
    set(&mut slice, 0, b"text", b"v", 0);

    let err = slice
        .find_read_only(ctx(0), b"text", Some(ObjType::Hash))
        .unwrap_err();
    assert_eq!(err, OpStatus::WrongType);
}

#[test]
#[should_panic(expected = "add_new on a key that already exists")]
fn add_new_on_existing_key_is_fatal() {
    let mut slice = DbSlice::builder(0).build();
    set(&mut slice, 0, b"dup", b"v", 0);
    let _ = slice.add_new(ctx(0), b"dup", Value::string(b"w"), 0);
}

#[test]
#[should_panic(expected = "post-update guard dropped")]
fn leaked_post_update_guard_is_fatal() {
    let mut slice = DbSlice::builder(0).build();
    set(&mut slice, 0, b"guarded", b"v", 0);
    let found = slice.find_mutable(ctx(0), b"guarded", None).unwrap();
    drop(found);
}
