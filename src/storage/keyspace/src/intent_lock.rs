// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Two-mode per-key intent locks held for the duration of a transaction.

use std::collections::HashMap;

use crate::DbIndex;

/// Lock compatibility: SHARED coexists with SHARED; EXCLUSIVE with nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum LockMode {
    Shared = 0,
    Exclusive = 1,
}

impl LockMode {
    pub fn name(&self) -> &'static str {
        match self {
            LockMode::Shared => "S",
            LockMode::Exclusive => "X",
        }
    }
}

/// Counted lock holders per mode. A failed acquire records nothing, so a
/// caller that was refused has nothing to release.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntentLock {
    cnt: [u32; 2],
}

impl IntentLock {
    /// Would an acquire in `mode` be compatible with the current holders?
    pub fn check(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.cnt[LockMode::Exclusive as usize] == 0,
            LockMode::Exclusive => self.cnt == [0, 0],
        }
    }

    /// Acquire if compatible; returns whether the lock was taken.
    pub fn acquire(&mut self, mode: LockMode) -> bool {
        if !self.check(mode) {
            return false;
        }
        self.cnt[mode as usize] += 1;
        true
    }

    pub fn release(&mut self, mode: LockMode) {
        let cnt = &mut self.cnt[mode as usize];
        assert!(*cnt > 0, "release of a lock that is not held");
        *cnt -= 1;
    }

    /// Free locks are removed from the lock table.
    pub fn is_free(&self) -> bool {
        self.cnt == [0, 0]
    }
}

/// Shard-local lock table. Keys are owned copies so a lock can outlive the
/// transaction's argument buffers.
pub type LockTable = HashMap<Box<[u8]>, IntentLock, ahash::RandomState>;

/// Arguments of a multi-key acquire or release.
#[derive(Clone, Copy)]
pub struct KeyLockArgs<'a> {
    pub db_index: DbIndex,
    /// Flat argument list; every `key_step`-th element is a key.
    pub keys: &'a [&'a [u8]],
    pub key_step: usize,
    /// Present for call-site fidelity with multi-phase transactions; the
    /// table stores owned keys either way.
    pub should_persist: bool,
}

impl<'a> KeyLockArgs<'a> {
    pub fn new(db_index: DbIndex, keys: &'a [&'a [u8]]) -> KeyLockArgs<'a> {
        KeyLockArgs {
            db_index,
            keys,
            key_step: 1,
            should_persist: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_stacks_exclusive_conflicts() {
        let mut lock = IntentLock::default();
        assert!(lock.acquire(LockMode::Shared));
        assert!(lock.acquire(LockMode::Shared));
        assert!(!lock.acquire(LockMode::Exclusive));

        lock.release(LockMode::Shared);
        assert!(!lock.acquire(LockMode::Exclusive));
        lock.release(LockMode::Shared);
        assert!(lock.acquire(LockMode::Exclusive));
        assert!(!lock.acquire(LockMode::Shared));
    }

    #[test]
    fn failed_acquire_records_nothing() {
        let mut lock = IntentLock::default();
        assert!(lock.acquire(LockMode::Exclusive));
        assert!(!lock.acquire(LockMode::Exclusive));
        lock.release(LockMode::Exclusive);
        assert!(lock.is_free());
        assert!(lock.acquire(LockMode::Exclusive));
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn unbalanced_release_is_fatal() {
        let mut lock = IntentLock::default();
        lock.release(LockMode::Shared);
    }
}
