// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const REGULAR_BUCKETS: u32 = 56;
const STASH_BUCKETS: u32 = 4;
const SLOTS: u32 = 14;
const EXPIRE_REGULAR_BUCKETS: u32 = 56;
const EXPIRE_STASH_BUCKETS: u32 = 4;
const EXPIRE_SLOTS: u32 = 10;

// helper functions
fn regular_buckets() -> u32 {
    REGULAR_BUCKETS
}

fn stash_buckets() -> u32 {
    STASH_BUCKETS
}

fn slots() -> u32 {
    SLOTS
}

fn expire_regular_buckets() -> u32 {
    EXPIRE_REGULAR_BUCKETS
}

fn expire_stash_buckets() -> u32 {
    EXPIRE_STASH_BUCKETS
}

fn expire_slots() -> u32 {
    EXPIRE_SLOTS
}

// struct definitions
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Table {
    #[serde(default = "regular_buckets")]
    regular_buckets: u32,
    #[serde(default = "stash_buckets")]
    stash_buckets: u32,
    #[serde(default = "slots")]
    slots: u32,
    #[serde(default = "expire_regular_buckets")]
    expire_regular_buckets: u32,
    #[serde(default = "expire_stash_buckets")]
    expire_stash_buckets: u32,
    #[serde(default = "expire_slots")]
    expire_slots: u32,
}

// implementation
impl Table {
    /// Regular buckets per prime-table segment.
    pub fn regular_buckets(&self) -> u32 {
        self.regular_buckets
    }

    /// Stash (overflow) buckets per prime-table segment.
    pub fn stash_buckets(&self) -> u32 {
        self.stash_buckets
    }

    /// Entry slots per prime-table bucket.
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Regular buckets per expire-table segment. The expire table carries a
    /// narrower payload, so its segments are shaped separately to stay on a
    /// friendly allocation size class.
    pub fn expire_regular_buckets(&self) -> u32 {
        self.expire_regular_buckets
    }

    /// Stash buckets per expire-table segment.
    pub fn expire_stash_buckets(&self) -> u32 {
        self.expire_stash_buckets
    }

    /// Entry slots per expire-table bucket.
    pub fn expire_slots(&self) -> u32 {
        self.expire_slots
    }
}

// trait implementations
impl Default for Table {
    fn default() -> Self {
        Self {
            regular_buckets: regular_buckets(),
            stash_buckets: stash_buckets(),
            slots: slots(),
            expire_regular_buckets: expire_regular_buckets(),
            expire_stash_buckets: expire_stash_buckets(),
            expire_slots: expire_slots(),
        }
    }
}

// trait definitions
pub trait TableConfig {
    fn table(&self) -> &Table;
}
