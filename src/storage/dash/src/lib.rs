// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A segmented, bucketed hash table with incremental growth.
//!
//! The [`DashTable`] is a directory of fixed-shape segments. Each segment
//! holds a run of regular buckets followed by a smaller run of stash buckets,
//! and every bucket has a fixed number of entry slots:
//!
//! ```text
//!            directory (top hash bits)
//!    ┌───────┬───────┬───────┬───────┐
//!    │ seg 0 │ seg 0 │ seg 1 │ seg 2 │        local depths 1, 2, 2
//!    └───┬───┴───┬───┴───┬───┴───┬───┘
//!        └───────┘       │       │
//!    ┌───────────────────▼─────────────────┐
//!    │ regular buckets ... │ stash buckets │   one segment
//!    │ [slot|slot|..|slot] │ [slot|..|slot]│
//!    └─────────────────────────────────────┘
//! ```
//!
//! An entry's home bucket is derived from the low hash bits and never changes;
//! the segment owning it is derived from the top hash bits and changes only
//! when a segment splits. When a key's home bucket and its probe neighbor are
//! full, the entry is displaced into a stash bucket. When a whole segment
//! cannot take an insert, the table consults an [`InsertPolicy`]: grow the
//! directory by splitting the segment, or free slots by garbage collection or
//! eviction of the insert hotspot.
//!
//! Growth is incremental. A split rehashes one segment into two and at most
//! doubles the directory; no global rehash ever happens. Traversal with a
//! [`Cursor`] is bucket-major and remains stable while the table grows or
//! shrinks underneath it: an entry present for the whole traversal is visited
//! exactly once, entries inserted or erased mid-way may or may not be seen.
//!
//! Entry positions are exposed as [`EntryRef`] tokens, validated lazily by the
//! accessors. A ref is invalidated by table growth and by erasure; it stays
//! valid across value mutation in place.

mod cursor;
mod policy;
mod segment;
mod table;

pub use cursor::Cursor;
pub use policy::{BumpPolicy, Hotspot, InsertPolicy, NeverGrow, UnboundedGrowth};
pub use table::{BucketRef, DashError, DashTable, EntryRef};

pub(crate) use segment::Segment;

/// Shape of every segment in one table: bucket counts and the per-bucket slot
/// width. Captured at construction so the prime and expire tables can size
/// their segments independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    regular_buckets: u32,
    stash_buckets: u32,
    slots: u32,
}

impl Layout {
    /// The default shape: sized so that a segment of two pointer-wide entries
    /// lands on an allocator-friendly size class.
    pub const DEFAULT: Layout = Layout {
        regular_buckets: 56,
        stash_buckets: 4,
        slots: 14,
    };

    pub fn new(regular_buckets: u32, stash_buckets: u32, slots: u32) -> Self {
        assert!(regular_buckets >= 2, "need at least two regular buckets");
        assert!(stash_buckets >= 1, "need at least one stash bucket");
        assert!(slots >= 1, "need at least one slot per bucket");
        Self {
            regular_buckets,
            stash_buckets,
            slots,
        }
    }

    #[inline]
    pub fn regular_buckets(&self) -> u32 {
        self.regular_buckets
    }

    #[inline]
    pub fn stash_buckets(&self) -> u32 {
        self.stash_buckets
    }

    #[inline]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    #[inline]
    pub fn total_buckets(&self) -> u32 {
        self.regular_buckets + self.stash_buckets
    }

    #[inline]
    pub fn segment_capacity(&self) -> usize {
        self.total_buckets() as usize * self.slots as usize
    }

    #[inline]
    pub fn is_stash(&self, bucket: u32) -> bool {
        bucket >= self.regular_buckets
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Keys stored in a [`DashTable`]. The table hashes and compares the byte view
/// so that lookups can be performed with a plain byte slice, without
/// materializing a key object.
pub trait TableKey {
    fn key_bytes(&self) -> &[u8];
}

impl TableKey for Box<[u8]> {
    fn key_bytes(&self) -> &[u8] {
        self
    }
}

impl TableKey for Vec<u8> {
    fn key_bytes(&self) -> &[u8] {
        self
    }
}
