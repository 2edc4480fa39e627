// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// A stable traversal token.
///
/// Traversal is bucket-major: bucket `b` of every segment is visited before
/// bucket `b + 1` of any segment. Because an entry's bucket index is derived
/// from hash bits that never change, a segment split moves entries sideways
/// within the same bucket index, never behind the cursor. The directory index
/// is recorded together with the directory depth at the time it was taken, so
/// a cursor survives directory doubling: the index is shifted up to the
/// current depth before use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    depth: u32,
    dir_idx: u32,
    bucket: u32,
}

impl Cursor {
    pub(crate) fn new(depth: u32, dir_idx: u32, bucket: u32) -> Self {
        Self {
            depth,
            dir_idx,
            bucket,
        }
    }

    #[inline]
    pub(crate) fn bucket(&self) -> u32 {
        self.bucket
    }

    /// Directory index rescaled to `depth`. Depths only grow, so a stored
    /// index is shifted up by the depth difference.
    #[inline]
    pub(crate) fn dir_index_at(&self, depth: u32) -> u32 {
        debug_assert!(depth >= self.depth);
        self.dir_idx << (depth - self.depth)
    }
}
