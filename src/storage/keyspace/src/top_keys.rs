// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Approximate hot-key tracking.
//!
//! A fixed array of cells, each holding a key fingerprint and a count. A
//! touch that hits its cell's resident key increments the count; a touch that
//! collides decays the resident count and takes over the cell once it reaches
//! zero. Small, constant-time, and good enough to surface the handful of keys
//! that dominate a workload.

use core::hash::{BuildHasher, Hasher};

use ahash::RandomState;

struct Cell {
    fingerprint: u64,
    count: u32,
    key: Option<Box<[u8]>>,
}

pub struct TopKeys {
    hash_builder: RandomState,
    cells: Vec<Cell>,
    min_report_count: u32,
}

impl TopKeys {
    /// `buckets == 0` disables tracking; every touch becomes a no-op.
    pub fn new(buckets: usize, min_report_count: u32) -> Self {
        let hash_builder =
            RandomState::with_seeds(0x6c62272e07bb0142, 0x62b821756295c58d, 0x2f52, 0x9e3779b9);
        let mut cells = Vec::with_capacity(buckets);
        cells.resize_with(buckets, || Cell {
            fingerprint: 0,
            count: 0,
            key: None,
        });
        Self {
            hash_builder,
            cells,
            min_report_count,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.cells.is_empty()
    }

    pub fn touch(&mut self, key: &[u8]) {
        if self.cells.is_empty() {
            return;
        }
        let mut hasher = self.hash_builder.build_hasher();
        hasher.write(key);
        let fingerprint = hasher.finish();
        let idx = (fingerprint % self.cells.len() as u64) as usize;
        let cell = &mut self.cells[idx];

        if cell.count == 0 {
            cell.fingerprint = fingerprint;
            cell.count = 1;
            cell.key = Some(key.into());
        } else if cell.fingerprint == fingerprint {
            cell.count += 1;
        } else {
            // collision: decay the resident; it is replaced once cold
            cell.count -= 1;
            if cell.count == 0 {
                cell.key = None;
            }
        }
    }

    /// Keys whose count reached the report threshold, hottest first.
    pub fn report(&self) -> Vec<(Box<[u8]>, u32)> {
        let mut out: Vec<_> = self
            .cells
            .iter()
            .filter(|c| c.count >= self.min_report_count)
            .filter_map(|c| c.key.as_ref().map(|k| (k.clone(), c.count)))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracker_ignores_touches() {
        let mut top = TopKeys::new(0, 1);
        assert!(!top.is_enabled());
        top.touch(b"latte");
        assert!(top.report().is_empty());
    }

    #[test]
    fn hot_key_outranks_cold_one() {
        let mut top = TopKeys::new(64, 1);
        for _ in 0..50 {
            top.touch(b"hot");
        }
        top.touch(b"cold");
        let report = top.report();
        let hot = report.iter().position(|(k, _)| &**k == b"hot");
        let cold = report.iter().position(|(k, _)| &**k == b"cold");
        let hot = hot.expect("hot key not reported");
        if let Some(cold) = cold {
            assert!(hot <= cold);
        }
    }

    #[test]
    fn threshold_filters_noise() {
        let mut top = TopKeys::new(64, 10);
        for _ in 0..20 {
            top.touch(b"frequent");
        }
        top.touch(b"rare");
        let report = top.report();
        assert!(report.iter().any(|(k, _)| &**k == b"frequent"));
        assert!(!report.iter().any(|(k, _)| &**k == b"rare"));
    }
}
