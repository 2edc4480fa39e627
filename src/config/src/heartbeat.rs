// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const ENABLE_HEARTBEAT_EVICTION: bool = true;
const MAX_EVICTION_PER_HEARTBEAT: u32 = 100;
const MAX_SEGMENT_TO_CONSIDER: u32 = 4;
const EVICTION_MEMORY_RATIO: f64 = 0.9;

// helper functions
fn enable_heartbeat_eviction() -> bool {
    ENABLE_HEARTBEAT_EVICTION
}

fn max_eviction_per_heartbeat() -> u32 {
    MAX_EVICTION_PER_HEARTBEAT
}

fn max_segment_to_consider() -> u32 {
    MAX_SEGMENT_TO_CONSIDER
}

fn eviction_memory_ratio() -> f64 {
    EVICTION_MEMORY_RATIO
}

// struct definitions
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Heartbeat {
    #[serde(default = "enable_heartbeat_eviction")]
    enable_heartbeat_eviction: bool,
    #[serde(default = "max_eviction_per_heartbeat")]
    max_eviction_per_heartbeat: u32,
    #[serde(default = "max_segment_to_consider")]
    max_segment_to_consider: u32,
    #[serde(default = "eviction_memory_ratio")]
    eviction_memory_ratio: f64,
}

// implementation
impl Heartbeat {
    /// Whether the heartbeat may evict under memory pressure at all.
    pub fn enable_heartbeat_eviction(&self) -> bool {
        self.enable_heartbeat_eviction
    }

    /// Upper bound on keys deleted by a single heartbeat eviction pass.
    pub fn max_eviction_per_heartbeat(&self) -> u32 {
        self.max_eviction_per_heartbeat
    }

    /// Upper bound on table segments scanned per (slot, bucket) position in a
    /// single eviction pass.
    pub fn max_segment_to_consider(&self) -> u32 {
        self.max_segment_to_consider
    }

    /// Fraction of the shard memory limit above which the heartbeat starts
    /// evicting.
    pub fn eviction_memory_ratio(&self) -> f64 {
        self.eviction_memory_ratio
    }
}

// trait implementations
impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            enable_heartbeat_eviction: enable_heartbeat_eviction(),
            max_eviction_per_heartbeat: max_eviction_per_heartbeat(),
            max_segment_to_consider: max_segment_to_consider(),
            eviction_memory_ratio: eviction_memory_ratio(),
        }
    }
}

// trait definitions
pub trait HeartbeatConfig {
    fn heartbeat(&self) -> &Heartbeat;
}
