// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const DATABASES: usize = 16;
const CACHE_MODE: bool = false;
const MEMORY_BUDGET: usize = usize::MAX;
const SOFT_MEMORY_RATIO: f64 = 0.3;

// helper functions
fn databases() -> usize {
    DATABASES
}

fn cache_mode() -> bool {
    CACHE_MODE
}

fn memory_budget() -> usize {
    MEMORY_BUDGET
}

fn soft_memory_ratio() -> f64 {
    SOFT_MEMORY_RATIO
}

// struct definitions
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Keyspace {
    #[serde(default = "databases")]
    databases: usize,
    #[serde(default = "cache_mode")]
    cache_mode: bool,
    #[serde(default = "memory_budget")]
    memory_budget: usize,
    #[serde(default = "soft_memory_ratio")]
    soft_memory_ratio: f64,
}

// implementation
impl Keyspace {
    /// Maximum number of SELECT-able databases per shard.
    pub fn databases(&self) -> usize {
        self.databases
    }

    /// Whether the shard may evict cold entries to stay within its budget.
    pub fn cache_mode(&self) -> bool {
        self.cache_mode
    }

    /// This shard's share of the global memory limit, in bytes.
    pub fn memory_budget(&self) -> usize {
        self.memory_budget
    }

    /// Fraction of the budget kept as the soft limit below which table growth
    /// is always allowed.
    pub fn soft_memory_ratio(&self) -> f64 {
        self.soft_memory_ratio
    }
}

// trait implementations
impl Default for Keyspace {
    fn default() -> Self {
        Self {
            databases: databases(),
            cache_mode: cache_mode(),
            memory_budget: memory_budget(),
            soft_memory_ratio: soft_memory_ratio(),
        }
    }
}

// trait definitions
pub trait KeyspaceConfig {
    fn keyspace(&self) -> &Keyspace;
}
