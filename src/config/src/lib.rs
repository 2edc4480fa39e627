// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Configuration blocks for the shard storage stack. Each block is a serde
//! struct with per-field defaults, so partial config files deserialize into
//! fully-populated settings.

mod heartbeat;
mod keyspace;
mod table;

pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use keyspace::{Keyspace, KeyspaceConfig};
pub use table::{Table, TableConfig};
