//! Shared fixtures for partition tests.

use std::path::Path;
use std::sync::Arc;

use crate::JoinStats;
use crate::hash::partition_index;
use crate::memory::{HeapPagePool, MemoryBudget};
use crate::partition::Workspace;
use crate::spill::{SpillCodec, SpillDirectory, SpillOptions};

pub(crate) const PAGE_SIZE: usize = 1024;

/// A workspace over a fresh pool of `pool_capacity` pages with a budget
/// of `budget` pages, spilling under `dir`.
pub(crate) fn workspace(
    dir: &Path,
    budget: usize,
    pool_capacity: usize,
) -> (Workspace, Arc<HeapPagePool>) {
    let pool = Arc::new(HeapPagePool::new(PAGE_SIZE, pool_capacity));
    let ws = Workspace {
        memory: MemoryBudget::new(pool.clone(), budget),
        spill_dir: SpillDirectory::new(dir),
        spill_options: SpillOptions {
            codec: SpillCodec::None,
            block_size: 4 * PAGE_SIZE,
            async_io: false,
        },
        bloom_filter: false,
        stats: JoinStats::default(),
    };
    (ws, pool)
}

/// The `n`-th smallest non-negative key routed to `partition`.
pub(crate) fn key_for(partition: usize, level: u32, fanout: usize, n: usize) -> i64 {
    (0i64..)
        .filter(|&k| partition_index(k, level, fanout) == partition)
        .nth(n)
        .unwrap()
}

/// A 44-byte row: `[tag: u32 LE][40 filler bytes]`, 64 bytes with header.
pub(crate) fn row(tag: u32) -> Vec<u8> {
    let mut row = tag.to_le_bytes().to_vec();
    row.resize(44, (tag % 251) as u8);
    row
}
