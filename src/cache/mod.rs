//! Dual-tier ingest cache.
//!
//! - **Hot tier**: one [`EntryBlock`](crate::block::EntryBlock) per grouping
//!   key in memory, bounded by `memory_cache_size`
//! - **Cold tier**: blocks spilled to the [`BlockStore`](crate::storage::BlockStore)
//!   once the hot tier reaches its ceiling, smallest key first
//!
//! Entries arrive over channels consumed by a background routine. Blocks
//! leave through [`SpillCache::pop_block`] in ascending key order, each disk
//! block merged with whatever is still hot for its key.

mod hot;
mod state;
mod worker;

pub mod spill_cache;

pub use spill_cache::SpillCache;
pub use worker::WORKER_THREAD_NAME;

use serde::Serialize;

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Blocks held in memory
    pub hot_blocks: usize,
    /// Distinct keys on disk
    pub stored_blocks: usize,
    /// Entries held across both tiers
    pub entries: u64,
    /// Bytes held in memory
    pub memory_usage: u64,
    /// Ceiling that triggers a trim
    pub max_memory: u64,
    /// Whether the background routine is running
    pub running: bool,
    /// Whether the cache has a store
    pub file_backed: bool,
}

impl CacheStats {
    /// Fraction of the memory ceiling in use (can exceed 1.0 for
    /// memory-only caches).
    pub fn memory_utilization(&self) -> f64 {
        if self.max_memory == 0 {
            return 0.0;
        }
        self.memory_usage as f64 / self.max_memory as f64
    }
}
