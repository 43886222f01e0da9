//! # Ingest Cache
//!
//! Bounded in-memory write buffer for telemetry entries that spills grouped
//! blocks to an embedded on-disk store and hands them back, oldest first,
//! once the downstream link returns.
//!
//! ## Architecture
//!
//! ```text
//!   producers ──entries / batches──> SpillCache routine ──> hot blocks
//!                                                            │ trim
//!                                                            v
//!   consumer <──pop_block (disk block + hot fragment)── BlockStore (SQLite)
//! ```
//!
//! - [`block`]: entries, entry blocks and their append-friendly encoding
//! - [`storage`]: single-bucket block store and compaction
//! - [`cache`]: the spill cache and its background routine
//! - [`config`]: cache configuration
//! - [`error`]: error types

pub mod block;
pub mod cache;
pub mod config;
pub mod error;
pub mod storage;

pub use block::{Entry, EntryBlock, Timestamp};
pub use cache::{CacheStats, SpillCache};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult, CodecError, StoreError, StoreResult};
pub use storage::BlockStore;
