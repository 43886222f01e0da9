//! Error types for the ingest cache.
//!
//! Three layers, leaf-first:
//! - [`CodecError`]: encoding/decoding of entry blocks
//! - [`StoreError`]: the on-disk block store
//! - [`CacheError`]: the spill cache and its lifecycle
//!
//! Every failure the caller may want to react to has its own variant, so an
//! ingester can tell "another copy is already running" (`StoreError::Locked`)
//! apart from "disk is failing" (`StoreError::Io`/`StoreError::Sqlite`).

use std::io;
use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Result type for block store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Entry block codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Buffer ended in the middle of a record
    #[error("Truncated block at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        /// Offset of the record that could not be read
        offset: usize,
        /// Bytes required to finish the record
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Record body could not be decoded into an entry
    #[error("Malformed entry at offset {offset}: {source}")]
    Malformed {
        /// Offset of the record body
        offset: usize,
        /// Underlying deserialization error
        #[source]
        source: bincode::Error,
    },

    /// Entry could not be serialized
    #[error("Entry encoding failed: {0}")]
    Encode(#[source] bincode::Error),

    /// Entry body exceeds the 4 GiB record limit
    #[error("Entry of {0} bytes exceeds record length limit")]
    RecordTooLarge(usize),
}

/// Block store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store file is locked by another process (or another handle)
    #[error("Store {path:?} is locked by another process")]
    Locked {
        /// Path of the locked store file
        path: PathBuf,
    },

    /// Bucket table disappeared after initialization
    #[error("Bucket '{0}' missing from store")]
    BucketMissing(&'static str),

    /// Key bytes are not a fixed-width encoded grouping key
    #[error("Invalid key length: expected 8 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Store handle has already been released
    #[error("Store is closed")]
    Closed,

    /// Filesystem operation failed
    #[error("Store I/O error ({context}): {source}")]
    Io {
        /// The I/O error
        #[source]
        source: io::Error,
        /// Operation that failed
        context: String,
    },

    /// SQLite engine error
    #[error("SQLite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    /// Stored value could not be encoded or decoded
    #[error("Block codec error: {0}")]
    Codec(#[from] CodecError),
}

impl StoreError {
    /// Build an I/O error with context
    pub fn io(source: io::Error, context: impl Into<String>) -> Self {
        StoreError::Io {
            source,
            context: context.into(),
        }
    }

    /// Returns true if the error means the file is held by someone else
    pub fn is_locked(&self) -> bool {
        matches!(self, StoreError::Locked { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(_, Some(message))
                if message.starts_with("no such table") =>
            {
                StoreError::BucketMissing(crate::storage::BUCKET)
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Returns true if a SQLite error is lock contention
pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Spill cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// `start` called while the background routine is alive
    #[error("Cache is already running")]
    AlreadyRunning,

    /// `stop` called without a background routine
    #[error("Cache is not running")]
    NotRunning,

    /// `sync`, `pop_block` or `close` called while running
    #[error("Operation not permitted while the cache is running")]
    Running,

    /// Operation on a cache that has been closed
    #[error("Cache is closed")]
    Closed,

    /// File-backed operation without a usable store
    #[error("No active database")]
    NoActiveStore,

    /// Hot blocks remain and there is nowhere to flush them
    #[error("{blocks} hot blocks remain and no store is available to receive them")]
    UnflushedHotBlocks {
        /// Number of hot blocks that would be lost
        blocks: usize,
    },

    /// Store recreation after a full drain failed
    #[error("Compaction failed: {0}")]
    Compaction(#[source] StoreError),

    /// Background thread could not be spawned
    #[error("Failed to spawn background routine: {0}")]
    Spawn(#[source] io::Error),

    /// Background runtime could not be built
    #[error("Failed to build background runtime: {0}")]
    Runtime(#[source] io::Error),

    /// Background routine panicked
    #[error("Background routine panicked")]
    WorkerPanicked,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Block store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Block codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl CacheError {
    /// Returns true if the error is a store lock held by another process
    pub fn is_locked(&self) -> bool {
        matches!(self, CacheError::Store(e) if e.is_locked())
    }
}
