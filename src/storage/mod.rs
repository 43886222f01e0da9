//! On-disk tier of the cache.
//!
//! - **Store**: single-bucket SQLite file holding encoded blocks by key
//! - **Key**: fixed-width big-endian key encoding
//! - **Compaction**: recreate the file once the cache has drained

pub mod compaction;
pub mod key;
pub mod store;

pub use key::{decode_key, encode_key, KEY_SIZE};
pub use store::{BlockStore, StoreOptions, BUCKET, DEFAULT_MMAP_SIZE, DEFAULT_OPEN_TIMEOUT};
