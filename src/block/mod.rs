//! Entries and entry blocks.
//!
//! An [`EntryBlock`] groups entries sharing one grouping key and knows how to
//! encode itself into an append-friendly byte buffer.

pub mod entry;
pub mod entry_block;

pub use entry::{Entry, Timestamp, ENTRY_HEADER_SIZE};
pub use entry_block::EntryBlock;
