//! Mutable cache state shared by the background routine and the idle-time
//! operations (`sync`, `pop_block`, `close`).
//!
//! The lifecycle rules in `SpillCache` guarantee that the routine and the
//! idle-time operations never run at the same time; the mutex around this
//! state only serializes them against the read-only accessors.

use log::{debug, error, info, warn};

use super::hot::HotBlocks;
use super::CacheStats;
use crate::block::{Entry, EntryBlock};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult, StoreResult};
use crate::storage::{decode_key, BlockStore};

pub(crate) struct CacheState {
    /// In-memory blocks
    hot: HotBlocks,
    /// On-disk tier; `None` for memory-only caches, after close, or after a
    /// failed compaction
    store: Option<BlockStore>,
    /// Whether the cache was configured with a store
    file_backed: bool,
    /// Set once `close` has released everything
    closed: bool,
    /// Hot bytes that trigger a trim
    max_cache_size: u64,
    /// Distinct keys on disk
    stored_block_count: usize,
    /// Entries held across both tiers
    total_entry_count: u64,
}

impl CacheState {
    /// Open the store (if configured) and recover counters from it.
    pub(crate) fn open(config: &CacheConfig) -> CacheResult<Self> {
        let store = match config.backing_path() {
            Some(path) => Some(BlockStore::open(path, config.store_options())?),
            None => None,
        };

        let mut state = Self {
            hot: HotBlocks::new(),
            file_backed: store.is_some(),
            store,
            closed: false,
            max_cache_size: config.memory_cache_size,
            stored_block_count: 0,
            total_entry_count: 0,
        };
        state.recover()?;
        Ok(state)
    }

    /// Scan the store once, counting well-formed blocks and deleting
    /// anything that does not decode.
    fn recover(&mut self) -> CacheResult<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };

        let mut blocks = 0usize;
        let mut entries = 0u64;
        let mut corrupt: Vec<Vec<u8>> = Vec::new();

        store.for_each(|raw_key, value| {
            match check_record(raw_key, value) {
                Ok(count) => {
                    blocks += 1;
                    entries += count as u64;
                }
                Err(reason) => {
                    warn!("Dropping corrupt cache record {:02x?}: {}", raw_key, reason);
                    corrupt.push(raw_key.to_vec());
                }
            }
            Ok(())
        })?;

        for raw_key in &corrupt {
            store.delete_raw(raw_key)?;
        }

        self.stored_block_count = blocks;
        self.total_entry_count = entries;

        info!(
            "Recovered {} stored blocks ({} entries) from {:?}, dropped {} corrupt",
            blocks,
            entries,
            store.path(),
            corrupt.len()
        );
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    // ============================================================================================
    // INGEST
    // ============================================================================================

    /// Add one entry; returns true once hot bytes reach the ceiling.
    pub(crate) fn add_entry(&mut self, entry: Entry) -> bool {
        self.hot.add(entry);
        self.total_entry_count += 1;
        self.hot.size() >= self.max_cache_size
    }

    /// Add entries, trimming to disk whenever the ceiling is reached.
    ///
    /// Every entry is admitted even if a trim fails; the first trim error is
    /// returned once the whole batch is in memory.
    pub(crate) fn ingest<I>(&mut self, entries: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = Entry>,
    {
        let mut failure = None;
        for entry in entries {
            if self.add_entry(entry) && failure.is_none() {
                if let Err(e) = self.trim() {
                    failure = Some(e);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Spill blocks until hot bytes drop under the ceiling. No-op without a
    /// store.
    fn trim(&mut self) -> CacheResult<()> {
        if self.store.is_none() {
            return Ok(());
        }

        let (blocks_before, bytes_before) = (self.hot.len(), self.hot.size());
        while self.hot.size() >= self.max_cache_size {
            if !self.evict_one()? {
                break;
            }
        }

        debug!(
            "Trimmed {} hot blocks ({} -> {} bytes, ceiling {})",
            blocks_before - self.hot.len(),
            bytes_before,
            self.hot.size(),
            self.max_cache_size
        );
        Ok(())
    }

    /// Append the next eviction candidate to the store, then drop it.
    fn evict_one(&mut self) -> CacheResult<bool> {
        let Self {
            hot,
            store,
            stored_block_count,
            ..
        } = self;
        let store = store.as_mut().ok_or(CacheError::NoActiveStore)?;

        let mut created = false;
        let evicted = hot.evict_with(|key, block| -> StoreResult<()> {
            created = store.append_block(key, block)?;
            Ok(())
        })?;

        if created {
            *stored_block_count += 1;
        }
        Ok(evicted)
    }

    // ============================================================================================
    // IDLE-TIME OPERATIONS
    // ============================================================================================

    /// Write every hot block to the store, ignoring the ceiling.
    pub(crate) fn flush_all(&mut self) -> CacheResult<()> {
        self.ensure_open()?;
        if self.hot.is_empty() {
            return Ok(());
        }
        if self.store.is_none() {
            return Err(CacheError::NoActiveStore);
        }

        let blocks = self.hot.len();
        while self.evict_one()? {}

        debug!("Flushed {} hot blocks to disk", blocks);
        Ok(())
    }

    /// Remove and return the oldest block across both tiers.
    ///
    /// A block popped from disk is merged with the hot block for the same
    /// key, if any; the hot block stays in memory. `Ok(None)` means both
    /// tiers are empty, at which point the store is compacted.
    pub(crate) fn pop_block(&mut self) -> CacheResult<Option<EntryBlock>> {
        self.ensure_open()?;

        if self.file_backed {
            let store = self.store.as_mut().ok_or(CacheError::NoActiveStore)?;

            while let Some((key, bytes)) = store.pop_first()? {
                self.stored_block_count = self.stored_block_count.saturating_sub(1);

                let mut block = match EntryBlock::decode(&bytes) {
                    Ok(block) if !block.is_empty() => block,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Dropping undecodable block for key {:#x}: {}", key, e);
                        continue;
                    }
                };
                self.total_entry_count = self.total_entry_count.saturating_sub(block.len() as u64);

                if let Some(hot) = self.hot.get(key) {
                    debug!(
                        "Merging {} hot entries into popped block {:#x}",
                        hot.len(),
                        key
                    );
                    block.merge(hot);
                }
                return Ok(Some(block));
            }
        }

        if let Some(block) = self.hot.take_any() {
            self.total_entry_count = self.total_entry_count.saturating_sub(block.len() as u64);
            return Ok(Some(block));
        }

        if self.file_backed {
            self.compact()?;
        }
        Ok(None)
    }

    /// Recreate the store file. A failure leaves the cache without a store.
    fn compact(&mut self) -> CacheResult<()> {
        let Some(store) = self.store.as_mut() else {
            return Err(CacheError::NoActiveStore);
        };

        if let Err(e) = store.compact() {
            error!("Compaction of {:?} failed, releasing store: {}", store.path(), e);
            self.store = None;
            return Err(CacheError::Compaction(e));
        }

        self.stored_block_count = 0;
        Ok(())
    }

    /// Flush everything and release the store.
    pub(crate) fn close(&mut self) -> CacheResult<()> {
        if self.closed {
            return Ok(());
        }
        if self.store.is_none() && !self.hot.is_empty() {
            return Err(CacheError::UnflushedHotBlocks {
                blocks: self.hot.len(),
            });
        }

        self.flush_all()?;
        if let Some(mut store) = self.store.take() {
            store.close()?;
        }
        self.closed = true;
        Ok(())
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub(crate) fn hot_block_count(&self) -> usize {
        self.hot.len()
    }

    pub(crate) fn stored_block_count(&self) -> usize {
        self.stored_block_count
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.total_entry_count
    }

    pub(crate) fn memory_usage(&self) -> u64 {
        self.hot.size()
    }

    /// Release the store handle while keeping the cache open, so the next
    /// store write fails.
    #[cfg(test)]
    pub(crate) fn close_store(&mut self) -> StoreResult<()> {
        match self.store.as_mut() {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            hot_blocks: self.hot.len(),
            stored_blocks: self.stored_block_count,
            entries: self.total_entry_count,
            memory_usage: self.hot.size(),
            max_memory: self.max_cache_size,
            running: false,
            file_backed: self.file_backed,
        }
    }
}

/// Validate one stored record, returning its entry count.
fn check_record(raw_key: &[u8], value: &[u8]) -> Result<usize, String> {
    let key = decode_key(raw_key).map_err(|e| e.to_string())?;
    let block = EntryBlock::decode(value).map_err(|e| e.to_string())?;

    if block.is_empty() {
        return Err("empty block".to_string());
    }
    if block.key() != key {
        return Err(format!(
            "entries carry key {:#x}, record key is {:#x}",
            block.key(),
            key
        ));
    }
    Ok(block.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Timestamp;
    use crate::error::StoreError;
    use crate::storage::StoreOptions;

    fn entry(key: u64, payload: usize) -> Entry {
        Entry::new(key, Timestamp::new(key as i64 * 60, 0), 1, vec![7u8; payload])
    }

    fn file_state(dir: &tempfile::TempDir, max: u64) -> CacheState {
        let config = CacheConfig::file_backed(dir.path().join("cache.db")).memory_cache_size(max);
        CacheState::open(&config).unwrap()
    }

    #[test]
    fn test_trim_converges_under_ceiling() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut state = file_state(&tmp_dir, 1_000);

        for i in 0..2_000u64 {
            state.ingest([entry(i % 13 + 1, 50)]).unwrap();
            assert!(state.memory_usage() < 1_000);
            assert_eq!(state.memory_usage(), state.hot.block_size_sum());
        }
        assert_eq!(state.entry_count(), 2_000);
        assert!(state.stored_block_count() <= 13);
    }

    #[test]
    fn test_failed_trim_keeps_block_in_memory() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut state = file_state(&tmp_dir, 100);
        state.close_store().unwrap();

        // 5 x 30 bytes, the 4th crosses the ceiling
        let result = state.ingest((0..5).map(|_| entry(7, 8)));
        assert!(matches!(
            result,
            Err(CacheError::Store(StoreError::Closed))
        ));

        // Every entry was admitted and nothing reached the store
        assert_eq!(state.hot_block_count(), 1);
        assert_eq!(state.memory_usage(), 150);
        assert_eq!(state.memory_usage(), state.hot.block_size_sum());
        assert_eq!(state.entry_count(), 5);
        assert_eq!(state.stored_block_count(), 0);
    }

    #[test]
    fn test_memory_only_never_trims() {
        let mut state = CacheState::open(&CacheConfig::memory_only().memory_cache_size(100)).unwrap();
        state.ingest((0..10).map(|_| entry(1, 100))).unwrap();
        assert_eq!(state.hot_block_count(), 1);
        assert_eq!(state.memory_usage(), 10 * 122);
        assert!(matches!(state.flush_all(), Err(CacheError::NoActiveStore)));
    }

    #[test]
    fn test_recover_drops_bad_key_and_mismatched_key() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("cache.db");
        {
            let mut store = BlockStore::open(&path, StoreOptions::default()).unwrap();
            let good: EntryBlock = (0..3).map(|_| entry(10, 4)).collect();
            store.append_block(10, &good).unwrap();

            // Entries for key 10 stored under key 11
            store.put(11, &good.encode().unwrap()).unwrap();
            // Key of the wrong width
            store.put_raw(&[1, 2, 3], &good.encode().unwrap()).unwrap();
            // Empty value
            store.put(12, &[]).unwrap();
            store.close().unwrap();
        }

        let state = CacheState::open(&CacheConfig::file_backed(&path)).unwrap();
        assert_eq!(state.stored_block_count(), 1);
        assert_eq!(state.entry_count(), 3);
        assert_eq!(state.store.as_ref().unwrap().len().unwrap(), 1);
    }

    #[test]
    fn test_pop_skips_undecodable_record() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut state = file_state(&tmp_dir, 1 << 20);
        state.ingest([entry(5, 1), entry(6, 1)]).unwrap();
        state.flush_all().unwrap();

        // Corrupt key 5 behind the cache's back
        state.store.as_ref().unwrap().put(5, &[9, 9]).unwrap();

        let block = state.pop_block().unwrap().unwrap();
        assert_eq!(block.key(), 6);
        assert!(state.pop_block().unwrap().is_none());
        assert_eq!(state.stored_block_count(), 0);
    }

    #[test]
    fn test_close_then_operations_fail() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut state = file_state(&tmp_dir, 1 << 20);
        state.ingest([entry(1, 1)]).unwrap();

        state.close().unwrap();
        assert!(state.is_closed());
        assert_eq!(state.hot_block_count(), 0);
        assert_eq!(state.stored_block_count(), 1);
        assert!(matches!(state.pop_block(), Err(CacheError::Closed)));
        assert!(matches!(state.flush_all(), Err(CacheError::Closed)));
        state.close().unwrap();
    }
}
