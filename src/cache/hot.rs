//! In-memory (hot) blocks.
//!
//! The block receiving the most recent entries is kept in its own slot, by
//! value, next to a key-ordered map of every other hot block. Consecutive
//! entries for the same key (the common case) touch only that slot. When
//! the key changes the current block is parked in the map and the new one is
//! taken out of it, so a key is never in both places.

use std::collections::BTreeMap;

use crate::block::{Entry, EntryBlock};

/// Location of an eviction candidate
enum Slot {
    Other(u64),
    Current,
}

#[derive(Debug, Default)]
pub(crate) struct HotBlocks {
    /// Block receiving the most recent entries
    current: Option<EntryBlock>,
    /// All other hot blocks, ordered by key
    others: BTreeMap<u64, EntryBlock>,
    /// Sum of the sizes of all hot blocks
    size: u64,
}

impl HotBlocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append an entry to the block for its key.
    pub(crate) fn add(&mut self, entry: Entry) {
        self.size += entry.size();
        if !matches!(&self.current, Some(block) if block.key() == entry.key) {
            self.switch_current(entry.key);
        }
        self.current.get_or_insert_with(EntryBlock::new).add(entry);
    }

    fn switch_current(&mut self, key: u64) {
        if let Some(prev) = self.current.take() {
            if !prev.is_empty() {
                self.others.insert(prev.key(), prev);
            }
        }
        self.current = self.others.remove(&key);
    }

    /// Number of hot blocks.
    pub(crate) fn len(&self) -> usize {
        self.others.len() + usize::from(self.current.is_some())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.current.is_none() && self.others.is_empty()
    }

    /// Total bytes held.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    #[cfg(test)]
    pub(crate) fn current_key(&self) -> Option<u64> {
        self.current.as_ref().map(EntryBlock::key)
    }

    pub(crate) fn get(&self, key: u64) -> Option<&EntryBlock> {
        match &self.current {
            Some(block) if block.key() == key => Some(block),
            _ => self.others.get(&key),
        }
    }

    /// Remove and return one block: the smallest non-current key if there
    /// is one, otherwise the current block.
    pub(crate) fn take_any(&mut self) -> Option<EntryBlock> {
        let block = match self.others.pop_first() {
            Some((_, block)) => block,
            None => self.current.take()?,
        };
        self.release(block.size());
        Some(block)
    }

    /// Hand the next eviction candidate to `write` and drop it from memory
    /// only if the write succeeds.
    ///
    /// Candidates are the non-current blocks in key order; the current block
    /// is only offered once it is the last one. Returns `Ok(false)` when
    /// nothing is hot.
    pub(crate) fn evict_with<E, F>(&mut self, write: F) -> Result<bool, E>
    where
        F: FnOnce(u64, &EntryBlock) -> Result<(), E>,
    {
        let (slot, key, block) = match self.others.first_key_value() {
            Some((&key, block)) => (Slot::Other(key), key, block),
            None => match &self.current {
                Some(block) => (Slot::Current, block.key(), block),
                None => return Ok(false),
            },
        };

        write(key, block)?;

        let removed = match slot {
            Slot::Other(key) => self.others.remove(&key),
            Slot::Current => self.current.take(),
        };
        if let Some(block) = removed {
            self.release(block.size());
        }
        Ok(true)
    }

    fn release(&mut self, bytes: u64) {
        self.size = self.size.saturating_sub(bytes);
        if self.is_empty() {
            debug_assert_eq!(self.size, 0, "hot size drifted");
            self.size = 0;
        }
    }

    /// Recompute the size from the blocks themselves.
    #[cfg(test)]
    pub(crate) fn block_size_sum(&self) -> u64 {
        self.current.iter().chain(self.others.values()).map(EntryBlock::size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Timestamp;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn entry(key: u64, len: usize) -> Entry {
        Entry::new(key, Timestamp::new(0, 0), 0, vec![0u8; len])
    }

    #[test]
    fn test_consecutive_keys_share_current() {
        let mut hot = HotBlocks::new();
        hot.add(entry(5, 1));
        hot.add(entry(5, 2));
        assert_eq!(hot.len(), 1);
        assert_eq!(hot.current_key(), Some(5));
        assert_eq!(hot.get(5).unwrap().len(), 2);
    }

    #[test]
    fn test_interleaved_keys_one_block_per_key() {
        let mut hot = HotBlocks::new();
        for key in [1, 2, 1, 3, 2, 1] {
            hot.add(entry(key, 0));
        }
        assert_eq!(hot.len(), 3);
        assert_eq!(hot.current_key(), Some(1));
        assert_eq!(hot.get(1).unwrap().len(), 3);
        assert_eq!(hot.get(2).unwrap().len(), 2);
        assert_eq!(hot.get(3).unwrap().len(), 1);
    }

    #[test]
    fn test_randomized_size_and_uniqueness() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut hot = HotBlocks::new();
        let mut seen = HashSet::new();

        for _ in 0..5_000 {
            let key = rng.gen_range(1..40u64);
            seen.insert(key);
            hot.add(entry(key, rng.gen_range(0..100)));

            if rng.gen_bool(0.05) {
                let _ = hot.take_any();
            }
            if rng.gen_bool(0.05) {
                let _ = hot.evict_with(|_, _| Ok::<(), ()>(()));
            }

            assert_eq!(hot.size(), hot.block_size_sum());
            assert!(hot.len() <= seen.len());
        }
    }

    #[test]
    fn test_take_any_prefers_non_current() {
        let mut hot = HotBlocks::new();
        hot.add(entry(9, 0));
        hot.add(entry(4, 0));
        hot.add(entry(7, 0));

        assert_eq!(hot.take_any().unwrap().key(), 4);
        assert_eq!(hot.take_any().unwrap().key(), 9);
        assert_eq!(hot.current_key(), Some(7));
        assert_eq!(hot.take_any().unwrap().key(), 7);
        assert_eq!(hot.current_key(), None);
        assert!(hot.take_any().is_none());
        assert_eq!(hot.size(), 0);
    }

    #[test]
    fn test_evict_skips_current_until_last() {
        let mut hot = HotBlocks::new();
        hot.add(entry(2, 0));
        hot.add(entry(1, 0));
        hot.add(entry(3, 0)); // current

        let mut order = Vec::new();
        while hot
            .evict_with(|key, _| {
                order.push(key);
                Ok::<(), ()>(())
            })
            .unwrap()
        {}

        assert_eq!(order, vec![1, 2, 3]);
        assert!(hot.is_empty());
        assert_eq!(hot.size(), 0);
    }

    #[test]
    fn test_failed_eviction_keeps_block() {
        let mut hot = HotBlocks::new();
        hot.add(entry(1, 10));
        let size = hot.size();

        let result = hot.evict_with(|_, _| Err("disk full"));
        assert_eq!(result, Err("disk full"));
        assert_eq!(hot.len(), 1);
        assert_eq!(hot.size(), size);
    }
}
