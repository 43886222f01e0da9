//! Entry blocks and their byte encoding.
//!
//! # Encoding
//! ```text
//! [len: u32 LE][bincode(Entry)] [len: u32 LE][bincode(Entry)] ...
//! ```
//!
//! Every record carries its own length, so the concatenation of two
//! encodings is itself a valid encoding. Flushing the same key twice simply
//! appends the second encoding after the bytes already on disk.

use super::entry::Entry;
use crate::error::CodecError;

/// Width of the per-record length prefix
const RECORD_LEN_SIZE: usize = 4;

/// An ordered collection of entries sharing one grouping key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryBlock {
    /// Entries in insertion order
    entries: Vec<Entry>,
    /// Sum of `Entry::size` over `entries`
    size: u64,
}

impl EntryBlock {
    /// Create an empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grouping key of the block, or zero if empty.
    pub fn key(&self) -> u64 {
        self.entries.first().map(|e| e.key).unwrap_or(0)
    }

    /// Accounted size of all entries.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Entry> {
        self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    /// Append an entry.
    pub fn add(&mut self, entry: Entry) {
        debug_assert!(
            self.entries.is_empty() || entry.key == self.key(),
            "entry key {} added to block {}",
            entry.key,
            self.key()
        );
        self.size += entry.size();
        self.entries.push(entry);
    }

    /// Append all of `other`'s entries after this block's entries.
    pub fn merge(&mut self, other: &EntryBlock) {
        self.entries.extend_from_slice(&other.entries);
        self.size += other.size;
    }

    /// Serialize every entry and append the result to `prefix`.
    ///
    /// An empty block returns `prefix` unchanged.
    pub fn encode_append(&self, mut prefix: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        for entry in &self.entries {
            let body = bincode::serialize(entry).map_err(CodecError::Encode)?;
            let len =
                u32::try_from(body.len()).map_err(|_| CodecError::RecordTooLarge(body.len()))?;
            prefix.reserve(RECORD_LEN_SIZE + body.len());
            prefix.extend_from_slice(&len.to_le_bytes());
            prefix.extend_from_slice(&body);
        }
        Ok(prefix)
    }

    /// Serialize the block into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.encode_append(Vec::new())
    }

    /// Parse a buffer produced by one or more `encode_append` calls.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut block = EntryBlock::new();
        let mut offset = 0;

        while offset < bytes.len() {
            let available = bytes.len() - offset;
            if available < RECORD_LEN_SIZE {
                return Err(CodecError::Truncated {
                    offset,
                    needed: RECORD_LEN_SIZE,
                    available,
                });
            }

            let mut len_bytes = [0u8; RECORD_LEN_SIZE];
            len_bytes.copy_from_slice(&bytes[offset..offset + RECORD_LEN_SIZE]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            let body_start = offset + RECORD_LEN_SIZE;

            let available = bytes.len() - body_start;
            if available < len {
                return Err(CodecError::Truncated {
                    offset,
                    needed: len,
                    available,
                });
            }

            let entry: Entry = bincode::deserialize(&bytes[body_start..body_start + len])
                .map_err(|source| CodecError::Malformed {
                    offset: body_start,
                    source,
                })?;
            block.add(entry);
            offset = body_start + len;
        }

        Ok(block)
    }
}

impl Extend<Entry> for EntryBlock {
    fn extend<I: IntoIterator<Item = Entry>>(&mut self, iter: I) {
        for entry in iter {
            self.add(entry);
        }
    }
}

impl FromIterator<Entry> for EntryBlock {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut block = EntryBlock::new();
        block.extend(iter);
        block
    }
}

impl IntoIterator for EntryBlock {
    type Item = Entry;
    type IntoIter = std::vec::IntoIter<Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a EntryBlock {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::entry::{Timestamp, ENTRY_HEADER_SIZE};
    use std::net::{IpAddr, Ipv6Addr};

    fn make_entry(key: u64, i: usize, payload_len: usize) -> Entry {
        Entry::new(
            key,
            Timestamp::new(1_700_000_000 + i as i64, i as u32),
            (i % 7) as u16,
            vec![(i % 251) as u8; payload_len],
        )
    }

    fn make_block(key: u64, count: usize) -> EntryBlock {
        (0..count).map(|i| make_entry(key, i, i % 64)).collect()
    }

    // ============================================================================
    // ROUND-TRIP
    // ============================================================================

    #[test]
    fn test_round_trip_single_entry() {
        let block = make_block(42, 1);
        let bytes = block.encode().unwrap();
        let decoded = EntryBlock::decode(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.key(), 42);
    }

    #[test]
    fn test_round_trip_two_entries() {
        let block = make_block(42, 2);
        let decoded = EntryBlock::decode(&block.encode().unwrap()).unwrap();
        assert_eq!(decoded.entries(), block.entries());
        assert_eq!(decoded.size(), block.size());
    }

    #[test]
    fn test_round_trip_many_entries_with_empty_payloads() {
        // i % 64 == 0 gives zero-length payloads throughout
        let block = make_block(9, 1500);
        assert!(block.iter().any(|e| e.data.is_empty()));

        let decoded = EntryBlock::decode(&block.encode().unwrap()).unwrap();
        assert_eq!(decoded.len(), 1500);
        assert_eq!(decoded.entries(), block.entries());
    }

    #[test]
    fn test_round_trip_preserves_source() {
        let src = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let block: EntryBlock = vec![make_entry(3, 0, 4).with_src(src)].into_iter().collect();
        let decoded = EntryBlock::decode(&block.encode().unwrap()).unwrap();
        assert_eq!(decoded.entries()[0].src, Some(src));
    }

    // ============================================================================
    // ACCUMULATION
    // ============================================================================

    #[test]
    fn test_encode_append_accumulates() {
        let first = make_block(5, 3);
        let second: EntryBlock = (10..14).map(|i| make_entry(5, i, 3)).collect();

        let bytes = first.encode().unwrap();
        let bytes = second.encode_append(bytes).unwrap();
        let decoded = EntryBlock::decode(&bytes).unwrap();

        let expected: Vec<Entry> = first
            .entries()
            .iter()
            .chain(second.entries())
            .cloned()
            .collect();
        assert_eq!(decoded.entries(), expected.as_slice());
    }

    #[test]
    fn test_empty_block_encodes_to_prefix() {
        let prefix = vec![1, 2, 3];
        let out = EntryBlock::new().encode_append(prefix.clone()).unwrap();
        assert_eq!(out, prefix);
        assert!(EntryBlock::decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let block = make_block(11, 20);
        assert_eq!(block.encode().unwrap(), block.encode().unwrap());
    }

    // ============================================================================
    // DECODE FAILURES
    // ============================================================================

    #[test]
    fn test_decode_truncated_body() {
        let bytes = make_block(1, 3).encode().unwrap();
        let err = EntryBlock::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_decode_truncated_length_prefix() {
        let mut bytes = make_block(1, 1).encode().unwrap();
        bytes.extend_from_slice(&[0x10, 0x00]);
        let err = EntryBlock::decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed: 4, .. }));
    }

    #[test]
    fn test_decode_malformed_body() {
        // Valid length prefix around a body too short to hold an entry
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
        let err = EntryBlock::decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { offset: 4, .. }));
    }

    // ============================================================================
    // ACCOUNTING AND MERGE
    // ============================================================================

    #[test]
    fn test_size_and_key_accounting() {
        let mut block = EntryBlock::new();
        assert_eq!(block.key(), 0);
        assert_eq!(block.size(), 0);

        block.add(make_entry(8, 0, 10));
        block.add(make_entry(8, 1, 0));
        assert_eq!(block.key(), 8);
        assert_eq!(block.len(), 2);
        assert_eq!(block.size(), 2 * ENTRY_HEADER_SIZE + 10);
    }

    #[test]
    fn test_merge_appends_after_existing() {
        let mut disk = make_block(4, 3);
        let hot: EntryBlock = (100..102).map(|i| make_entry(4, i, 1)).collect();
        let expected_size = disk.size() + hot.size();

        disk.merge(&hot);
        assert_eq!(disk.len(), 5);
        assert_eq!(disk.size(), expected_size);
        assert_eq!(&disk.entries()[3..], hot.entries());
    }
}
