//! Telemetry entry as seen by the cache.
//!
//! The cache treats an entry as opaque apart from its grouping key and its
//! accounted size. How the key is derived (tag, source, time bucket) is the
//! producer's business.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed per-entry overhead counted by [`Entry::size`]:
/// key (8) + seconds (8) + nanoseconds (4) + tag (2).
pub const ENTRY_HEADER_SIZE: u64 = 22;

/// Bytes counted for a source address, by family
const IPV4_SRC_SIZE: u64 = 4;
const IPV6_SRC_SIZE: u64 = 16;

/// Wall-clock timestamp with nanosecond resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch
    pub sec: i64,
    /// Nanoseconds within the second
    pub nsec: u32,
}

impl Timestamp {
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// Current system time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs() as i64,
            nsec: elapsed.subsec_nanos(),
        }
    }
}

/// A single telemetry record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Grouping key; entries sharing a key are stored in one block
    pub key: u64,
    /// Time the entry was produced
    pub ts: Timestamp,
    /// Tag identifier assigned by the ingester
    pub tag: u16,
    /// Source address, if known
    pub src: Option<IpAddr>,
    /// Payload bytes
    pub data: Vec<u8>,
}

impl Entry {
    /// Create an entry with no source address.
    pub fn new(key: u64, ts: Timestamp, tag: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            ts,
            tag,
            src: None,
            data: data.into(),
        }
    }

    /// Set the source address.
    pub fn with_src(mut self, src: IpAddr) -> Self {
        self.src = Some(src);
        self
    }

    /// Accounted size in bytes, used for memory-pressure decisions:
    /// header, source address (if any) and payload.
    #[inline]
    pub fn size(&self) -> u64 {
        let src = match self.src {
            Some(IpAddr::V4(_)) => IPV4_SRC_SIZE,
            Some(IpAddr::V6(_)) => IPV6_SRC_SIZE,
            None => 0,
        };
        ENTRY_HEADER_SIZE + src + self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_entry_size() {
        let entry = Entry::new(7, Timestamp::new(60, 0), 1, vec![0u8; 8]);
        assert_eq!(entry.size(), 30);

        let empty = Entry::new(7, Timestamp::default(), 1, Vec::new());
        assert_eq!(empty.size(), ENTRY_HEADER_SIZE);
    }

    #[test]
    fn test_with_src() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let entry = Entry::new(1, Timestamp::now(), 0, b"x".to_vec()).with_src(src);
        assert_eq!(entry.src, Some(src));
        assert_eq!(entry.size(), ENTRY_HEADER_SIZE + 4 + 1);
    }

    #[test]
    fn test_ipv6_source_counted() {
        let entry = Entry::new(1, Timestamp::new(0, 0), 0, vec![0u8; 8])
            .with_src(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(entry.size(), ENTRY_HEADER_SIZE + 16 + 8);
    }

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::new(1, 999) < Timestamp::new(2, 0));
        assert!(Timestamp::now() > Timestamp::new(0, 0));
    }
}
