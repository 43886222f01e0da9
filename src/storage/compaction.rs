//! Store compaction.
//!
//! SQLite never shrinks the file on its own once pages are freed, and a
//! `VACUUM` rewrites through a temporary copy. Once the cache has fully
//! drained it is cheaper to throw the file away and start over:
//! sync, close, delete, recreate.
//!
//! Callers must guarantee that nothing else uses the store while this runs.
//! If any step fails the store may be left closed with no file on disk; the
//! error is returned and the handle must not be reused.

use log::info;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::store::{connect, BlockStore};
use crate::error::{StoreError, StoreResult};

/// Files SQLite may leave next to the main database file
const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

impl BlockStore {
    /// Recreate the store as an empty file with the same bucket.
    pub fn compact(&mut self) -> StoreResult<()> {
        let start = Instant::now();

        self.sync()?;
        self.close()?;

        remove_if_exists(&self.path)?;
        for suffix in SIDECAR_SUFFIXES {
            remove_if_exists(&sidecar_path(&self.path, suffix))?;
        }

        self.conn = Some(connect(&self.path, &self.options)?);

        info!(
            "Compacted block store {:?} in {:?}",
            self.path,
            start.elapsed()
        );
        Ok(())
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(e, format!("removing {:?}", path))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreOptions;

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/var/cache/ingest.db"), "-journal"),
            PathBuf::from("/var/cache/ingest.db-journal")
        );
    }

    #[test]
    fn test_compact_recreates_empty_store() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("cache.db");
        let mut store = BlockStore::open(&path, StoreOptions::default()).unwrap();

        let payload = vec![0xabu8; 64 * 1024];
        for key in 0..32u64 {
            store.put(key, &payload).unwrap();
        }
        for key in 0..32u64 {
            store.delete(key).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        store.compact().unwrap();

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "file did not shrink: {} -> {}", before, after);
        assert!(store.is_open());
        assert!(store.is_empty().unwrap());

        // Still usable
        store.put(1, b"again").unwrap();
        assert_eq!(store.get(1).unwrap().as_deref(), Some(&b"again"[..]));
    }

    #[test]
    fn test_compact_keeps_lock() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("cache.db");
        let mut store = BlockStore::open(&path, StoreOptions::default()).unwrap();
        store.compact().unwrap();

        let options = StoreOptions {
            open_timeout: std::time::Duration::from_millis(50),
            ..Default::default()
        };
        assert!(BlockStore::open(&path, options).unwrap_err().is_locked());
    }
}
