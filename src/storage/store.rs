//! # Block Store
//!
//! Single-bucket, transactional, file-backed key-value store for spilled
//! entry blocks. Backed by SQLite: the bucket is one `WITHOUT ROWID` table
//! keyed by the 8-byte big-endian grouping key.
//!
//! The file is opened in `EXCLUSIVE` locking mode and the lock is taken at
//! open time with a bounded busy timeout, so a second process pointed at the
//! same file fails fast with [`StoreError::Locked`] instead of hanging.

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::key::{decode_key, encode_key};
use crate::block::EntryBlock;
use crate::error::{is_busy, StoreError, StoreResult};

/// Name of the bucket (table) holding spilled blocks
pub const BUCKET: &str = "cache_blocks";

/// Default time to wait for the file lock before giving up
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default memory-map size hint
pub const DEFAULT_MMAP_SIZE: u64 = 64 * 1024 * 1024;

const SQL_CREATE_BUCKET: &str = "CREATE TABLE IF NOT EXISTS cache_blocks (
    key BLOB PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
) WITHOUT ROWID";
const SQL_GET: &str = "SELECT value FROM cache_blocks WHERE key = ?1";
const SQL_PUT: &str = "INSERT OR REPLACE INTO cache_blocks (key, value) VALUES (?1, ?2)";
const SQL_DELETE: &str = "DELETE FROM cache_blocks WHERE key = ?1";
const SQL_SCAN: &str = "SELECT key, value FROM cache_blocks ORDER BY key";
const SQL_FIRST: &str = "SELECT key, value FROM cache_blocks ORDER BY key LIMIT 1";
const SQL_COUNT: &str = "SELECT COUNT(*) FROM cache_blocks";

/// Block store open options.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long to wait for another holder to release the file lock
    pub open_timeout: Duration,
    /// Memory-map size hint in bytes
    pub mmap_size: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            mmap_size: DEFAULT_MMAP_SIZE,
        }
    }
}

/// File-backed block store.
pub struct BlockStore {
    /// Path to the store file
    pub(super) path: PathBuf,
    /// Options used to (re)open the file
    pub(super) options: StoreOptions,
    /// Open connection; `None` once closed
    pub(super) conn: Option<Connection>,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("path", &self.path)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl BlockStore {
    /// Open or create the store at `path`.
    ///
    /// Fails with [`StoreError::Locked`] if the file is held by another
    /// process for longer than `options.open_timeout`.
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        // Create parent directory if needed
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io(e, format!("creating directory {:?}", parent)))?;
        }

        let conn = connect(&path, &options)?;
        info!("Opened block store at {:?}", path);

        Ok(Self {
            path,
            options,
            conn: Some(conn),
        })
    }

    /// Path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&self) -> StoreResult<&Connection> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    fn conn_mut(&mut self) -> StoreResult<&mut Connection> {
        self.conn.as_mut().ok_or(StoreError::Closed)
    }

    /// Fetch the value stored under `key`. Absent keys are `Ok(None)`.
    pub fn get(&self, key: u64) -> StoreResult<Option<Vec<u8>>> {
        let value = self
            .conn()?
            .query_row(SQL_GET, params![&encode_key(key)[..]], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn put(&self, key: u64, value: &[u8]) -> StoreResult<()> {
        self.conn()?
            .execute(SQL_PUT, params![&encode_key(key)[..], value])?;
        Ok(())
    }

    /// Remove `key`. Removing an absent key is not an error.
    pub fn delete(&self, key: u64) -> StoreResult<()> {
        self.delete_raw(&encode_key(key))
    }

    /// Remove a key by its raw bytes, including keys of invalid length.
    pub(crate) fn delete_raw(&self, key: &[u8]) -> StoreResult<()> {
        self.conn()?.execute(SQL_DELETE, params![key])?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.conn()?.execute(SQL_PUT, params![key, value])?;
        Ok(())
    }

    /// Visit every key/value pair in key order.
    ///
    /// Keys are handed over raw so callers can detect malformed keys.
    pub fn for_each<F>(&self, mut visit: F) -> StoreResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> StoreResult<()>,
    {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(SQL_SCAN)?;
        let mut rows = stmt.query([])?;

        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            visit(&key, &value)?;
        }

        Ok(())
    }

    /// Atomically remove and return the first (smallest) key.
    ///
    /// Select and delete run in one read-write transaction, so no two pops
    /// can ever observe the same record.
    pub fn pop_first(&mut self) -> StoreResult<Option<(u64, Vec<u8>)>> {
        let tx = self.conn_mut()?.transaction()?;

        let first: Option<(Vec<u8>, Vec<u8>)> = tx
            .query_row(SQL_FIRST, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let Some((raw_key, value)) = first else {
            return Ok(None);
        };

        let key = decode_key(&raw_key)?;
        tx.execute(SQL_DELETE, params![raw_key])?;
        tx.commit()?;

        Ok(Some((key, value)))
    }

    /// Append `block`'s encoding after whatever is stored under `key`.
    ///
    /// Read, encode and write happen in one transaction. Returns `true` if
    /// the key did not exist before. An empty block is a no-op.
    pub fn append_block(&mut self, key: u64, block: &EntryBlock) -> StoreResult<bool> {
        if block.is_empty() {
            return Ok(false);
        }

        let raw_key = encode_key(key);
        let tx = self.conn_mut()?.transaction()?;

        let existing: Option<Vec<u8>> = tx
            .query_row(SQL_GET, params![&raw_key[..]], |row| row.get(0))
            .optional()?;
        let created = existing.is_none();

        let bytes = block.encode_append(existing.unwrap_or_default())?;
        tx.execute(SQL_PUT, params![&raw_key[..], bytes])?;
        tx.commit()?;

        debug!(
            "Appended {} entries ({} bytes) to key {:#x}{}",
            block.len(),
            block.size(),
            key,
            if created { " (new)" } else { "" }
        );

        Ok(created)
    }

    /// Number of keys in the bucket.
    pub fn len(&self) -> StoreResult<usize> {
        let count: i64 = self.conn()?.query_row(SQL_COUNT, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush the store file to stable storage.
    pub fn sync(&self) -> StoreResult<()> {
        File::open(&self.path)
            .and_then(|f| f.sync_all())
            .map_err(|e| StoreError::io(e, format!("syncing {:?}", self.path)))
    }

    /// Release the connection and the file lock.
    ///
    /// Closing an already closed store is a no-op.
    pub fn close(&mut self) -> StoreResult<()> {
        match self.conn.take() {
            Some(conn) => conn.close().map_err(|(_, e)| StoreError::from(e)),
            None => Ok(()),
        }
    }
}

/// Open a connection, take the exclusive lock and make sure the bucket
/// exists. Lock contention anywhere in this sequence is reported as
/// [`StoreError::Locked`].
pub(super) fn connect(path: &Path, options: &StoreOptions) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;

    configure(&conn, options).map_err(|e| {
        if is_busy(&e) {
            StoreError::Locked {
                path: path.to_path_buf(),
            }
        } else {
            StoreError::from(e)
        }
    })?;

    debug!("Store {:?} connected", path);
    Ok(conn)
}

fn configure(conn: &Connection, options: &StoreOptions) -> rusqlite::Result<()> {
    conn.busy_timeout(options.open_timeout)?;

    let mode: String =
        conn.pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| row.get(0))?;
    let mmap: i64 = conn.pragma_update_and_check(
        None,
        "mmap_size",
        i64::try_from(options.mmap_size).unwrap_or(i64::MAX),
        |row| row.get(0),
    )?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    debug!("locking_mode={}, mmap_size={}", mode, mmap);

    // Taking the lock here is what makes a second opener fail at open time
    conn.execute_batch(&format!("BEGIN EXCLUSIVE; {}; COMMIT;", SQL_CREATE_BUCKET))
}
