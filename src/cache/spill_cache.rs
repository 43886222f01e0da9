//! # Spill Cache
//!
//! Bounded in-memory write buffer for ingested entries that spills grouped
//! blocks to a [`BlockStore`](crate::storage::BlockStore) when full.
//!
//! ## Lifecycle
//!
//! ```text
//!   new ──> Idle ──start──> Running ──stop / channel closed / trim error──> Idle
//!            │                                                             │
//!            └──── sync / pop_block ───────────────────────────────────────┘
//!            └──── close ──> Closed
//! ```
//!
//! While the background routine runs, the hot blocks belong to it:
//! `sync`, `pop_block` and `close` fail with [`CacheError::Running`].

use log::{info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

use super::state::CacheState;
use super::worker::Worker;
use super::CacheStats;
use crate::block::{Entry, EntryBlock};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};

/// Dual-tier (memory + disk) ingest cache.
pub struct SpillCache {
    config: CacheConfig,
    /// Hot blocks, store handle and counters
    state: Arc<Mutex<CacheState>>,
    /// Cleared by the routine when it exits
    running: Arc<AtomicBool>,
    /// Handle of the last started routine, until it is stopped or reaped
    worker: Mutex<Option<Worker>>,
}

impl SpillCache {
    /// Build a cache from `config`.
    ///
    /// With a backing location the store is opened (created if missing) and
    /// scanned once; corrupt records are deleted. Fails with
    /// [`StoreError::Locked`](crate::error::StoreError::Locked) if another
    /// process holds the file.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        let config = config.normalized();
        config.validate()?;

        let state = CacheState::open(&config)?;
        info!(
            "Spill cache ready: {} stored blocks, {} entries, {} byte ceiling, {}",
            state.stored_block_count(),
            state.entry_count(),
            config.memory_cache_size,
            match config.backing_path() {
                Some(path) => format!("backed by {:?}", path),
                None => "memory only".to_string(),
            }
        );

        Ok(Self {
            config,
            state: Arc::new(Mutex::new(state)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    /// Start the background routine over the two input channels.
    ///
    /// Returns once the routine is consuming. The caller keeps the senders;
    /// dropping either one ends the routine.
    pub fn start(&self, entries: Receiver<Entry>, batches: Receiver<Vec<Entry>>) -> CacheResult<()> {
        let mut worker = self.worker.lock();

        if self.running.load(Ordering::SeqCst) {
            return Err(CacheError::AlreadyRunning);
        }
        if self.state.lock().is_closed() {
            return Err(CacheError::Closed);
        }
        self.reap(&mut worker);

        *worker = Some(Worker::spawn(
            self.state.clone(),
            self.running.clone(),
            entries,
            batches,
            self.config.tick_interval,
        )?);
        Ok(())
    }

    /// Stop the background routine and return the error it recorded, if any.
    ///
    /// A routine that already exited on its own is reaped the same way.
    pub fn stop(&self) -> CacheResult<()> {
        // Held until the join completes so no other lifecycle call sees a
        // half-stopped routine
        let mut guard = self.worker.lock();
        let worker = guard.take().ok_or(CacheError::NotRunning)?;
        worker.signal_stop();
        let result = worker.join();
        info!("Spill cache stopped");
        result
    }

    /// Write every hot block to the store.
    pub fn sync(&self) -> CacheResult<()> {
        let mut worker = self.worker.lock();
        self.ensure_idle(&mut worker)?;
        self.state.lock().flush_all()
    }

    /// Remove and return the oldest block, merged with any hot entries for
    /// the same key. `Ok(None)` once the cache is empty.
    pub fn pop_block(&self) -> CacheResult<Option<EntryBlock>> {
        let mut worker = self.worker.lock();
        self.ensure_idle(&mut worker)?;
        self.state.lock().pop_block()
    }

    /// Flush hot blocks and release the store. Later `start`, `sync` and
    /// `pop_block` calls fail with [`CacheError::Closed`].
    pub fn close(&self) -> CacheResult<()> {
        let mut worker = self.worker.lock();
        self.ensure_idle(&mut worker)?;
        self.state.lock().close()?;
        info!("Spill cache closed");
        Ok(())
    }

    pub fn hot_block_count(&self) -> usize {
        self.state.lock().hot_block_count()
    }

    pub fn stored_block_count(&self) -> usize {
        self.state.lock().stored_block_count()
    }

    pub fn entry_count(&self) -> u64 {
        self.state.lock().entry_count()
    }

    /// Bytes held in hot blocks
    pub fn memory_usage(&self) -> u64 {
        self.state.lock().memory_usage()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            running: self.is_running(),
            ..self.state.lock().stats()
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_file_backed(&self) -> bool {
        self.config.backing_path().is_some()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn ensure_idle(&self, worker: &mut Option<Worker>) -> CacheResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CacheError::Running);
        }
        self.reap(worker);
        Ok(())
    }

    /// Join a routine that exited on its own. Its error was already logged
    /// by the routine and is not reported again.
    fn reap(&self, worker: &mut Option<Worker>) {
        if let Some(finished) = worker.take() {
            if let Err(e) = finished.join() {
                warn!("Reaped ingest cache routine that failed: {}", e);
            }
        }
    }
}

impl Drop for SpillCache {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.signal_stop();
            if let Err(e) = worker.join() {
                warn!("Ingest cache routine failed during shutdown: {}", e);
            }
        }

        let state = self.state.lock();
        if !state.is_closed() && state.hot_block_count() > 0 {
            warn!(
                "Spill cache dropped with {} unflushed hot blocks ({} bytes)",
                state.hot_block_count(),
                state.memory_usage()
            );
        }
    }
}

impl std::fmt::Debug for SpillCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillCache")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}
