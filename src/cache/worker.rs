//! Background ingestion routine.
//!
//! The routine runs on its own OS thread with a current-thread tokio
//! runtime, so the SQLite writes a trim performs never block a caller's
//! executor. It consumes the entry and batch channels until one of them
//! closes, a stop signal arrives, or a trim fails.

use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use super::state::CacheState;
use crate::block::Entry;
use crate::error::{CacheError, CacheResult};

/// Name of the routine's thread
pub const WORKER_THREAD_NAME: &str = "ingest-cache";

/// Handle to a spawned routine.
pub(crate) struct Worker {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<CacheResult<()>>,
}

impl Worker {
    /// Spawn the routine and wait until it is consuming.
    pub(crate) fn spawn(
        state: Arc<Mutex<CacheState>>,
        running: Arc<AtomicBool>,
        entries: mpsc::Receiver<Entry>,
        batches: mpsc::Receiver<Vec<Entry>>,
        tick: Duration,
    ) -> CacheResult<Self> {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        running.store(true, Ordering::SeqCst);
        let flag = running.clone();

        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let result = run(state, entries, batches, stop_rx, tick, ready_tx);
                flag.store(false, Ordering::SeqCst);
                match &result {
                    Ok(()) => info!("Ingest cache routine exited"),
                    Err(e) => error!("Ingest cache routine failed: {}", e),
                }
                result
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                return Err(CacheError::Spawn(e));
            }
        };

        // The sender is dropped without a signal only if the routine failed
        // before consuming anything; its result says why.
        if ready_rx.recv().is_err() {
            return match thread.join() {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) | Err(_) => Err(CacheError::WorkerPanicked),
            };
        }

        Ok(Self { stop_tx, thread })
    }

    /// Ask the routine to exit. Never blocks; a pending stop is not
    /// duplicated and a routine that already exited is not an error.
    pub(crate) fn signal_stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Wait for the routine and return the result it recorded.
    pub(crate) fn join(self) -> CacheResult<()> {
        self.thread.join().map_err(|_| CacheError::WorkerPanicked)?
    }
}

fn run(
    state: Arc<Mutex<CacheState>>,
    entries: mpsc::Receiver<Entry>,
    batches: mpsc::Receiver<Vec<Entry>>,
    stop_rx: mpsc::Receiver<()>,
    tick: Duration,
    ready: std_mpsc::SyncSender<()>,
) -> CacheResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(CacheError::Runtime)?;

    runtime.block_on(consume(state, entries, batches, stop_rx, tick, ready))
}

async fn consume(
    state: Arc<Mutex<CacheState>>,
    mut entries: mpsc::Receiver<Entry>,
    mut batches: mpsc::Receiver<Vec<Entry>>,
    mut stop_rx: mpsc::Receiver<()>,
    tick: Duration,
    ready: std_mpsc::SyncSender<()>,
) -> CacheResult<()> {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately
    ticker.tick().await;

    let _ = ready.send(());
    drop(ready);
    info!("Ingest cache routine started ({:?} tick)", tick);

    loop {
        tokio::select! {
            entry = entries.recv() => {
                let Some(entry) = entry else {
                    info!("Entry channel closed");
                    return Ok(());
                };
                state.lock().ingest([entry])?;
            }
            batch = batches.recv() => {
                let Some(batch) = batch else {
                    info!("Batch channel closed");
                    return Ok(());
                };
                state.lock().ingest(batch)?;
            }
            _ = stop_rx.recv() => {
                info!("Ingest cache routine stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                let stats = state.lock().stats();
                debug!(
                    "Cache: {} hot blocks ({}/{} bytes), {} stored blocks, {} entries",
                    stats.hot_blocks,
                    stats.memory_usage,
                    stats.max_memory,
                    stats.stored_blocks,
                    stats.entries
                );
            }
        }
    }
}
