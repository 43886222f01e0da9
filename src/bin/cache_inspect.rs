//! # Cache Inspect CLI
//!
//! Operator tool for looking into (and draining) an ingest cache file while
//! the ingester that owns it is stopped.
//!
//! Usage:
//!   cache-inspect --file <path> stats [--json]
//!   cache-inspect --file <path> list
//!   cache-inspect --file <path> drain [--limit N]
//!   cache-inspect --file <path> compact

use clap::{Parser, Subcommand};
use ingest_cache::storage::{decode_key, BlockStore, StoreOptions};
use ingest_cache::{CacheConfig, EntryBlock, SpillCache};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cache-inspect")]
#[command(about = "Inspect and drain ingest spill cache files", long_about = None)]
struct Cli {
    /// Path to the cache file
    #[arg(short, long, env = "INGEST_CACHE_PATH")]
    file: PathBuf,

    /// Milliseconds to wait for the file lock
    #[arg(long, default_value_t = 1000)]
    lock_timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show block and entry counts
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored blocks with their entry counts and sizes
    List,

    /// Pop blocks and print their entries as JSON lines
    Drain {
        /// Maximum number of blocks to pop
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Recreate the file if it holds no blocks
    Compact,
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let lock_timeout = Duration::from_millis(cli.lock_timeout_ms);

    match cli.command {
        Commands::Stats { json } => {
            let cache = open_cache(&cli.file, lock_timeout)?;
            let stats = cache.stats();

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&stats).map_err(|e| e.to_string())?
                );
            } else {
                println!("Cache file:     {:?}", cli.file);
                println!("Stored blocks:  {}", stats.stored_blocks);
                println!("Entries:        {}", stats.entries);
            }
            cache.close().map_err(|e| e.to_string())?;
        }

        Commands::List => {
            let store = open_store(&cli.file, lock_timeout)?;
            let mut total_blocks = 0usize;
            let mut total_entries = 0usize;

            store
                .for_each(|raw_key, value| {
                    let key = match decode_key(raw_key) {
                        Ok(key) => format!("{:#018x}", key),
                        Err(_) => format!("{:02x?}", raw_key),
                    };
                    match EntryBlock::decode(value) {
                        Ok(block) => {
                            println!(
                                "{} | {:>6} entries | {:>10} bytes accounted | {:>10} bytes stored",
                                key,
                                block.len(),
                                block.size(),
                                value.len()
                            );
                            total_blocks += 1;
                            total_entries += block.len();
                        }
                        Err(e) => println!("{} | corrupt: {}", key, e),
                    }
                    Ok(())
                })
                .map_err(|e| e.to_string())?;

            println!("\n{} blocks, {} entries", total_blocks, total_entries);
        }

        Commands::Drain { limit } => {
            let cache = open_cache(&cli.file, lock_timeout)?;
            let limit = limit.unwrap_or(usize::MAX);
            let mut drained = 0usize;

            while drained < limit {
                let Some(block) = cache.pop_block().map_err(|e| e.to_string())? else {
                    break;
                };
                for entry in block.iter() {
                    println!("{}", serde_json::to_string(entry).map_err(|e| e.to_string())?);
                }
                drained += 1;
            }

            eprintln!("Drained {} blocks", drained);
            cache.close().map_err(|e| e.to_string())?;
        }

        Commands::Compact => {
            let mut store = open_store(&cli.file, lock_timeout)?;
            let blocks = store.len().map_err(|e| e.to_string())?;
            if blocks > 0 {
                return Err(format!(
                    "{:?} still holds {} blocks; drain it first",
                    cli.file, blocks
                ));
            }

            let before = file_len(&cli.file);
            store.compact().map_err(|e| e.to_string())?;
            println!(
                "Compacted {:?}: {} -> {} bytes",
                cli.file,
                before,
                file_len(&cli.file)
            );
        }
    }

    Ok(())
}

fn open_cache(path: &Path, lock_timeout: Duration) -> Result<SpillCache, String> {
    ensure_exists(path)?;
    let config = CacheConfig::file_backed(path).open_timeout(lock_timeout);
    SpillCache::new(config).map_err(|e| format!("Failed to open cache {:?}: {}", path, e))
}

fn open_store(path: &Path, lock_timeout: Duration) -> Result<BlockStore, String> {
    ensure_exists(path)?;
    let options = StoreOptions {
        open_timeout: lock_timeout,
        ..Default::default()
    };
    BlockStore::open(path, options).map_err(|e| format!("Failed to open store {:?}: {}", path, e))
}

/// Inspecting a mistyped path must not create an empty cache there
fn ensure_exists(path: &Path) -> Result<(), String> {
    if !path.exists() {
        return Err(format!("{:?} does not exist", path));
    }
    Ok(())
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
