//! Cache configuration.
//!
//! Recognized options:
//! - `file_backing_location`: store file; `None` (or an empty path) gives a
//!   memory-only cache with no persistence
//! - `memory_cache_size`: bytes held in memory before spilling (default 4 MiB)
//! - `tick_interval`: housekeeping period of the background routine (default 1s)
//! - `open_timeout` / `mmap_size`: block store open options
//!
//! Zero values fall back to the defaults, so a zeroed config from an
//! ingester's config file behaves like an unset one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::storage::{StoreOptions, DEFAULT_MMAP_SIZE, DEFAULT_OPEN_TIMEOUT};

/// Default in-memory ceiling
pub const DEFAULT_MEMORY_CACHE_SIZE: u64 = 4 * 1024 * 1024;

/// Default housekeeping period
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Environment variable holding the store path
pub const ENV_CACHE_PATH: &str = "INGEST_CACHE_PATH";
/// Environment variable holding the memory ceiling (bytes, `K`/`M`/`G` suffix allowed)
pub const ENV_CACHE_SIZE: &str = "INGEST_CACHE_SIZE";
/// Environment variable holding the tick interval in milliseconds
pub const ENV_CACHE_TICK_MS: &str = "INGEST_CACHE_TICK_MS";

/// Spill cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Store file; `None` for a memory-only cache
    pub file_backing_location: Option<PathBuf>,
    /// Hot-block bytes that trigger a trim to disk
    pub memory_cache_size: u64,
    /// Housekeeping period of the background routine
    pub tick_interval: Duration,
    /// How long to wait for the store file lock
    pub open_timeout: Duration,
    /// Memory-map size hint for the store
    pub mmap_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            file_backing_location: None,
            memory_cache_size: DEFAULT_MEMORY_CACHE_SIZE,
            tick_interval: DEFAULT_TICK_INTERVAL,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            mmap_size: DEFAULT_MMAP_SIZE,
        }
    }
}

impl CacheConfig {
    /// Memory-only config with defaults
    pub fn memory_only() -> Self {
        Self::default()
    }

    /// File-backed config with defaults
    pub fn file_backed(path: impl Into<PathBuf>) -> Self {
        Self {
            file_backing_location: Some(path.into()),
            ..Default::default()
        }
    }

    /// Set the in-memory ceiling in bytes
    pub fn memory_cache_size(mut self, bytes: u64) -> Self {
        self.memory_cache_size = bytes;
        self
    }

    /// Set the housekeeping period
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the store lock timeout
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the memory-map size hint
    pub fn mmap_size(mut self, bytes: u64) -> Self {
        self.mmap_size = bytes;
        self
    }

    /// Build a config from `INGEST_CACHE_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparseable ones are an error.
    pub fn from_env() -> CacheResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var(ENV_CACHE_PATH) {
            config.file_backing_location = Some(PathBuf::from(path));
        }

        if let Ok(size) = std::env::var(ENV_CACHE_SIZE) {
            config.memory_cache_size = parse_size(&size).ok_or_else(|| {
                CacheError::Config(format!("{}: invalid size '{}'", ENV_CACHE_SIZE, size))
            })?;
        }

        if let Ok(tick) = std::env::var(ENV_CACHE_TICK_MS) {
            let ms: u64 = tick.trim().parse().map_err(|_| {
                CacheError::Config(format!("{}: invalid interval '{}'", ENV_CACHE_TICK_MS, tick))
            })?;
            config.tick_interval = Duration::from_millis(ms);
        }

        Ok(config.normalized())
    }

    /// Replace unset (zero or empty) values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self
            .file_backing_location
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.file_backing_location = None;
        }
        if self.memory_cache_size == 0 {
            self.memory_cache_size = DEFAULT_MEMORY_CACHE_SIZE;
        }
        if self.tick_interval.is_zero() {
            self.tick_interval = DEFAULT_TICK_INTERVAL;
        }
        if self.open_timeout.is_zero() {
            self.open_timeout = DEFAULT_OPEN_TIMEOUT;
        }
        if self.mmap_size == 0 {
            self.mmap_size = DEFAULT_MMAP_SIZE;
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> CacheResult<()> {
        if let Some(path) = self.backing_path() {
            if path.is_dir() {
                return Err(CacheError::Config(format!(
                    "file_backing_location {:?} is a directory",
                    path
                )));
            }
        }
        Ok(())
    }

    /// Store path, if the cache is file-backed
    pub fn backing_path(&self) -> Option<&Path> {
        self.file_backing_location
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Options for opening the block store
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            open_timeout: self.open_timeout,
            mmap_size: self.mmap_size,
        }
    }
}

/// Parse a byte count with an optional binary `K`, `M` or `G` suffix
/// (`KB`/`MB`/`GB` and lowercase accepted).
pub fn parse_size(input: &str) -> Option<u64> {
    let s = input.trim().to_ascii_uppercase();
    let s = s.strip_suffix('B').unwrap_or(&s);

    let (digits, multiplier) = match s.chars().last()? {
        'K' => (&s[..s.len() - 1], 1u64 << 10),
        'M' => (&s[..s.len() - 1], 1u64 << 20),
        'G' => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };

    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.backing_path().is_none());
        assert_eq!(config.memory_cache_size, 4 * 1024 * 1024);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::file_backed("/tmp/ingest.cache")
            .memory_cache_size(1024)
            .tick_interval(Duration::from_millis(250))
            .open_timeout(Duration::from_millis(10));

        assert_eq!(config.backing_path(), Some(Path::new("/tmp/ingest.cache")));
        assert_eq!(config.memory_cache_size, 1024);
        assert_eq!(config.tick_interval, Duration::from_millis(250));
        assert_eq!(config.store_options().open_timeout, Duration::from_millis(10));
    }

    #[test]
    fn test_normalized_fills_defaults() {
        let config = CacheConfig::file_backed("")
            .memory_cache_size(0)
            .tick_interval(Duration::ZERO)
            .open_timeout(Duration::ZERO)
            .mmap_size(0)
            .normalized();

        assert!(config.file_backing_location.is_none());
        assert_eq!(config.memory_cache_size, DEFAULT_MEMORY_CACHE_SIZE);
        assert_eq!(config.tick_interval, DEFAULT_TICK_INTERVAL);
        assert_eq!(config.open_timeout, DEFAULT_OPEN_TIMEOUT);
        assert_eq!(config.mmap_size, DEFAULT_MMAP_SIZE);
    }

    #[test]
    fn test_validation_rejects_directory() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::file_backed(tmp_dir.path());
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_from_env() {
        // Only test in the crate touching these variables
        std::env::set_var(ENV_CACHE_PATH, "/tmp/env.cache");
        std::env::set_var(ENV_CACHE_SIZE, "8M");
        std::env::set_var(ENV_CACHE_TICK_MS, "500");
        let config = CacheConfig::from_env().unwrap();

        std::env::set_var(ENV_CACHE_SIZE, "plenty");
        let bad = CacheConfig::from_env();

        std::env::remove_var(ENV_CACHE_PATH);
        std::env::remove_var(ENV_CACHE_SIZE);
        std::env::remove_var(ENV_CACHE_TICK_MS);

        assert_eq!(config.backing_path(), Some(Path::new("/tmp/env.cache")));
        assert_eq!(config.memory_cache_size, 8 * 1024 * 1024);
        assert_eq!(config.tick_interval, Duration::from_millis(500));
        assert!(matches!(bad, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("100"), Some(100));
        assert_eq!(parse_size("4M"), Some(4 * 1024 * 1024));
        assert_eq!(parse_size("4mb"), Some(4 * 1024 * 1024));
        assert_eq!(parse_size(" 2 KB "), Some(2048));
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("M"), None);
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size("18446744073709551615G"), None);
    }
}
