//! Configuration consumed at `Store::open`. The B+Tree order in particular must be
//! reused at every subsequent open since it determines the on-disk node record size.

use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// Default B+Tree order.
pub const DEFAULT_BTREE_ORDER: u16 = 65;
/// Default node/object cache capacity, a power of two.
pub const DEFAULT_CACHE_CAPACITY: usize = 16384;
/// Default number of deferred flushes before a non-forced `flush` is applied anyway.
pub const DEFAULT_FLUSH_DELAY: u32 = 16;
/// Default lock staleness timeout.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_LOCK_MAX_RETRIES: u32 = 3;
pub const DEFAULT_LOCK_PAUSE_SECS: u64 = 1;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreConfig {
    /// Directory holding `database.blobs`, `index.blobs`, `database_spaces.blobs`, etc.
    pub dir: PathBuf,
    /// B+Tree order; odd, 3 <= order < 65535.
    pub btree_order: u16,
    /// Node/object cache capacity; should be a power of two.
    pub cache_capacity: usize,
    /// Number of modifying operations the cache defers a non-forced flush for.
    pub flush_delay: u32,
    /// How old an existing lock file must be, with an unreachable owning pid, before
    /// it is considered stale.
    pub lock_timeout_secs: u64,
    pub lock_max_retries: u32,
    pub lock_pause_secs: u64,
}

impl StoreConfig {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn with_btree_order(mut self, order: u16) -> Self {
        self.btree_order = order;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Load overrides from a JSON config file. `StoreConfig` already derives
    /// `serde::Deserialize`, so a thin CLI can accept one instead of repeating
    /// every flag.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| StoreError::invariant(format!("invalid config file: {e}")))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::invariant(format!("failed to encode config: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.btree_order < 3 || self.btree_order % 2 == 0 || self.btree_order >= 65535 {
            return Err(StoreError::invariant(format!(
                "btree order must be odd and in 3..65535, got {}",
                self.btree_order
            )));
        }
        if self.cache_capacity == 0 || !self.cache_capacity.is_power_of_two() {
            return Err(StoreError::invariant(format!(
                "cache capacity must be a power of two, got {}",
                self.cache_capacity
            )));
        }
        Ok(())
    }

    pub(crate) fn blob_path(&self) -> PathBuf {
        self.dir.join("database.blobs")
    }

    pub(crate) fn index_path(&self) -> PathBuf {
        self.dir.join("index.blobs")
    }

    pub(crate) fn spaces_path(&self) -> PathBuf {
        self.dir.join("database_spaces.blobs")
    }

    pub(crate) fn legacy_spaces_path(&self) -> PathBuf {
        self.dir.join("database_spaces.blobs.legacy")
    }

    pub(crate) fn dirty_lock_path(&self) -> PathBuf {
        self.dir.join("index.dirty")
    }

    pub(crate) fn marks_path(&self) -> PathBuf {
        self.dir.join("marks")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            btree_order: DEFAULT_BTREE_ORDER,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            flush_delay: DEFAULT_FLUSH_DELAY,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            lock_max_retries: DEFAULT_LOCK_MAX_RETRIES,
            lock_pause_secs: DEFAULT_LOCK_PAUSE_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_even_and_out_of_range_orders() {
        assert!(StoreConfig::new(".").with_btree_order(2).validate().is_err());
        assert!(StoreConfig::new(".").with_btree_order(64).validate().is_err());
        assert!(StoreConfig::new(".").with_btree_order(65535).validate().is_err());
        assert!(StoreConfig::new(".").with_btree_order(65).validate().is_ok());
    }
}
