use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One year in seconds, the largest lock wait timeout allowed.
pub const LONG_TIMEOUT_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableCacheConfig {
    /// Number of shares kept in definition cache before unused
    /// ones are evicted.
    pub table_definition_cache: usize,
    /// Maximum idle instances kept per share.
    pub table_open_cache_per_share: usize,
    /// Upper bound of table identifiers.
    pub max_table_id: u32,
    /// Lock wait timeout in seconds.
    pub lock_wait_timeout: u64,
    /// Maximum restarts of one open-tables call.
    pub max_open_retries: usize,
    /// Refuse write locks unless caller ignores read-only mode.
    pub read_only: bool,
}

impl Default for TableCacheConfig {
    #[inline]
    fn default() -> Self {
        TableCacheConfig {
            table_definition_cache: 400,
            table_open_cache_per_share: 16,
            max_table_id: u32::MAX - 1,
            lock_wait_timeout: LONG_TIMEOUT_SECS,
            max_open_retries: 1000,
            read_only: false,
        }
    }
}

impl TableCacheConfig {
    #[inline]
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout.min(LONG_TIMEOUT_SECS))
    }

    #[inline]
    pub fn with_table_definition_cache(mut self, n: usize) -> Self {
        self.table_definition_cache = n;
        self
    }

    #[inline]
    pub fn with_open_cache_per_share(mut self, n: usize) -> Self {
        self.table_open_cache_per_share = n;
        self
    }

    #[inline]
    pub fn with_max_table_id(mut self, max_table_id: u32) -> Self {
        self.max_table_id = max_table_id;
        self
    }

    #[inline]
    pub fn with_lock_wait_timeout(mut self, secs: u64) -> Self {
        self.lock_wait_timeout = secs;
        self
    }

    #[inline]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}
