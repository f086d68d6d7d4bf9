//! Cache configuration

use cascade_common::HashAlgorithm;
use std::time::Duration;

/// Tunables for one cache instance
///
/// Defaults match the module options: 16 MiB purge target, 10 s entry age,
/// 256-wide flush batch window, 1 GiB blob limit, sha1.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Purge drains the LRU tail while total valid bytes exceed this
    pub purge_target_size: u64,
    /// Entries younger than this survive purge regardless of size pressure
    pub purge_old_entry: Duration,
    /// Concurrent backing stores allowed before write-backs queue
    pub flush_batch_limit: u32,
    /// Stores larger than this are rejected outright
    pub blob_size_limit: u64,
    /// Hash algorithm; fixes the digest width for the instance lifetime
    pub hash: HashAlgorithm,
    /// Heartbeat tick period; clamped into [1 s, 10 s]
    pub heartbeat_period: Duration,
    /// Pre-latched backing store name; registration under any other name
    /// fails even before a first register
    pub backing_name: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            purge_target_size: 16 * 1024 * 1024,
            purge_old_entry: Duration::from_secs(10),
            flush_batch_limit: 256,
            blob_size_limit: 1024 * 1024 * 1024,
            hash: HashAlgorithm::Sha1,
            heartbeat_period: Duration::from_secs(10),
            backing_name: None,
        }
    }
}

impl CacheConfig {
    /// The heartbeat contract bounds the tick period to [1 s, 10 s]
    #[must_use]
    pub fn heartbeat_period_clamped(&self) -> Duration {
        self.heartbeat_period
            .clamp(Duration::from_secs(1), Duration::from_secs(10))
    }
}
