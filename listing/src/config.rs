//! Configuration for the listing cache.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`ListingCache`](crate::cache::ListingCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How many complete-but-unreferenced directory snapshots to keep.
    pub capacity: usize,

    /// Delay over which rapid repeated watch events on one directory are
    /// coalesced into a single update job.
    pub coalesce_delay: Duration,

    /// Maximum redirection hops a single job may take before it fails.
    pub max_redirects: u8,
}

impl CacheConfig {
    /// Configuration with the default tunables.
    pub fn new() -> Self {
        Self {
            capacity: 10,
            coalesce_delay: Duration::from_millis(500),
            max_redirects: 8,
        }
    }

    /// Set the snapshot cache capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Set the watch-event coalescing delay.
    pub fn with_coalesce_delay(mut self, delay: Duration) -> Self {
        self.coalesce_delay = delay;
        self
    }

    /// Set the redirection hop cap.
    pub fn with_max_redirects(mut self, hops: u8) -> Self {
        self.max_redirects = hops;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}
