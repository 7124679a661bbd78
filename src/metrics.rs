//! Counters exposed for scraping.
//!
//! The core keeps plain atomic counters and hands out serializable
//! snapshots; shipping them anywhere is the monitoring pipeline's
//! job, not ours.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::audit::PartitionCounts;
use crate::breaker::BreakerSnapshot;
use crate::pool::PoolStatus;

/// Cache-aside counters. Shared by the coordinator and the snapshot.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    fallbacks: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheMetrics {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// The key-value store was unreachable and the loader served the
    /// read directly. A growing number here means the backing store
    /// is absorbing load the cache normally takes.
    pub fn fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheSnapshot {
            hits,
            misses,
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fallbacks: u64,
    pub invalidations: u64,
    pub hit_ratio: f64,
}

/// Everything the monitoring pipeline scrapes in one call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub pools: Vec<PoolStatus>,
    pub cache: CacheSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
    pub partitions: PartitionCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_tracks_lookups() {
        let metrics = CacheMetrics::default();
        assert_eq!(metrics.snapshot().hit_ratio, 0.0);

        metrics.hit();
        metrics.hit();
        metrics.hit();
        metrics.miss();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 3);
        assert_eq!(snapshot.misses, 1);
        assert!((snapshot.hit_ratio - 0.75).abs() < f64::EPSILON);
    }
}
