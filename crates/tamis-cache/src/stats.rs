use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tamis_store::StoreStats;

/// Request outcome counters of one cache, mirrored into the `metrics`
/// registry under `<prefix>_<outcome>_total`.
pub(crate) struct Counters {
    prefix: &'static str,
    hits: AtomicU64,
    misses: AtomicU64,
    skips: AtomicU64,
    stores: AtomicU64,
    fill_aborts: AtomicU64,
}

#[derive(Clone, Copy)]
pub(crate) enum Outcome {
    Hit,
    Miss,
    Skip,
    Store,
    FillAbort,
}

impl Counters {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            skips: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            fill_aborts: AtomicU64::new(0),
        }
    }

    pub fn record(&self, outcome: Outcome) {
        let (counter, name) = match outcome {
            Outcome::Hit => (&self.hits, "hit"),
            Outcome::Miss => (&self.misses, "miss"),
            Outcome::Skip => (&self.skips, "skip"),
            Outcome::Store => (&self.stores, "store"),
            Outcome::FillAbort => (&self.fill_aborts, "fill_abort"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(format!("{}_{name}_total", self.prefix)).increment(1);
    }

    pub fn snapshot(&self, store: StoreStats) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            fill_aborts: self.fill_aborts.load(Ordering::Relaxed),
            entries: store.entries,
            size_bytes: store.size,
            max_size_bytes: store.max_size,
            evictions: store.evictions,
        }
    }
}

/// Read-only snapshot of one cache.
///
/// The store figures are zero for a remote backend, which keeps no local
/// bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that bypassed the cache.
    pub skips: u64,
    pub stores: u64,
    pub fill_aborts: u64,
    pub entries: usize,
    pub size_bytes: usize,
    pub max_size_bytes: usize,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}
