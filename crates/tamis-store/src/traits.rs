use std::time::SystemTime;

/// An entry that can live in a [`SizedLru`](crate::lru::SizedLru).
///
/// The store only ever hands out shared handles (`Arc<I>`), so an item is
/// destroyed when the store has dropped it *and* the last borrower released
/// its handle.
pub trait CacheItem: Send + Sync {
    /// Bytes charged against the store budget. Sampled once at insert time.
    fn size(&self) -> usize;

    /// Absolute point in time after which the item is never returned.
    fn expires(&self) -> SystemTime;

    /// Optional tag used for grouped invalidation.
    fn tag(&self) -> Option<&str> {
        None
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires() < now
    }
}

/// Snapshot of store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub size: usize,
    pub max_size: usize,
}

impl StoreStats {
    /// Accumulate another snapshot into this one.
    pub fn merge(&mut self, other: &StoreStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
        self.entries += other.entries;
        self.size += other.size;
        self.max_size += other.max_size;
    }
}
