use crate::lru::SizedLru;
use crate::traits::{CacheItem, StoreStats};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;

/// Upper bound on the number of shards. Always a power of two.
const MAX_SHARDS: usize = 64;

/// Thread-safe sharded wrapper around [`SizedLru`].
///
/// Keys are distributed across independent shards, each behind its own
/// `Mutex` with an equal share of the byte budget. All variants of one key
/// live in the same shard, so variant matching never crosses a lock.
///
/// The shard count shrinks for small stores so that every shard can still
/// hold several items of `max_item_size`.
pub struct ShardedStore<I> {
    shards: Box<[Mutex<SizedLru<I>>]>,
    mask: u64,
}

impl<I: CacheItem> ShardedStore<I> {
    pub fn new(max_size: usize, max_item_size: usize) -> Self {
        let count = shard_count(max_size, max_item_size);
        let per_shard = (max_size / count).max(1);
        let shards: Vec<Mutex<SizedLru<I>>> = (0..count)
            .map(|_| Mutex::new(SizedLru::new(per_shard)))
            .collect();

        Self {
            shards: shards.into_boxed_slice(),
            mask: (count as u64) - 1,
        }
    }

    /// Hash a key and return the shard index.
    #[inline]
    fn shard(&self, key: &str) -> &Mutex<SizedLru<I>> {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        &self.shards[(hash & self.mask) as usize]
    }

    pub fn get_match<F>(&self, key: &str, now: SystemTime, matches: F) -> Option<Arc<I>>
    where
        F: FnMut(&I) -> bool,
    {
        self.shard(key).lock().get_match(key, now, matches)
    }

    pub fn put_match<F>(&self, key: String, item: I, replaces: F) -> bool
    where
        F: FnMut(&I) -> bool,
    {
        self.shard(&key).lock().put_match(key, item, replaces)
    }

    pub fn remove_match<F>(&self, key: &str, matches: F) -> usize
    where
        F: FnMut(&I) -> bool,
    {
        self.shard(key).lock().remove_match(key, matches)
    }

    pub fn remove_item(&self, key: &str, item: &Arc<I>) -> bool {
        self.shard(key).lock().remove_item(key, item)
    }

    /// Remove matching items from every shard.
    pub fn remove_if<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&str, &I) -> bool,
    {
        self.shards
            .iter()
            .map(|s| s.lock().remove_if(&mut matches))
            .sum()
    }

    pub fn expire(&self, now: SystemTime) -> usize {
        self.shards.iter().map(|s| s.lock().expire(now)).sum()
    }

    pub fn flush(&self) {
        for shard in self.shards.iter() {
            shard.lock().flush();
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Total number of variants across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    /// Aggregate statistics across all shards.
    pub fn stats(&self) -> StoreStats {
        let mut total = StoreStats::default();
        for shard in self.shards.iter() {
            total.merge(&shard.lock().stats());
        }
        total
    }
}

fn shard_count(max_size: usize, max_item_size: usize) -> usize {
    let wanted = max_size / max_item_size.max(1).saturating_mul(4);
    let mut count = 1;
    while count * 2 <= wanted && count * 2 <= MAX_SHARDS {
        count *= 2;
    }
    count
}
