use crate::arena::{Arena, Node};
use crate::traits::{CacheItem, StoreStats};
use ahash::AHashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Byte-size-bounded LRU container.
///
/// One key maps to a list of *variants* (most recently inserted first). Lookups
/// walk the variant list with a caller-supplied match predicate; inserts may
/// replace the first variant the predicate accepts. Every hit promotes the
/// node to the head of the list, evictions happen from the tail until the new
/// item fits into `max_size`.
///
/// Expired or invalid items are dropped lazily on lookup and eagerly by
/// [`SizedLru::expire`].
pub struct SizedLru<I> {
    arena: Arena<I>,
    map: AHashMap<String, Vec<u32>>,
    size: usize,
    max_size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<I: CacheItem> SizedLru<I> {
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "store size must be > 0");
        Self {
            arena: Arena::with_capacity(64),
            map: AHashMap::new(),
            size: 0,
            max_size,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Look up the first live variant of `key`.
    pub fn get(&mut self, key: &str, now: SystemTime) -> Option<Arc<I>> {
        self.get_match(key, now, |_| true)
    }

    /// Look up the first live variant of `key` accepted by `matches`.
    pub fn get_match<F>(&mut self, key: &str, now: SystemTime, mut matches: F) -> Option<Arc<I>>
    where
        F: FnMut(&I) -> bool,
    {
        let Some(indices) = self.map.get(key) else {
            self.misses += 1;
            return None;
        };

        let mut stale = Vec::new();
        let mut found = None;
        for &index in indices {
            let Some(node) = self.arena.get(index) else {
                continue;
            };
            if node.item.is_expired(now) {
                stale.push(index);
            } else if found.is_none() && matches(node.item.as_ref()) {
                found = Some(index);
            }
        }

        for index in stale {
            self.unlink(index);
        }

        match found {
            Some(index) => {
                self.hits += 1;
                self.arena.move_to_head(index);
                self.arena.get(index).map(|n| Arc::clone(&n.item))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert a new variant for `key`. Returns false if the item can never fit.
    pub fn put(&mut self, key: String, item: I) -> bool {
        self.put_match(key, item, |_| false)
    }

    /// Insert `item`, replacing the first existing variant of `key` accepted by
    /// `replaces`. Returns false (and stores nothing) if the item alone
    /// exceeds the store size.
    pub fn put_match<F>(&mut self, key: String, item: I, mut replaces: F) -> bool
    where
        F: FnMut(&I) -> bool,
    {
        let size = item.size();
        if size > self.max_size {
            return false;
        }

        let old = self.map.get(&key).and_then(|indices| {
            indices
                .iter()
                .copied()
                .find(|&i| self.arena.get(i).is_some_and(|n| replaces(n.item.as_ref())))
        });
        if let Some(index) = old {
            self.unlink(index);
        }

        while self.size + size > self.max_size {
            match self.arena.pop_tail() {
                Some((index, node)) => {
                    self.forget(index, &node);
                    self.evictions += 1;
                }
                None => break,
            }
        }

        let index = self
            .arena
            .push_head(Node::new(key.clone(), Arc::new(item), size));
        self.size += size;
        self.map.entry(key).or_default().insert(0, index);
        true
    }

    /// Remove every variant of `key`. Returns how many were removed.
    pub fn remove(&mut self, key: &str) -> usize {
        self.remove_match(key, |_| true)
    }

    /// Remove all variants of `key` accepted by `matches`.
    pub fn remove_match<F>(&mut self, key: &str, mut matches: F) -> usize
    where
        F: FnMut(&I) -> bool,
    {
        let Some(indices) = self.map.get(key) else {
            return 0;
        };
        let doomed: Vec<u32> = indices
            .iter()
            .copied()
            .filter(|&i| self.arena.get(i).is_some_and(|n| matches(n.item.as_ref())))
            .collect();
        for &index in &doomed {
            self.unlink(index);
        }
        doomed.len()
    }

    /// Remove exactly this item (pointer identity) from `key`.
    pub fn remove_item(&mut self, key: &str, item: &Arc<I>) -> bool {
        let found = self.map.get(key).and_then(|indices| {
            indices
                .iter()
                .copied()
                .find(|&i| self.arena.get(i).is_some_and(|n| Arc::ptr_eq(&n.item, item)))
        });
        match found {
            Some(index) => {
                self.unlink(index);
                true
            }
            None => false,
        }
    }

    /// Remove every item accepted by `matches`, regardless of key.
    pub fn remove_if<F>(&mut self, mut matches: F) -> usize
    where
        F: FnMut(&str, &I) -> bool,
    {
        let doomed: Vec<u32> = self
            .arena
            .indices()
            .into_iter()
            .filter(|&i| {
                self.arena
                    .get(i)
                    .is_some_and(|n| matches(n.key.as_str(), n.item.as_ref()))
            })
            .collect();
        for &index in &doomed {
            self.unlink(index);
        }
        doomed.len()
    }

    /// Drop all items that expired before `now`.
    pub fn expire(&mut self, now: SystemTime) -> usize {
        self.remove_if(|_, item| item.is_expired(now))
    }

    /// Drop everything.
    pub fn flush(&mut self) {
        self.arena.clear();
        self.map.clear();
        self.size = 0;
    }

    /// Number of stored variants across all keys.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Bytes currently charged.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries: self.arena.len(),
            size: self.size,
            max_size: self.max_size,
        }
    }

    fn unlink(&mut self, index: u32) {
        if let Some(node) = self.arena.remove(index) {
            self.forget(index, &node);
        }
    }

    /// Bookkeeping for a node that already left the arena.
    fn forget(&mut self, index: u32, node: &Node<I>) {
        self.size -= node.size;
        if let Some(indices) = self.map.get_mut(&node.key) {
            indices.retain(|&i| i != index);
            if indices.is_empty() {
                self.map.remove(&node.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    struct Item {
        body: Bytes,
        variant: &'static str,
        expires: SystemTime,
        tag: Option<&'static str>,
    }

    impl CacheItem for Item {
        fn size(&self) -> usize {
            self.body.len()
        }

        fn expires(&self) -> SystemTime {
            self.expires
        }

        fn tag(&self) -> Option<&str> {
            self.tag
        }
    }

    fn item(size: usize, variant: &'static str) -> Item {
        Item {
            body: Bytes::from(vec![b'x'; size]),
            variant,
            expires: SystemTime::now() + Duration::from_secs(60),
            tag: None,
        }
    }

    fn now() -> SystemTime {
        SystemTime::now()
    }

    #[test]
    fn basic_put_and_get() {
        let mut store = SizedLru::new(100);
        assert!(store.put("a".into(), item(10, "")));
        assert!(store.put("b".into(), item(10, "")));

        assert!(store.get("a", now()).is_some());
        assert!(store.get("b", now()).is_some());
        assert!(store.get("c", now()).is_none());
        assert_eq!(store.size(), 20);
    }

    #[test]
    fn evicts_least_recently_used_by_size() {
        let mut store = SizedLru::new(30);
        store.put("a".into(), item(10, ""));
        store.put("b".into(), item(10, ""));
        store.put("c".into(), item(10, ""));

        // Access "a" to make it recently used
        store.get("a", now());

        // Inserting 15 bytes must evict "b" and "c" (both older than "a")
        store.put("d".into(), item(15, ""));
        assert!(store.get("a", now()).is_some());
        assert!(store.get("b", now()).is_none());
        assert!(store.get("c", now()).is_none());
        assert!(store.get("d", now()).is_some());
        assert!(store.size() <= 30);
        assert_eq!(store.stats().evictions, 2);
    }

    #[test]
    fn rejects_item_larger_than_store() {
        let mut store = SizedLru::new(10);
        store.put("a".into(), item(5, ""));
        assert!(!store.put("huge".into(), item(11, "")));
        // Nothing was evicted for the rejected item
        assert!(store.get("a", now()).is_some());
    }

    #[test]
    fn variants_share_a_key() {
        let mut store = SizedLru::new(100);
        store.put("k".into(), item(1, "gzip"));
        store.put("k".into(), item(1, "br"));

        let hit = store.get_match("k", now(), |i| i.variant == "gzip").unwrap();
        assert_eq!(hit.variant, "gzip");
        let hit = store.get_match("k", now(), |i| i.variant == "br").unwrap();
        assert_eq!(hit.variant, "br");
        assert!(store.get_match("k", now(), |i| i.variant == "zstd").is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn put_match_replaces_matching_variant() {
        let mut store = SizedLru::new(100);
        store.put("k".into(), item(4, "gzip"));
        store.put("k".into(), item(4, "br"));
        store.put_match("k".into(), item(8, "gzip"), |i| i.variant == "gzip");

        assert_eq!(store.len(), 2);
        assert_eq!(store.size(), 12);
        let hit = store.get_match("k", now(), |i| i.variant == "gzip").unwrap();
        assert_eq!(hit.body.len(), 8);
    }

    #[test]
    fn expired_items_never_match() {
        let mut store = SizedLru::new(100);
        let mut old = item(10, "");
        old.expires = SystemTime::now() - Duration::from_secs(1);
        store.put("old".into(), old);

        assert!(store.get("old", now()).is_none());
        assert_eq!(store.len(), 0);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn expire_sweeps_everything_stale() {
        let mut store = SizedLru::new(100);
        let mut old = item(10, "");
        old.expires = SystemTime::now() - Duration::from_secs(1);
        store.put("old".into(), old);
        store.put("fresh".into(), item(10, ""));

        assert_eq!(store.expire(now()), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("fresh", now()).is_some());
    }

    #[test]
    fn remove_item_uses_identity() {
        let mut store = SizedLru::new(100);
        store.put("k".into(), item(1, "a"));
        store.put("k".into(), item(1, "b"));

        let a = store.get_match("k", now(), |i| i.variant == "a").unwrap();
        assert!(store.remove_item("k", &a));
        assert!(!store.remove_item("k", &a));
        assert_eq!(store.len(), 1);
        // The borrowed handle outlives its removal from the store
        assert_eq!(a.variant, "a");
    }

    #[test]
    fn remove_if_by_tag() {
        let mut store = SizedLru::new(100);
        let mut tagged = item(1, "");
        tagged.tag = Some("site-1");
        store.put("a".into(), tagged);
        store.put("b".into(), item(1, ""));

        assert_eq!(store.remove_if(|_, i| i.tag() == Some("site-1")), 1);
        assert!(store.get("a", now()).is_none());
        assert!(store.get("b", now()).is_some());
    }

    #[test]
    fn flush_resets_accounting() {
        let mut store = SizedLru::new(100);
        store.put("a".into(), item(10, ""));
        store.put("b".into(), item(10, ""));
        store.flush();
        assert!(store.is_empty());
        assert_eq!(store.size(), 0);
        assert!(store.get("a", now()).is_none());
    }

    #[test]
    fn stats_tracking() {
        let mut store = SizedLru::new(20);
        store.put("a".into(), item(10, ""));
        store.get("a", now()); // hit
        store.get("z", now()); // miss
        store.put("b".into(), item(10, ""));
        store.put("c".into(), item(10, "")); // eviction

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.size, 20);
        assert_eq!(stats.max_size, 20);
    }
}
