use crate::error::KvError;
use ahash::AHashMap;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Client for a remote key/value store holding serialized documents and
/// choice records.
///
/// None of the operations are conditional on a version: concurrent writers
/// may overwrite each other.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError>;

    /// Store unconditionally.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), KvError>;

    /// Store only if the key does not exist. Returns whether it was stored.
    async fn add(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, KvError>;

    /// Store only if the key exists. Returns whether it was stored.
    async fn replace(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, KvError>;

    /// Put `value` in front of the existing value, keeping its expiry.
    /// Returns false if the key does not exist.
    async fn prepend(&self, key: &str, value: Bytes) -> Result<bool, KvError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    async fn flush(&self) -> Result<(), KvError>;
}

struct Entry {
    value: Bytes,
    deadline: Instant,
}

/// Expired keys are purged after this many inserts.
const PURGE_INTERVAL: u64 = 1024;

/// In-process key/value store with expirations.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<AHashMap<String, Entry>>,
    inserts: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.deadline > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of a live key.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .and_then(|e| e.deadline.checked_duration_since(now))
            .filter(|ttl| !ttl.is_zero())
    }

    /// Drop every expired key. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.deadline > now);
        before - entries.len()
    }

    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> R) -> R {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.deadline <= Instant::now()) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }

    fn insert(&self, key: &str, value: Bytes, ttl: Duration) {
        let entry = Entry {
            value,
            deadline: Instant::now() + ttl,
        };
        self.entries.lock().insert(key.to_string(), entry);

        if self.inserts.fetch_add(1, Ordering::Relaxed) % PURGE_INTERVAL == PURGE_INTERVAL - 1 {
            self.purge_expired();
        }
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        Ok(self.with_live(key, |entry| entry.map(|e| e.value.clone())))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), KvError> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, KvError> {
        if self.with_live(key, |entry| entry.is_some()) {
            return Ok(false);
        }
        self.insert(key, value, ttl);
        Ok(true)
    }

    async fn replace(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, KvError> {
        Ok(self.with_live(key, |entry| match entry {
            Some(entry) => {
                entry.value = value;
                entry.deadline = Instant::now() + ttl;
                true
            }
            None => false,
        }))
    }

    async fn prepend(&self, key: &str, value: Bytes) -> Result<bool, KvError> {
        Ok(self.with_live(key, |entry| match entry {
            Some(entry) => {
                let mut joined = BytesMut::with_capacity(value.len() + entry.value.len());
                joined.extend_from_slice(&value);
                joined.extend_from_slice(&entry.value);
                entry.value = joined.freeze();
                true
            }
            None => false,
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let removed = self.entries.lock().remove(key);
        Ok(removed.is_some_and(|e| e.deadline > Instant::now()))
    }

    async fn flush(&self) -> Result<(), KvError> {
        self.entries.lock().clear();
        Ok(())
    }
}
