//! Byte-size-bounded LRU container used by the tamis caches.
//!
//! Items are stored behind shared handles, grouped by key into variants and
//! evicted by total byte size rather than entry count.

pub mod arena;
pub mod lru;
pub mod sharded;
pub mod traits;

pub use lru::SizedLru;
pub use sharded::ShardedStore;
pub use traits::{CacheItem, StoreStats};
