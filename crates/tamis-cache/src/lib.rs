//! Response caching core of the tamis gateway.
//!
//! [`HttpCache`] sits in front of a [`ResourceLoader`] and serves GET
//! responses from memory (or a remote key/value backend) according to the
//! HTTP caching rules, filling the cache from the same upstream stream the
//! client receives. [`FilterCache`] does the same for the output of content
//! filters.

pub mod age;
pub mod body;
pub mod choice;
pub mod codec;
pub mod document;
pub mod error;
pub mod filter_cache;
pub mod heap;
pub mod http_cache;
pub mod kv;
pub mod loader;
pub mod remote;
pub mod resp;
pub mod rfc;
pub mod stats;

#[cfg(test)]
mod testing;

pub use age::AgeLimiter;
pub use body::Body;
pub use document::{CacheInfo, Document, VaryMap};
pub use error::{BodyError, DecodeError, FillError, KvError, LoaderError};
pub use filter_cache::{FilterCache, FilterCacheConfig};
pub use http_cache::{HttpCache, HttpCacheConfig};
pub use kv::{KvClient, MemoryKv};
pub use loader::{Request, ResourceAddress, ResourceLoader, Response};
pub use resp::RespKv;
pub use stats::CacheStats;
