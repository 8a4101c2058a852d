//! Upstream response caching with TTL expiry, LRU eviction and single-flight fills.

pub mod inflight;
pub mod store;

pub use inflight::{Coalescer, FetchRole};
pub use store::{CacheStats, CacheStore};
