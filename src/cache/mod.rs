//! Named response caches and the strategies that fill them.
//!
//! - Caches captured responses per namespace, keyed by method + URL
//! - Keeps insertion order so eviction can drop the oldest writes first
//! - Offers cache-first, stale-while-revalidate and network-first strategies
//! - Serves cached copies when the network is unavailable

mod layer;
mod memory;
mod storage;
mod traits;

pub use layer::{CacheLayer, CachePolicy, Namespace};
pub use memory::MemoryStore;
pub use storage::SqliteStore;
pub use traits::{CacheResult, CacheSource, CacheStore, CachedEntry, StoredKey};
