//! nscache - Namespaced cache over a flat key-value store
//!
//! This library layers namespaces on top of a store that only offers
//! single-key get/set/delete and a global flush:
//! - Payloads are compressed before they are stored
//! - Entries may carry a TTL (in minutes; none means indefinite)
//! - Whole namespaces are invalidated in O(1) by rotating a version token
//!
//! Backends:
//! - `RedisStore`: keys spread over a pool of Redis servers
//! - `MemoryStore`: in-process Moka cache
//!
//! Writes can optionally take a best-effort advisory lock (`FileLock` or
//! `LocalLock`) on the hash being written.

pub mod compression;
mod config;
mod error;
pub mod lock;
mod memory_store;
mod namespaced_cache;
pub mod provider;
pub mod store;

pub use compression::{Compressor, NoCompression, ZlibCompressor};
pub use config::{CacheConfig, DEFAULT_SERVER, ServerDetails, ServerEndpoint};
pub use error::CacheError;
pub use lock::{FileLock, LocalLock, Lock, LockGuard};
pub use memory_store::MemoryStore;
pub use namespaced_cache::NamespacedCache;
pub use provider::{CacheProvider, NAMESPACED_CACHE_NAME};
pub use store::{RedisStore, Store};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
