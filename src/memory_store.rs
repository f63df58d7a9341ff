//! In-process store backed by a Moka cache
//!
//! Honors per-entry TTLs through a [`moka::Expiry`] policy, so it behaves like
//! a single remote server for single-instance deployments and tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;

use crate::CacheError;
use crate::store::{Store, ttl_secs};

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Arc<[u8]>,
    ttl: Option<Duration>,
}

impl StoredValue {
    fn new(value: &[u8], ttl: Option<Duration>) -> Self {
        Self {
            bytes: Arc::from(value),
            ttl: ttl_secs(ttl).map(Duration::from_secs),
        }
    }
}

struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    // A replaced value carries its own TTL; the old deadline no longer applies.
    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// Store held in process memory
#[derive(Clone)]
pub struct MemoryStore {
    cache: Cache<String, StoredValue>,
}

impl MemoryStore {
    /// Entry bound used by [`MemoryStore::default`].
    pub const DEFAULT_MAX_CAPACITY: u64 = 10_000;

    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();

        Self { cache }
    }

    /// Whether `key` is currently present. Does not count as a read for expiry.
    pub fn contains_key(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Snapshot of the live keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.cache.iter().map(|(k, _)| k.as_ref().clone()).collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_CAPACITY)
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.get(key).await.map(|v| v.bytes.to_vec())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        self.cache
            .insert(key.to_owned(), StoredValue::new(value, ttl))
            .await;
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let entry = self
            .cache
            .entry(key.to_owned())
            .or_insert_with(async { StoredValue::new(value, ttl) })
            .await;
        Ok(entry.is_fresh())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        Ok(())
    }
}
