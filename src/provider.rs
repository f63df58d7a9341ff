//! Host-facing cache provider interface
//!
//! A host may register several interchangeable cache providers. Each exposes
//! the same contract; [`NamespacedCache`] is one of them.

use async_trait::async_trait;
use serde_json::json;

use crate::store::Store;
use crate::{CacheError, NamespacedCache};

/// Display name of the namespaced cache provider.
pub const NAMESPACED_CACHE_NAME: &str = "Namespaced Cache";

/// Contract a host relies on for any cache backend.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Human readable name, shown by host registries
    fn name(&self) -> &'static str;

    /// Current settings of this provider
    fn settings(&self) -> serde_json::Value;

    async fn read(&self, hash: &str, namespace: Option<&str>)
    -> Result<Option<Vec<u8>>, CacheError>;

    async fn write(
        &self,
        hash: &str,
        data: &[u8],
        ttl_minutes: Option<u64>,
        namespace: Option<&str>,
    ) -> Result<(), CacheError>;

    async fn delete(&self, hash: Option<&str>, namespace: Option<&str>) -> Result<(), CacheError>;
}

#[async_trait]
impl<S: Store> CacheProvider for NamespacedCache<S> {
    fn name(&self) -> &'static str {
        NAMESPACED_CACHE_NAME
    }

    fn settings(&self) -> serde_json::Value {
        json!({
            "store": self.store().name(),
            "key_prefix": self.config().key_prefix,
            "compression": self.compressor().name(),
            "locking": self.has_lock(),
            "lock_timeout_ms": self.config().lock_timeout.as_millis() as u64,
        })
    }

    async fn read(
        &self,
        hash: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        NamespacedCache::read(self, hash, namespace).await
    }

    async fn write(
        &self,
        hash: &str,
        data: &[u8],
        ttl_minutes: Option<u64>,
        namespace: Option<&str>,
    ) -> Result<(), CacheError> {
        NamespacedCache::write(self, hash, data, ttl_minutes, namespace).await
    }

    async fn delete(&self, hash: Option<&str>, namespace: Option<&str>) -> Result<(), CacheError> {
        NamespacedCache::delete(self, hash, namespace).await
    }
}
