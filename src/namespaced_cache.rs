//! Namespaced cache over a flat store
//!
//! The backing store can only delete single keys or flush everything, so
//! namespaces are invalidated by rotating a version token instead of deleting
//! their keys:
//!
//! - each namespace has a version record, `ns:{namespace}`, holding its
//!   current token (the default namespace uses `ns`);
//! - entries live under `entry:{token}:{hash}`;
//! - deleting the version record makes the next access mint a new token, so
//!   every entry written under the old one becomes unreachable at once and
//!   lingers only until its TTL or the store's eviction removes it.
//!
//! Version records and entries use distinct key prefixes, so no caller
//! supplied namespace or hash can make one collide with the other.
//!
//! Nothing here is transactional. The token lookup and the entry operation
//! are separate round trips, and a write racing an invalidation lands either
//! under the old token (orphaned) or the new one (visible).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, warn};

use crate::lock::{Lock, LockGuard};
use crate::store::Store;
use crate::{CacheConfig, CacheError, Compressor};

/// Treat empty identifiers as absent.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// TTL for the store; `None` or zero minutes means no expiry.
fn ttl_from_minutes(ttl_minutes: Option<u64>) -> Option<Duration> {
    ttl_minutes
        .filter(|m| *m > 0)
        .map(|m| Duration::from_secs(m.saturating_mul(60)))
}

/// A fresh version token for `namespace`.
///
/// The random suffix keeps two invalidations within one clock tick from
/// minting the same token.
fn mint_token(namespace: Option<&str>) -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or_default();
    format!(
        "{}@{}.{:08x}",
        namespace.unwrap_or_default(),
        micros,
        rand::random::<u32>()
    )
}

struct NamespacedCacheInner<S: Store> {
    store: S,
    compressor: Box<dyn Compressor>,
    lock: Option<Arc<dyn Lock>>,
    config: CacheConfig,
}

/// Cache with compressed payloads, TTLs and namespace invalidation
pub struct NamespacedCache<S: Store> {
    inner: Arc<NamespacedCacheInner<S>>,
}

impl<S: Store> Clone for NamespacedCache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Store> NamespacedCache<S> {
    /// Create a new namespaced cache.
    ///
    /// # Arguments
    ///
    /// * `store` - Flat store holding version records and entries
    /// * `compressor` - Applied to every payload before it is stored
    /// * `lock` - Optional advisory lock taken on the hash while writing
    /// * `config` - Key prefix and lock timeout
    pub fn new(
        store: S,
        compressor: impl Compressor,
        lock: Option<Arc<dyn Lock>>,
        config: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(NamespacedCacheInner {
                store,
                compressor: Box::new(compressor),
                lock,
                config,
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub(crate) fn compressor(&self) -> &dyn Compressor {
        self.inner.compressor.as_ref()
    }

    pub(crate) fn has_lock(&self) -> bool {
        self.inner.lock.is_some()
    }

    fn version_key(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(namespace) => format!("{}ns:{}", self.inner.config.key_prefix, namespace),
            None => format!("{}ns", self.inner.config.key_prefix),
        }
    }

    fn entry_key(&self, token: &str, hash: &str) -> String {
        format!("{}entry:{}:{}", self.inner.config.key_prefix, token, hash)
    }

    /// The token stored in a version record, if the record holds a usable one.
    async fn stored_token(&self, version_key: &str) -> Option<String> {
        let raw = self.inner.store.get(version_key).await?;
        match String::from_utf8(raw) {
            Ok(token) if !token.is_empty() => Some(token),
            _ => {
                warn!(
                    "Malformed namespace version under {}. Deleting it.",
                    version_key
                );
                if let Err(e) = self.inner.store.delete(version_key).await {
                    warn!(
                        "Failed to delete malformed namespace version {}: {}",
                        version_key, e
                    );
                }
                None
            }
        }
    }

    /// Current version token of `namespace`, minting one if it has none.
    ///
    /// A missing version record is handled exactly like an invalidated
    /// namespace, so losing it (eviction, restart) only orphans entries.
    /// Fails if a minted token could not be persisted: anything keyed by an
    /// unpersisted token would be unreachable on the next lookup.
    async fn versioned_namespace(&self, namespace: Option<&str>) -> Result<String, CacheError> {
        let version_key = self.version_key(namespace);

        if let Some(token) = self.stored_token(&version_key).await {
            return Ok(token);
        }

        let minted = mint_token(namespace);
        let stored = self
            .inner
            .store
            .add(&version_key, minted.as_bytes(), None)
            .await
            .inspect_err(|e| {
                warn!(
                    "Failed to store namespace version for {}: {}",
                    version_key, e
                );
            })?;

        if stored {
            debug!("New namespace version {} for {}", minted, version_key);
            return Ok(minted);
        }

        match self.stored_token(&version_key).await {
            Some(winner) => {
                debug!(
                    "Namespace version for {} minted concurrently, using {}",
                    version_key, winner
                );
                Ok(winner)
            }
            None => {
                warn!(
                    "Namespace version for {} vanished after a concurrent mint",
                    version_key
                );
                Err(CacheError::Backend(format!(
                    "namespace version for {} could not be resolved",
                    version_key
                )))
            }
        }
    }

    /// Read the payload stored under `hash` in `namespace`.
    ///
    /// Returns `Ok(None)` on a miss, including when the backend is unreachable
    /// or the stored bytes cannot be decompressed.
    pub async fn read(
        &self,
        hash: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        if hash.is_empty() {
            return Err(CacheError::InvalidHash);
        }
        let namespace = non_empty(namespace);

        let token = match self.versioned_namespace(namespace).await {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    "Cannot resolve namespace version for {}: {}. Treating as a miss.",
                    hash, e
                );
                return Ok(None);
            }
        };
        let key = self.entry_key(&token, hash);

        let Some(stored) = self.inner.store.get(&key).await else {
            debug!("Cache miss for key: {}", key);
            // Clear whatever may still sit under the current version
            if let Err(e) = self.inner.store.delete(&key).await {
                debug!("Cleanup delete after miss failed for {}: {}", key, e);
            }
            return Ok(None);
        };

        match self.inner.compressor.decompress(&stored) {
            Ok(data) => {
                debug!("Cache hit for key: {}", key);
                Ok(Some(data))
            }
            Err(e) => {
                warn!(
                    "Failed to decompress cached value for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                if let Err(del_err) = self.inner.store.delete(&key).await {
                    warn!("Failed to delete corrupt entry {}: {}", key, del_err);
                }
                Ok(None)
            }
        }
    }

    /// Compress and store `data` under `hash` in `namespace`.
    ///
    /// `ttl_minutes` of `None` or `0` keeps the entry until it is deleted,
    /// invalidated or evicted. When a lock is configured the write is abandoned
    /// with [`CacheError::LockTimeout`] if another writer holds the hash for
    /// longer than the configured timeout.
    pub async fn write(
        &self,
        hash: &str,
        data: &[u8],
        ttl_minutes: Option<u64>,
        namespace: Option<&str>,
    ) -> Result<(), CacheError> {
        if hash.is_empty() {
            return Err(CacheError::InvalidHash);
        }
        let namespace = non_empty(namespace);

        let _guard = match self.inner.lock.as_deref() {
            Some(lock) => Some(
                LockGuard::acquire(lock, hash, self.inner.config.lock_timeout)
                    .await
                    .inspect_err(|_| warn!("Another writer holds {}. Skipping write.", hash))?,
            ),
            None => None,
        };

        let compressed = self.inner.compressor.compress(data).inspect_err(|e| {
            warn!("Failed to compress payload for {}: {}", hash, e);
        })?;

        // Replace rather than overwrite whatever the current version holds
        if let Err(e) = self.delete(Some(hash), namespace).await {
            warn!("Failed to clear previous entry for {}: {}", hash, e);
        }

        let token = self.versioned_namespace(namespace).await.inspect_err(|e| {
            error!("Cannot resolve namespace version for {}: {}", hash, e);
        })?;
        let key = self.entry_key(&token, hash);
        let ttl = ttl_from_minutes(ttl_minutes);

        self.inner
            .store
            .set(&key, &compressed, ttl)
            .await
            .inspect_err(|e| {
                error!(
                    "Failed to store key {} in {} (code: {}): {}",
                    key,
                    self.inner.store.name(),
                    e.code().unwrap_or("none"),
                    e
                );
            })?;

        debug!(
            "Stored {} bytes ({} compressed) under {}",
            data.len(),
            compressed.len(),
            key
        );
        Ok(())
    }

    /// Delete one entry, a whole namespace, or everything.
    ///
    /// - with a `hash`: only that entry in `namespace`;
    /// - with only a `namespace`: every entry of the namespace, by dropping its
    ///   version record;
    /// - with neither: flushes the whole store, across all namespaces.
    pub async fn delete(
        &self,
        hash: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<(), CacheError> {
        let namespace = non_empty(namespace);

        if let Some(hash) = non_empty(hash) {
            // Without a stored version nothing in the namespace is reachable
            let token = match self.versioned_namespace(namespace).await {
                Ok(token) => token,
                Err(e) => {
                    debug!("Nothing to delete for {}: {}", hash, e);
                    return Ok(());
                }
            };
            let key = self.entry_key(&token, hash);
            debug!("Deleting key: {}", key);
            return self.inner.store.delete(&key).await;
        }

        if let Some(namespace) = namespace {
            debug!("Invalidating namespace: {}", namespace);
            return self
                .inner
                .store
                .delete(&self.version_key(Some(namespace)))
                .await;
        }

        warn!("Flushing entire {} store", self.inner.store.name());
        self.inner.store.flush().await
    }
}
