//! Flat key-value store adapter
//!
//! The [`Store`] trait is the only thing the namespaced cache knows about its
//! backend: flat get/set/add/delete over opaque byte strings plus an
//! unscoped flush. [`RedisStore`] spreads keys over a pool of servers the
//! way memcache clients do, hashing each key to exactly one endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{CacheError, ServerDetails, ServerEndpoint};

/// Flat byte store used by the namespaced cache.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Display name of the backend
    fn name(&self) -> &'static str;

    /// Fetch raw bytes. Transport failures are reported as a miss.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store raw bytes. `None` or a zero TTL stores indefinitely.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Store raw bytes only if the key is absent. Returns `false` if it existed.
    async fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>)
    -> Result<bool, CacheError>;

    /// Remove a single key. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every key from every server.
    async fn flush(&self) -> Result<(), CacheError>;
}

/// Whole seconds for the backend, `None` meaning no expiry.
///
/// Sub-second TTLs round up to one second rather than becoming indefinite.
pub(crate) fn ttl_secs(ttl: Option<Duration>) -> Option<u64> {
    ttl.filter(|d| !d.is_zero()).map(|d| d.as_secs().max(1))
}

/// Pick the server owning `key`. Stable across processes.
fn server_index(key: &str, pool_size: usize) -> usize {
    (seahash::hash(key.as_bytes()) % pool_size as u64) as usize
}

/// Bound on establishing a connection to one server.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct RedisServer {
    endpoint: ServerEndpoint,
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisServer {
    /// Shared connection, established on first use.
    ///
    /// A failed attempt leaves the server unconnected so the next call retries.
    async fn connection(&self, connect_timeout: Duration) -> Result<ConnectionManager, CacheError> {
        self.conn
            .get_or_try_init(|| async {
                let conn = tokio::time::timeout(
                    connect_timeout,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                .map_err(|_| {
                    CacheError::Backend(format!("timed out connecting to {}", self.endpoint))
                })??;
                info!("Connected to cache server {}", self.endpoint);
                Ok::<_, CacheError>(conn)
            })
            .await
            .cloned()
            .inspect_err(|e| warn!("Cannot connect to cache server {}: {}", self.endpoint, e))
    }
}

/// Store backed by a pool of Redis servers
///
/// Servers are connected lazily, so an endpoint that is down at startup only
/// affects the keys that hash to it.
#[derive(Clone)]
pub struct RedisStore {
    servers: Arc<[RedisServer]>,
    connect_timeout: Duration,
}

impl RedisStore {
    /// Build the server pool. No connection is made until a key needs one.
    ///
    /// Fails with [`CacheError::Configuration`] if the list has no usable
    /// endpoint.
    pub fn new(details: &ServerDetails) -> Result<Self, CacheError> {
        let servers = details
            .endpoints()?
            .into_iter()
            .map(|endpoint| {
                let client = redis::Client::open(endpoint.url())?;
                Ok(RedisServer {
                    endpoint,
                    client,
                    conn: OnceCell::new(),
                })
            })
            .collect::<Result<Vec<_>, CacheError>>()?;

        Ok(Self {
            servers: servers.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &ServerEndpoint> {
        self.servers.iter().map(|s| &s.endpoint)
    }

    fn server_for(&self, key: &str) -> &RedisServer {
        &self.servers[server_index(key, self.servers.len())]
    }
}

#[async_trait]
impl Store for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let server = self.server_for(key);
        let mut conn = server.connection(self.connect_timeout).await.ok()?;

        match conn.get::<_, Option<Vec<u8>>>(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "GET error for key {} on {} ({}). Treating as a miss.",
                    key, server.endpoint, e
                );
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let server = self.server_for(key);
        let mut conn = server.connection(self.connect_timeout).await?;

        let result = match ttl_secs(ttl) {
            Some(seconds) => conn.set_ex::<_, _, ()>(key, value, seconds).await,
            None => conn.set::<_, _, ()>(key, value).await,
        };

        result.map_err(|e| {
            warn!("SET error for key {} on {}: {}", key, server.endpoint, e);
            CacheError::Transport(e)
        })
    }

    async fn add(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let server = self.server_for(key);
        let mut conn = server.connection(self.connect_timeout).await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(seconds) = ttl_secs(ttl) {
            cmd.arg("EX").arg(seconds);
        }

        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(|e| {
            warn!("SET NX error for key {} on {}: {}", key, server.endpoint, e);
            CacheError::Transport(e)
        })?;

        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let server = self.server_for(key);
        let mut conn = server.connection(self.connect_timeout).await?;

        conn.del::<_, ()>(key).await.map_err(|e| {
            warn!("DEL error for key {} on {}: {}", key, server.endpoint, e);
            CacheError::Transport(e)
        })
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let results = futures::future::join_all(self.servers.iter().map(|server| async move {
            let mut conn = server.connection(self.connect_timeout).await?;
            redis::cmd("FLUSHDB")
                .query_async::<()>(&mut conn)
                .await
                .map_err(CacheError::Transport)
        }))
        .await;

        let mut first_error = None;
        for (server, result) in self.servers.iter().zip(results) {
            match result {
                Ok(()) => debug!("Flushed cache server {}", server.endpoint),
                Err(e) => {
                    warn!("FLUSHDB error on {}: {}", server.endpoint, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs() {
        assert_eq!(ttl_secs(None), None);
        assert_eq!(ttl_secs(Some(Duration::ZERO)), None);
        assert_eq!(ttl_secs(Some(Duration::from_millis(200))), Some(1));
        assert_eq!(ttl_secs(Some(Duration::from_secs(600))), Some(600));
    }

    #[test]
    fn test_server_index_is_stable_and_in_range() {
        for pool_size in 1..8 {
            for key in ["users", "entry:users@1.0a:u42", "", "ns:orders"] {
                let idx = server_index(key, pool_size);
                assert!(idx < pool_size);
                assert_eq!(idx, server_index(key, pool_size));
            }
        }
        assert_eq!(server_index("anything", 1), 0);
    }

    #[test]
    fn test_server_index_spreads_keys() {
        let mut used = [false; 4];
        for i in 0..64 {
            used[server_index(&format!("key-{}", i), 4)] = true;
        }
        assert!(used.iter().all(|u| *u));
    }

    #[test]
    fn test_new_without_servers_is_configuration_error() {
        let details = ServerDetails::new(Vec::<String>::new());
        assert!(matches!(
            RedisStore::new(&details),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn test_new_with_malformed_server_is_configuration_error() {
        let details = ServerDetails::new(["no-port-here"]);
        assert!(matches!(
            RedisStore::new(&details),
            Err(CacheError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_degrades_per_operation() {
        // Nothing listens on port 1; building the pool must still succeed
        let details = ServerDetails::new(["127.0.0.1:1", "127.0.0.1:2"]);
        let store = RedisStore::new(&details)
            .unwrap()
            .with_connect_timeout(Duration::from_millis(300));
        assert_eq!(store.endpoints().count(), 2);

        assert_eq!(store.get("k").await, None);
        assert!(store.set("k", b"v", None).await.is_err());
        assert!(store.flush().await.is_err());
    }
}
