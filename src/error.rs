//! Cache error types

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Transport(#[from] RedisError),

    #[error("Store error: {0}")]
    Backend(String),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Timed out acquiring lock for {key}")]
    LockTimeout { key: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache hash must not be empty")]
    InvalidHash,
}

impl CacheError {
    /// Backend result code for transport failures, when the server sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            CacheError::Transport(e) => e.code(),
            _ => None,
        }
    }
}
