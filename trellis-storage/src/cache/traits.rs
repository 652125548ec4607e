//! Cache client trait and statistics.
//!
//! The repository only needs get/set/delete/delete-by-pattern with a TTL.
//! Values are stored as serialized bytes; the typed `get`/`set` helpers
//! encode with `serde_json`.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use trellis_core::{CacheError, CacheResult};

/// Cache client contract.
///
/// Pattern semantics follow Redis glob matching: `*` matches any run of
/// characters, `?` matches one character and `\` escapes the next one.
/// Implementations must be safe to share across concurrent calls.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Get the raw bytes stored under `key`, if present and not expired.
    async fn get_raw(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store raw bytes under `key` for `ttl`.
    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    /// Delete one key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete every key matching `pattern`, returning how many were removed.
    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> CacheResult<CacheStats>;

    /// Get and decode a value.
    async fn get<T>(&self, key: &str) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        match self.get_raw(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                CacheError::Serialization {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            }),
            None => Ok(None),
        }
    }

    /// Encode and store a value.
    async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set_raw(key, bytes, ttl).await
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, including expired entries.
    pub misses: u64,
    /// Number of values stored.
    pub sets: u64,
    /// Number of entries removed by `delete` or `delete_by_pattern`.
    pub invalidations: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
