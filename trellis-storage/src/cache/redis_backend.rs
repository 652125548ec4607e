//! Redis-backed [`CacheClient`].
//!
//! Values are stored with `SET .. EX`, so expiry is enforced by Redis.
//! Pattern invalidation walks the keyspace with `SCAN MATCH` and deletes
//! each batch; it never issues `KEYS`.

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use std::sync::RwLock;
use std::time::Duration;

use trellis_core::{CacheError, CacheResult, ConfigError};

use super::traits::{CacheClient, CacheStats};

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,
    /// `COUNT` hint for each `SCAN` step during pattern invalidation
    pub scan_count: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            scan_count: 500,
        }
    }
}

impl RedisConfig {
    /// Load from `TRELLIS_REDIS_URL` and `TRELLIS_REDIS_SCAN_COUNT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("TRELLIS_REDIS_URL").unwrap_or(defaults.url),
            scan_count: std::env::var("TRELLIS_REDIS_SCAN_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.scan_count),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan_count".to_string(),
                value: "0".to_string(),
                reason: "SCAN count must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> CacheResult<Pool> {
        Config::from_url(self.url.clone())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Backend {
                reason: format!("Failed to create Redis pool: {}", e),
            })
    }
}

/// Cache client over a `deadpool-redis` pool.
pub struct RedisCacheClient {
    pool: Pool,
    scan_count: u32,
    stats: RwLock<CacheStats>,
}

impl RedisCacheClient {
    pub fn new(pool: Pool, scan_count: u32) -> Self {
        Self {
            pool,
            scan_count,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn from_config(config: &RedisConfig) -> CacheResult<Self> {
        Ok(Self::new(config.create_pool()?, config.scan_count))
    }

    async fn connection(&self) -> CacheResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| CacheError::Backend {
            reason: format!("Redis connection failed: {}", e),
        })
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        // Stats are advisory; a poisoned lock only loses counters.
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }
}

fn backend(error: redis::RedisError) -> CacheError {
    CacheError::Backend {
        reason: error.to_string(),
    }
}

#[async_trait]
impl CacheClient for RedisCacheClient {
    async fn get_raw(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut connection = self.connection().await?;
        let value: Option<Vec<u8>> = connection.get(key).await.map_err(backend)?;
        if value.is_some() {
            self.record(|s| s.hits += 1);
        } else {
            self.record(|s| s.misses += 1);
        }
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let mut connection = self.connection().await?;
        // EX 0 is rejected by Redis.
        let seconds = ttl.as_secs().max(1);
        connection
            .set_ex::<_, _, ()>(key, value, seconds)
            .await
            .map_err(backend)?;
        self.record(|s| s.sets += 1);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut connection = self.connection().await?;
        let removed: u64 = connection.del(key).await.map_err(backend)?;
        self.record(|s| s.invalidations += removed);
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let mut connection = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut *connection)
                .await
                .map_err(backend)?;

            if !keys.is_empty() {
                let deleted: u64 = connection.del(&keys).await.map_err(backend)?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!(pattern, removed, "Redis pattern invalidation complete");
        self.record(|s| s.invalidations += removed);
        Ok(removed)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let mut connection = self.connection().await?;
        let entry_count: u64 = redis::cmd("DBSIZE")
            .query_async(&mut *connection)
            .await
            .map_err(backend)?;
        let stats = self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        Ok(CacheStats {
            entry_count,
            ..stats
        })
    }
}
