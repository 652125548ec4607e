//! Cache-aside building blocks: client contract, key derivation, backends.

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod traits;

pub use keys::{canonical_id, escape_glob, escape_segment, CacheKeyBuilder};
pub use memory::{glob_to_regex, CacheEntry, EntryState, InMemoryCacheClient};
#[cfg(feature = "redis")]
pub use redis_backend::{RedisCacheClient, RedisConfig};
pub use traits::{CacheClient, CacheStats};
