//! Trellis Storage
//!
//! Cache-aside repository over a relational store:
//! - `store`: store contract, in-memory and PostgreSQL backends
//! - `cache`: cache client contract, key derivation, in-memory and Redis backends
//! - `repository`: cache-through reads and invalidating writes per entity type
//! - `telemetry`: tracing subscriber setup

pub mod cache;
pub mod repository;
pub mod store;
pub mod telemetry;

pub use cache::{
    canonical_id, escape_glob, escape_segment, glob_to_regex, CacheClient, CacheEntry, CacheKeyBuilder,
    CacheStats, EntryState, InMemoryCacheClient,
};
#[cfg(feature = "redis")]
pub use cache::{RedisCacheClient, RedisConfig};
pub use repository::{Page, ReadSource, Repository, RepositoryRead};
pub use store::{into_row, InMemoryStore, Row, Store};
#[cfg(feature = "postgres")]
pub use store::{DbConfig, PgStore};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
