//! Cache TTL and slow-query configuration.
//!
//! Loaded from environment variables with defaults suitable for
//! development, following the `from_env` / `with_*` / `validate` pattern.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;

/// Prefix for per-entity TTL overrides, e.g. `TRELLIS_CACHE_TTL_EXERCISE=60`.
pub const ENTITY_TTL_ENV_PREFIX: &str = "TRELLIS_CACHE_TTL_";

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Cache TTL policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether reads go through the cache at all.
    pub enabled: bool,
    /// TTL for entity types without an override.
    pub default_ttl: Duration,
    /// Per-entity TTL overrides keyed by lowercase entity name.
    pub entity_ttls: HashMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(300), // 5 minutes
            entity_ttls: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from environment variables.
    ///
    /// - `TRELLIS_CACHE_ENABLED`: "false" disables caching (default: true)
    /// - `TRELLIS_CACHE_DEFAULT_TTL_SECS`: default TTL (default: 300)
    /// - `TRELLIS_CACHE_TTL_<ENTITY>`: TTL in seconds for one entity type
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit set of variables.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        for (name, value) in vars {
            if name == "TRELLIS_CACHE_ENABLED" {
                config.enabled = value.to_lowercase() != "false";
            } else if name == "TRELLIS_CACHE_DEFAULT_TTL_SECS" {
                if let Ok(secs) = value.parse() {
                    config.default_ttl = Duration::from_secs(secs);
                }
            } else if let Some(entity) = name.strip_prefix(ENTITY_TTL_ENV_PREFIX) {
                if let Ok(secs) = value.parse() {
                    config
                        .entity_ttls
                        .insert(entity.to_lowercase(), Duration::from_secs(secs));
                }
            }
        }
        config
    }

    /// Enable or disable caching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Override the TTL for one entity type.
    pub fn with_entity_ttl(mut self, entity: &str, ttl: Duration) -> Self {
        self.entity_ttls.insert(entity.to_lowercase(), ttl);
        self
    }

    /// TTL for an entity type; the entity override takes precedence.
    pub fn ttl_for(&self, entity: &str) -> Duration {
        self.entity_ttls
            .get(&entity.to_lowercase())
            .copied()
            .unwrap_or(self.default_ttl)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "cache.default_ttl".to_string(),
                value: format!("{:?}", self.default_ttl),
                reason: "default_ttl must be positive".to_string(),
            });
        }
        if let Some((entity, ttl)) = self.entity_ttls.iter().find(|(_, ttl)| ttl.is_zero()) {
            return Err(ConfigError::InvalidValue {
                field: format!("cache.entity_ttls.{}", entity),
                value: format!("{:?}", ttl),
                reason: "entity TTL must be positive".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// SLOW QUERY THRESHOLDS
// ============================================================================

/// Kind of repository operation, for threshold selection and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    FindWithFilters,
    FindById,
    Write,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindWithFilters => "find_with_filters",
            Self::FindById => "find_by_id",
            Self::Write => "write",
        }
    }
}

/// Duration above which a store round-trip is logged as slow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowQueryThresholds {
    pub find_with_filters: Duration,
    pub find_by_id: Duration,
    pub write: Duration,
}

impl Default for SlowQueryThresholds {
    fn default() -> Self {
        Self {
            find_with_filters: Duration::from_millis(200),
            find_by_id: Duration::from_millis(100),
            write: Duration::from_millis(500),
        }
    }
}

impl SlowQueryThresholds {
    /// Load from environment variables.
    ///
    /// - `TRELLIS_SLOW_QUERY_FILTERS_MS` (default: 200)
    /// - `TRELLIS_SLOW_QUERY_BY_ID_MS` (default: 100)
    /// - `TRELLIS_SLOW_QUERY_WRITE_MS` (default: 500)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |name: &str, fallback: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            find_with_filters: millis("TRELLIS_SLOW_QUERY_FILTERS_MS", defaults.find_with_filters),
            find_by_id: millis("TRELLIS_SLOW_QUERY_BY_ID_MS", defaults.find_by_id),
            write: millis("TRELLIS_SLOW_QUERY_WRITE_MS", defaults.write),
        }
    }

    pub fn for_operation(&self, kind: OperationKind) -> Duration {
        match kind {
            OperationKind::FindWithFilters => self.find_with_filters,
            OperationKind::FindById => self.find_by_id,
            OperationKind::Write => self.write,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in [
            OperationKind::FindWithFilters,
            OperationKind::FindById,
            OperationKind::Write,
        ] {
            let threshold = self.for_operation(kind);
            if threshold.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: format!("slow_queries.{}", kind.as_str()),
                    value: format!("{:?}", threshold),
                    reason: "threshold must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// REPOSITORY CONFIGURATION
// ============================================================================

/// Configuration consumed by the generic repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub cache: CacheConfig,
    pub slow_queries: SlowQueryThresholds,
}

impl RepositoryConfig {
    pub fn from_env() -> Self {
        Self {
            cache: CacheConfig::from_env(),
            slow_queries: SlowQueryThresholds::from_env(),
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_slow_queries(mut self, slow_queries: SlowQueryThresholds) -> Self {
        self.slow_queries = slow_queries;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.slow_queries.validate()
    }
}
