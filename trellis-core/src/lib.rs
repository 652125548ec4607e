//! Trellis Core - Identifiers, Relations and Errors
//!
//! Pure types shared by the query builder and the storage layer:
//! identifier normalization across integer and UUID keys, the
//! relationship registry, filter specifications, configuration and the
//! error taxonomy. This crate performs no I/O.

pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod identifier;
pub mod relations;

pub use config::{CacheConfig, OperationKind, RepositoryConfig, SlowQueryThresholds};
pub use entity::Entity;
pub use error::{
    CacheError, CacheResult, ConfigError, StoreError, StoreResult, TrellisError, TrellisResult,
    ValidationError,
};
pub use filter::{FilterSpec, SortDirection, DEFAULT_LIMIT};
pub use identifier::{
    equal, id_condition, is_id_column, is_numeric, is_uuid, prepare_for_query,
    to_where_condition, IdKind, Identifier, QueryValue, WhereCondition,
};
pub use relations::{
    Cardinality, EntityInfo, RegistryBuilder, RelationDescriptor, RelationProperty,
    RelationshipRegistry,
};
