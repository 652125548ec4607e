//! Error types for Trellis operations

use thiserror::Error;

/// Configuration errors.
///
/// A missing relation entry is a programming or deployment defect, so these
/// are fatal to the operation that hit them and must not be swallowed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No relation '{relation}' registered for entity {entity}")]
    MissingRelation { entity: String, relation: String },

    #[error("Entity not registered: {entity}")]
    UnknownEntity { entity: String },

    #[error(
        "Inverse relations {entity}.{relation} and {inverse_entity}.{inverse_relation} are not symmetric: {reason}"
    )]
    AsymmetricInverse {
        entity: String,
        relation: String,
        inverse_entity: String,
        inverse_relation: String,
        reason: String,
    },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Relationship registry already installed")]
    RegistryAlreadyInstalled,
}

/// Underlying store errors. Propagated to callers unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Query failed: {reason}")]
    Query { reason: String },

    #[error("Connection failed: {reason}")]
    Connection { reason: String },

    #[error("Unknown table: {table}")]
    UnknownTable { table: String },

    #[error("Failed to decode {entity} row: {reason}")]
    Decode { entity: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Cache client errors. Always logged and absorbed by the repository.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend failure: {reason}")]
    Backend { reason: String },

    #[error("Cache serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Invalid cache pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Validation errors raised by callers that validate filter shapes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Master error type for all Trellis errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrellisError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type alias for Trellis operations.
pub type TrellisResult<T> = Result<T, TrellisError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for cache client operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
