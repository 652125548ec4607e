//! Underlying relational store contract.
//!
//! Rows travel as JSON objects keyed by column name; the repository decodes
//! them into entities with `serde_json`. Reads take structured queries so
//! that any backend can evaluate them, not only one that speaks SQL.

use async_trait::async_trait;
use serde_json::{Map, Value};

use trellis_core::{StoreError, StoreResult, WhereCondition};
use trellis_query::{RelatedRowsQuery, SelectQuery};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{DbConfig, PgStore};

/// One row, column name to value.
pub type Row = Map<String, Value>;

/// Store contract used by the repository.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run a SELECT, honoring its predicates, ordering and paging.
    async fn fetch_all(&self, query: &SelectQuery) -> StoreResult<Vec<Row>>;

    /// Count the rows matching a query's predicates. Paging is ignored.
    async fn count(&self, query: &SelectQuery) -> StoreResult<u64>;

    /// Load related rows through a join table. Each returned row carries
    /// the owning id under [`trellis_query::OWNER_KEY`].
    async fn fetch_related(&self, query: &RelatedRowsQuery) -> StoreResult<Vec<Row>>;

    /// First row of `table` matching every condition.
    async fn find_one(&self, table: &str, criteria: &[WhereCondition])
        -> StoreResult<Option<Row>>;

    /// Insert a row and return it as stored, generated columns included.
    async fn insert(&self, table: &str, row: Row) -> StoreResult<Row>;

    /// Apply `changes` to the first row matching `criteria`.
    async fn update(
        &self,
        table: &str,
        criteria: &[WhereCondition],
        changes: Row,
    ) -> StoreResult<Option<Row>>;

    /// Delete every row matching `criteria`, returning how many went.
    async fn delete(&self, table: &str, criteria: &[WhereCondition]) -> StoreResult<u64>;
}

/// Convert a JSON value into a [`Row`]. Only objects qualify.
pub fn into_row(value: Value) -> StoreResult<Row> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization {
            reason: format!("expected a JSON object, got {}", other),
        }),
    }
}
