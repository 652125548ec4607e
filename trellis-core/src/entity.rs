//! Entity contract shared by the query builder and the repository.

use serde::{de::DeserializeOwned, Serialize};

use crate::identifier::{IdKind, Identifier};

/// A persisted entity type.
///
/// The associated constants describe the table the entity lives in and
/// which columns generic code may touch. Columns not listed here are never
/// interpolated into generated SQL.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Entity type tag used by the relationship registry (e.g. `"Exercise"`).
    const NAME: &'static str;

    /// Backing table.
    const TABLE: &'static str;

    /// Primary-key representation of `TABLE`.
    const ID_KIND: IdKind;

    /// Columns matched by a free-text search term.
    const SEARCH_COLUMNS: &'static [&'static str] = &[];

    /// Columns accepted as `sort_by`.
    const SORTABLE_COLUMNS: &'static [&'static str] = &["id"];

    /// Columns accepted as equality filters.
    const FILTERABLE_COLUMNS: &'static [&'static str] = &[];

    /// Get the primary key of this instance.
    fn id(&self) -> Identifier;

    /// Prefix for every cache key of this entity type.
    fn cache_prefix() -> String {
        Self::NAME.to_lowercase()
    }
}
