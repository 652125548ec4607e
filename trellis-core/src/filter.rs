//! Filter, pagination and sort specification for list reads.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::identifier::Identifier;

/// Default page size when a caller does not set one.
pub const DEFAULT_LIMIT: u32 = 20;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// SQL keyword for this direction.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// Lenient parse; anything other than `desc` sorts ascending.
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("desc") {
            Self::Desc
        } else {
            Self::Asc
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => f.write_str("asc"),
            Self::Desc => f.write_str("desc"),
        }
    }
}

/// A list-read request.
///
/// Set-valued members use ordered collections so that two specs built in a
/// different order compare (and key) the same.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Free-text search over the entity's search columns.
    pub search_term: Option<String>,
    pub limit: u32,
    pub offset: u32,
    pub sort_by: Option<String>,
    pub sort_direction: SortDirection,
    /// Relation names to load alongside each row.
    pub include_relations: BTreeSet<String>,
    /// Keep rows related to any of the given ids, per relation.
    pub relation_filters: BTreeMap<String, Vec<Identifier>>,
    /// Column equality filters. Unknown columns are ignored.
    pub field_filters: BTreeMap<String, serde_json::Value>,
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self {
            search_term: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
            sort_by: None,
            sort_direction: SortDirection::Asc,
            include_relations: BTreeSet::new(),
            relation_filters: BTreeMap::new(),
            field_filters: BTreeMap::new(),
        }
    }
}

impl FilterSpec {
    /// Create a spec with default pagination.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the search term. Blank terms are dropped.
    pub fn with_search(mut self, term: impl Into<String>) -> Self {
        let term = term.into();
        self.search_term = if term.trim().is_empty() { None } else { Some(term) };
        self
    }

    /// Set limit and offset.
    pub fn with_page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Set the sort column and direction.
    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort_by = Some(field.into());
        self.sort_direction = direction;
        self
    }

    /// Add relations to load with each row.
    pub fn with_relations<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_relations
            .extend(relations.into_iter().map(Into::into));
        self
    }

    /// Keep rows related to any of `ids` through `relation`.
    pub fn with_relation_filter<I, T>(mut self, relation: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Identifier>,
    {
        self.relation_filters
            .entry(relation.into())
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Add a column equality filter.
    pub fn with_field(mut self, column: impl Into<String>, value: serde_json::Value) -> Self {
        self.field_filters.insert(column.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relations_are_order_independent() {
        let a = FilterSpec::new().with_relations(["b", "a"]);
        let b = FilterSpec::new().with_relations(["a", "b"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_blank_search_is_dropped() {
        assert_eq!(FilterSpec::new().with_search("   ").search_term, None);
        assert_eq!(
            FilterSpec::new().with_search("squat").search_term.as_deref(),
            Some("squat")
        );
    }

    #[test]
    fn test_sort_direction_parse() {
        assert_eq!(SortDirection::parse_lenient("DESC"), SortDirection::Desc);
        assert_eq!(SortDirection::parse_lenient("sideways"), SortDirection::Asc);
    }
}
