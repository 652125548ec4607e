//! Relation filters and relation-count ordering over join tables.
//!
//! These extensions stand in for ORM relation support: they look up the
//! join table in the [`RelationshipRegistry`] and add a correlated subquery
//! to the outer query. Every related id passes through
//! [`prepare_for_query`] before it is bound.

use trellis_core::{
    prepare_for_query, ConfigError, Identifier, QueryValue, RelationshipRegistry, SortDirection,
};

use crate::builder::{
    Predicate, RelatedMatch, RelationCount, RelationSubquery, SelectQuery,
};

/// Join-table relation operations on a query builder.
///
/// The owning entity is the one the query was created for. A relation name
/// missing from the registry fails with [`ConfigError::MissingRelation`].
pub trait RelationQueryExt: Sized {
    /// Keep rows related to `related_id` through `relation`.
    fn where_has_relation(
        self,
        registry: &RelationshipRegistry,
        relation: &str,
        related_id: impl Into<Identifier>,
    ) -> Result<Self, ConfigError>;

    /// Keep rows related to any of `related_ids`. An empty id list returns
    /// the query unchanged.
    fn where_has_any_relation<I, T>(
        self,
        registry: &RelationshipRegistry,
        relation: &str,
        related_ids: I,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Identifier>;

    /// Order by the number of related rows. Existing column sorts break ties.
    fn order_by_relation_count(
        self,
        registry: &RelationshipRegistry,
        relation: &str,
        direction: SortDirection,
    ) -> Result<Self, ConfigError>;
}

impl RelationQueryExt for SelectQuery {
    fn where_has_relation(
        mut self,
        registry: &RelationshipRegistry,
        relation: &str,
        related_id: impl Into<Identifier>,
    ) -> Result<Self, ConfigError> {
        let descriptor = registry.lookup(self.entity(), relation)?.clone();
        let alias = self.alloc_alias("jt");
        Ok(self.push_predicate(Predicate::RelationExists(RelationSubquery {
            alias,
            join_table: descriptor.join_table,
            owner_column: descriptor.owner_column,
            related_column: descriptor.related_column,
            related: RelatedMatch::One(prepare_for_query(related_id)),
        })))
    }

    fn where_has_any_relation<I, T>(
        mut self,
        registry: &RelationshipRegistry,
        relation: &str,
        related_ids: I,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Identifier>,
    {
        let descriptor = registry.lookup(self.entity(), relation)?.clone();

        let mut values: Vec<QueryValue> = Vec::new();
        for id in related_ids {
            let value = prepare_for_query(id);
            if !values.contains(&value) {
                values.push(value);
            }
        }
        if values.is_empty() {
            return Ok(self);
        }

        let alias = self.alloc_alias("jt");
        Ok(self.push_predicate(Predicate::RelationExists(RelationSubquery {
            alias,
            join_table: descriptor.join_table,
            owner_column: descriptor.owner_column,
            related_column: descriptor.related_column,
            related: RelatedMatch::Any(values),
        })))
    }

    fn order_by_relation_count(
        mut self,
        registry: &RelationshipRegistry,
        relation: &str,
        direction: SortDirection,
    ) -> Result<Self, ConfigError> {
        let descriptor = registry.lookup(self.entity(), relation)?.clone();
        let alias = self.alloc_alias("rc");
        Ok(self.push_relation_count(
            RelationCount {
                alias,
                join_table: descriptor.join_table,
                owner_column: descriptor.owner_column,
            },
            direction,
        ))
    }
}
