//! Relationship registry and relation metadata.
//!
//! Relations between entities are resolved through hand-maintained join
//! tables rather than ORM relation loading. The registry maps an
//! `(entity, relation)` pair to the join table that backs it and is built
//! once at startup, then shared read-only.
//!
//! # Example
//!
//! ```ignore
//! let registry = RegistryBuilder::new()
//!     .entity("Exercise", "exercises", IdKind::Integer)
//!     .entity("Category", "categories", IdKind::Integer)
//!     .register_inverse(
//!         "Exercise",
//!         "categories",
//!         "exercises",
//!         RelationDescriptor::many_to_many("exercise_categories", "exercise_id", "category_id", "Category"),
//!     )
//!     .build()?;
//!
//! let descriptor = registry.lookup("Exercise", "categories")?;
//! ```

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::Entity;
use crate::error::ConfigError;
use crate::identifier::IdKind;

static GLOBAL_REGISTRY: OnceCell<Arc<RelationshipRegistry>> = OnceCell::new();

/// How many related rows one owner may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToMany,
    ManyToMany,
}

/// Join-table description of one direction of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationDescriptor {
    /// Table holding the id pairs.
    pub join_table: String,
    /// Column holding the owning entity's id.
    pub owner_column: String,
    /// Column holding the related entity's id.
    pub related_column: String,
    /// Entity type on the far side of the relation.
    pub related_entity: String,
    pub cardinality: Cardinality,
}

impl RelationDescriptor {
    pub fn new(
        join_table: impl Into<String>,
        owner_column: impl Into<String>,
        related_column: impl Into<String>,
        related_entity: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            join_table: join_table.into(),
            owner_column: owner_column.into(),
            related_column: related_column.into(),
            related_entity: related_entity.into(),
            cardinality,
        }
    }

    pub fn many_to_many(
        join_table: impl Into<String>,
        owner_column: impl Into<String>,
        related_column: impl Into<String>,
        related_entity: impl Into<String>,
    ) -> Self {
        Self::new(
            join_table,
            owner_column,
            related_column,
            related_entity,
            Cardinality::ManyToMany,
        )
    }

    pub fn one_to_many(
        join_table: impl Into<String>,
        owner_column: impl Into<String>,
        related_column: impl Into<String>,
        related_entity: impl Into<String>,
    ) -> Self {
        Self::new(
            join_table,
            owner_column,
            related_column,
            related_entity,
            Cardinality::OneToMany,
        )
    }

    /// The same join table seen from the related entity. Cardinality is
    /// carried over unchanged.
    pub fn inverse(&self, owner_entity: impl Into<String>) -> Self {
        Self {
            join_table: self.join_table.clone(),
            owner_column: self.related_column.clone(),
            related_column: self.owner_column.clone(),
            related_entity: owner_entity.into(),
            cardinality: self.cardinality,
        }
    }

    /// Whether `other` is this descriptor with owner and related swapped.
    pub fn is_inverse_of(&self, other: &RelationDescriptor) -> bool {
        self.join_table == other.join_table
            && self.owner_column == other.related_column
            && self.related_column == other.owner_column
    }
}

/// Table and key kind of a registered entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub name: String,
    pub table: String,
    pub id_kind: IdKind,
}

/// A relation property attached to an entity's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationProperty {
    pub property: String,
    pub descriptor: RelationDescriptor,
}

#[derive(Debug, Clone)]
struct InversePair {
    entity: String,
    relation: String,
    inverse_entity: String,
    inverse_relation: String,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Collects registrations at startup. Re-registering a key overwrites it.
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    entities: HashMap<String, EntityInfo>,
    relations: HashMap<String, HashMap<String, RelationDescriptor>>,
    properties: HashMap<String, Vec<RelationProperty>>,
    inverse_pairs: Vec<InversePair>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the table and key kind of an entity.
    pub fn entity(mut self, name: impl Into<String>, table: impl Into<String>, id_kind: IdKind) -> Self {
        let name = name.into();
        self.entities.insert(
            name.clone(),
            EntityInfo {
                name,
                table: table.into(),
                id_kind,
            },
        );
        self
    }

    /// Record the table and key kind of an [`Entity`] type.
    pub fn entity_of<E: Entity>(self) -> Self {
        self.entity(E::NAME, E::TABLE, E::ID_KIND)
    }

    /// Register one direction of a relation. Last write wins.
    pub fn register(
        mut self,
        entity: impl Into<String>,
        relation: impl Into<String>,
        descriptor: RelationDescriptor,
    ) -> Self {
        let entity = entity.into();
        let relation = relation.into();
        let previous = self
            .relations
            .entry(entity.clone())
            .or_default()
            .insert(relation.clone(), descriptor);
        if previous.is_some() {
            tracing::warn!(
                entity = %entity,
                relation = %relation,
                "Relation registered twice, keeping the last registration"
            );
        }
        self
    }

    /// Register both directions of a relation from one descriptor.
    ///
    /// The inverse entry is keyed under `descriptor.related_entity` and uses
    /// the same join table with owner and related columns swapped.
    pub fn register_inverse(
        self,
        entity: impl Into<String>,
        relation: impl Into<String>,
        inverse_relation: impl Into<String>,
        descriptor: RelationDescriptor,
    ) -> Self {
        let entity = entity.into();
        let relation = relation.into();
        let inverse_relation = inverse_relation.into();
        let inverse_entity = descriptor.related_entity.clone();
        let inverse = descriptor.inverse(entity.clone());

        let mut builder = self
            .register(entity.clone(), relation.clone(), descriptor)
            .register(inverse_entity.clone(), inverse_relation.clone(), inverse);
        builder.inverse_pairs.push(InversePair {
            entity,
            relation,
            inverse_entity,
            inverse_relation,
        });
        builder
    }

    /// Declare that two separately registered relations are inverses, so
    /// that `build` verifies their symmetry.
    pub fn declare_inverse(
        mut self,
        entity: impl Into<String>,
        relation: impl Into<String>,
        inverse_entity: impl Into<String>,
        inverse_relation: impl Into<String>,
    ) -> Self {
        self.inverse_pairs.push(InversePair {
            entity: entity.into(),
            relation: relation.into(),
            inverse_entity: inverse_entity.into(),
            inverse_relation: inverse_relation.into(),
        });
        self
    }

    /// Attach relation metadata to an entity property.
    ///
    /// Properties enumerate in the order they were first annotated;
    /// re-annotating a property replaces its descriptor in place.
    pub fn annotate(
        mut self,
        entity: impl Into<String>,
        property: impl Into<String>,
        descriptor: RelationDescriptor,
    ) -> Self {
        let property = property.into();
        let properties = self.properties.entry(entity.into()).or_default();
        match properties.iter_mut().find(|p| p.property == property) {
            Some(existing) => existing.descriptor = descriptor,
            None => properties.push(RelationProperty {
                property,
                descriptor,
            }),
        }
        self
    }

    /// Freeze the registry, verifying every declared inverse pair.
    pub fn build(self) -> Result<RelationshipRegistry, ConfigError> {
        let registry = RelationshipRegistry {
            entities: self.entities,
            relations: self.relations,
            properties: self.properties,
        };
        for pair in &self.inverse_pairs {
            registry.verify_inverse(
                &pair.entity,
                &pair.relation,
                &pair.inverse_entity,
                &pair.inverse_relation,
            )?;
        }
        Ok(registry)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Immutable `(entity, relation) -> RelationDescriptor` mapping.
///
/// Lookups take `&self` and never lock; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct RelationshipRegistry {
    entities: HashMap<String, EntityInfo>,
    relations: HashMap<String, HashMap<String, RelationDescriptor>>,
    properties: HashMap<String, Vec<RelationProperty>>,
}

impl RelationshipRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Look up a relation. A missing entry is a configuration defect.
    pub fn lookup(&self, entity: &str, relation: &str) -> Result<&RelationDescriptor, ConfigError> {
        self.relations
            .get(entity)
            .and_then(|relations| relations.get(relation))
            .ok_or_else(|| ConfigError::MissingRelation {
                entity: entity.to_string(),
                relation: relation.to_string(),
            })
    }

    /// Typed lookup keyed by the entity's tag.
    pub fn lookup_for<E: Entity>(&self, relation: &str) -> Result<&RelationDescriptor, ConfigError> {
        self.lookup(E::NAME, relation)
    }

    /// Whether a relation is registered.
    pub fn contains(&self, entity: &str, relation: &str) -> bool {
        self.lookup(entity, relation).is_ok()
    }

    /// Table and key kind of a registered entity.
    pub fn entity_info(&self, entity: &str) -> Result<&EntityInfo, ConfigError> {
        self.entities
            .get(entity)
            .ok_or_else(|| ConfigError::UnknownEntity {
                entity: entity.to_string(),
            })
    }

    /// Relation properties annotated on an entity, in annotation order.
    pub fn relations_of(&self, entity: &str) -> impl Iterator<Item = &RelationProperty> {
        self.properties
            .get(entity)
            .map(|p| p.as_slice())
            .unwrap_or_default()
            .iter()
    }

    /// Names of the relation properties annotated on an entity.
    pub fn relation_properties(&self, entity: &str) -> Vec<&str> {
        self.relations_of(entity)
            .map(|p| p.property.as_str())
            .collect()
    }

    /// Check that two registered relations describe the same join table
    /// from opposite sides.
    pub fn verify_inverse(
        &self,
        entity: &str,
        relation: &str,
        inverse_entity: &str,
        inverse_relation: &str,
    ) -> Result<(), ConfigError> {
        let forward = self.lookup(entity, relation)?;
        let backward = self.lookup(inverse_entity, inverse_relation)?;

        let asymmetric = |reason: String| ConfigError::AsymmetricInverse {
            entity: entity.to_string(),
            relation: relation.to_string(),
            inverse_entity: inverse_entity.to_string(),
            inverse_relation: inverse_relation.to_string(),
            reason,
        };

        if forward.related_entity != inverse_entity || backward.related_entity != entity {
            return Err(asymmetric(format!(
                "related entities are {} and {}",
                forward.related_entity, backward.related_entity
            )));
        }
        if !forward.is_inverse_of(backward) {
            return Err(asymmetric(format!(
                "{}({}, {}) vs {}({}, {})",
                forward.join_table,
                forward.owner_column,
                forward.related_column,
                backward.join_table,
                backward.owner_column,
                backward.related_column
            )));
        }
        Ok(())
    }

    /// Install as the process-wide registry. Only the first install wins.
    pub fn install(self) -> Result<Arc<Self>, ConfigError> {
        let registry = Arc::new(self);
        GLOBAL_REGISTRY
            .set(Arc::clone(&registry))
            .map_err(|_| ConfigError::RegistryAlreadyInstalled)?;
        Ok(registry)
    }

    /// The process-wide registry, if one was installed.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_REGISTRY.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories() -> RelationDescriptor {
        RelationDescriptor::many_to_many("exercise_categories", "exercise_id", "category_id", "Category")
    }

    #[test]
    fn test_lookup_registered_relation() {
        let registry = RegistryBuilder::new()
            .register("Exercise", "categories", categories())
            .build()
            .unwrap();
        let descriptor = registry.lookup("Exercise", "categories").unwrap();
        assert_eq!(descriptor.join_table, "exercise_categories");
        assert_eq!(descriptor.related_entity, "Category");
    }

    #[test]
    fn test_lookup_missing_relation_is_config_error() {
        let registry = RegistryBuilder::new()
            .register("Exercise", "categories", categories())
            .build()
            .unwrap();
        let err = registry.lookup("Exercise", "doesNotExist").unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingRelation {
                entity: "Exercise".to_string(),
                relation: "doesNotExist".to_string(),
            }
        );
    }

    #[test]
    fn test_reregistration_last_write_wins() {
        let registry = RegistryBuilder::new()
            .register("Exercise", "categories", categories())
            .register(
                "Exercise",
                "categories",
                RelationDescriptor::many_to_many("exercise_tags", "exercise_id", "tag_id", "Category"),
            )
            .build()
            .unwrap();
        assert_eq!(
            registry.lookup("Exercise", "categories").unwrap().join_table,
            "exercise_tags"
        );
    }

    #[test]
    fn test_register_inverse_swaps_columns() {
        let registry = RegistryBuilder::new()
            .register_inverse("Exercise", "categories", "exercises", categories())
            .build()
            .unwrap();
        let inverse = registry.lookup("Category", "exercises").unwrap();
        assert_eq!(inverse.join_table, "exercise_categories");
        assert_eq!(inverse.owner_column, "category_id");
        assert_eq!(inverse.related_column, "exercise_id");
        assert_eq!(inverse.related_entity, "Exercise");
    }

    #[test]
    fn test_asymmetric_inverse_fails_build() {
        let result = RegistryBuilder::new()
            .register("Exercise", "categories", categories())
            .register(
                "Category",
                "exercises",
                // Columns not swapped: traversal from Category would match nothing.
                RelationDescriptor::many_to_many("exercise_categories", "exercise_id", "category_id", "Exercise"),
            )
            .declare_inverse("Exercise", "categories", "Category", "exercises")
            .build();
        assert!(matches!(result, Err(ConfigError::AsymmetricInverse { .. })));
    }

    #[test]
    fn test_annotations_enumerate_in_registration_order() {
        let registry = RegistryBuilder::new()
            .annotate("Exercise", "muscles", categories())
            .annotate("Exercise", "categories", categories())
            .annotate("Exercise", "equipment", categories())
            .annotate("Exercise", "muscles", categories())
            .build()
            .unwrap();
        assert_eq!(
            registry.relation_properties("Exercise"),
            vec!["muscles", "categories", "equipment"]
        );
        assert_eq!(registry.relations_of("Workout").count(), 0);
    }

    #[test]
    fn test_entity_info() {
        let registry = RegistryBuilder::new()
            .entity("Exercise", "exercises", IdKind::Integer)
            .build()
            .unwrap();
        assert_eq!(registry.entity_info("Exercise").unwrap().table, "exercises");
        assert!(matches!(
            registry.entity_info("Nope"),
            Err(ConfigError::UnknownEntity { .. })
        ));
    }
}
