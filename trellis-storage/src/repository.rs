//! Generic cache-aside repository.
//!
//! Reads go cache first, then store, then populate the cache. Writes commit
//! to the store first and then invalidate broadly: the entity's own keys
//! (every relation-qualified variant) plus every list and filter key of the
//! entity type. No lock is held across an await, so a reader that missed
//! concurrently with a writer may repopulate pre-write data after the
//! writer's invalidation. That entry lives until the next write or its TTL.
//!
//! Cache failures never fail an operation. Reads fall through to the store
//! with a warning; invalidation failures after a committed write are logged
//! at error level.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::time::Instant;

use trellis_core::{
    is_id_column, prepare_for_query, ConfigError, Entity, FilterSpec, Identifier,
    OperationKind, QueryValue, RelationshipRegistry, RepositoryConfig, SortDirection,
    StoreError, StoreResult, TrellisResult, WhereCondition,
};
use trellis_query::{RelatedRowsQuery, RelationQueryExt, SelectQuery, OWNER_KEY};

use crate::cache::{canonical_id, CacheClient, CacheKeyBuilder};
use crate::store::{into_row, Row, Store};

// ============================================================================
// READ RESULTS
// ============================================================================

/// One page of a list read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<E> {
    pub rows: Vec<E>,
    /// Matching rows across all pages.
    pub total: u64,
}

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Cache,
    Store,
}

/// A read result together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryRead<T> {
    pub value: T,
    pub source: ReadSource,
}

impl<T> RepositoryRead<T> {
    fn cached(value: T) -> Self {
        Self {
            value,
            source: ReadSource::Cache,
        }
    }

    fn stored(value: T) -> Self {
        Self {
            value,
            source: ReadSource::Store,
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        self.source == ReadSource::Cache
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// Cache-aside repository for one entity type.
///
/// The store and cache client are shared; cloning the repository is cheap.
pub struct Repository<E, S, C> {
    store: Arc<S>,
    cache: Arc<C>,
    registry: Arc<RelationshipRegistry>,
    config: RepositoryConfig,
    keys: CacheKeyBuilder,
    _entity: PhantomData<fn() -> E>,
}

impl<E, S, C> Clone for Repository<E, S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            keys: self.keys.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E, S, C> Repository<E, S, C>
where
    E: Entity,
    S: Store,
    C: CacheClient,
{
    pub fn new(
        store: Arc<S>,
        cache: Arc<C>,
        registry: Arc<RelationshipRegistry>,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            config,
            keys: CacheKeyBuilder::for_entity_type::<E>(),
            _entity: PhantomData,
        }
    }

    /// Build against the process-wide registry installed at startup.
    pub fn with_global_registry(
        store: Arc<S>,
        cache: Arc<C>,
        config: RepositoryConfig,
    ) -> Result<Self, ConfigError> {
        let registry = RelationshipRegistry::global().ok_or_else(|| ConfigError::InvalidValue {
            field: "registry".to_string(),
            value: "none".to_string(),
            reason: "relationship registry has not been installed".to_string(),
        })?;
        Ok(Self::new(store, cache, registry, config))
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn keys(&self) -> &CacheKeyBuilder {
        &self.keys
    }

    pub fn registry(&self) -> &RelationshipRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Filtered, paged list read.
    pub async fn find_with_filters(&self, spec: &FilterSpec) -> TrellisResult<Page<E>> {
        Ok(self.find_with_filters_with_source(spec).await?.into_inner())
    }

    pub async fn find_with_filters_with_source(
        &self,
        spec: &FilterSpec,
    ) -> TrellisResult<RepositoryRead<Page<E>>> {
        let query = self.filtered_query(spec)?;
        self.check_relations(&spec.include_relations)?;

        let key = self.keys.for_filters(spec);
        if let Some(page) = self.cache_get::<Page<E>>(&key).await {
            return Ok(RepositoryRead::cached(page));
        }

        let started = Instant::now();
        let rows = self.store.fetch_all(&query).await?;
        let total = self.store.count(&query).await?;
        let rows = self.hydrate(rows, &spec.include_relations).await?;
        self.check_slow(OperationKind::FindWithFilters, started);

        let page = Page {
            rows: rows.into_iter().map(decode::<E>).collect::<StoreResult<_>>()?,
            total,
        };
        self.cache_put(&key, &page).await;
        Ok(RepositoryRead::stored(page))
    }

    /// Single-entity read with optional relation hydration.
    ///
    /// Absent entities are not cached.
    pub async fn find_by_id(
        &self,
        id: impl Into<Identifier>,
        relations: &[&str],
    ) -> TrellisResult<Option<E>> {
        Ok(self.find_by_id_with_source(id, relations).await?.into_inner())
    }

    pub async fn find_by_id_with_source(
        &self,
        id: impl Into<Identifier>,
        relations: &[&str],
    ) -> TrellisResult<RepositoryRead<Option<E>>> {
        let id = id.into();
        let relations: BTreeSet<String> = relations.iter().map(|r| r.to_string()).collect();
        self.check_relations(&relations)?;

        let key = self.keys.for_entity(&id, &relations);
        if let Some(entity) = self.cache_get::<E>(&key).await {
            return Ok(RepositoryRead::cached(Some(entity)));
        }

        let Some(criteria) = self.key_criteria(&id) else {
            return Ok(RepositoryRead::stored(None));
        };

        let started = Instant::now();
        let entity = match self.store.find_one(E::TABLE, &criteria).await? {
            Some(row) => {
                let mut rows = self.hydrate(vec![row], &relations).await?;
                rows.pop().map(decode::<E>).transpose()?
            }
            None => None,
        };
        self.check_slow(OperationKind::FindById, started);

        if let Some(entity) = &entity {
            self.cache_put(&key, entity).await;
        }
        Ok(RepositoryRead::stored(entity))
    }

    /// Rows related to `related_id` through `relation`, ordered by id.
    pub async fn find_related(
        &self,
        relation: &str,
        related_id: impl Into<Identifier>,
        limit: u32,
        offset: u32,
    ) -> TrellisResult<Page<E>> {
        Ok(self
            .find_related_with_source(relation, related_id, limit, offset)
            .await?
            .into_inner())
    }

    pub async fn find_related_with_source(
        &self,
        relation: &str,
        related_id: impl Into<Identifier>,
        limit: u32,
        offset: u32,
    ) -> TrellisResult<RepositoryRead<Page<E>>> {
        let related_id = related_id.into();
        let query = SelectQuery::for_entity::<E>()
            .where_has_relation(&self.registry, relation, &related_id)?
            .order_by("id", SortDirection::Asc)
            .with_limit(limit)
            .with_offset(offset);

        let key = self.keys.for_list(
            &format!("{}={}", relation, canonical_id(&related_id)),
            limit,
            offset,
        );
        if let Some(page) = self.cache_get::<Page<E>>(&key).await {
            return Ok(RepositoryRead::cached(page));
        }

        let started = Instant::now();
        let rows = self.store.fetch_all(&query).await?;
        let total = self.store.count(&query).await?;
        self.check_slow(OperationKind::FindWithFilters, started);

        let page = Page {
            rows: rows.into_iter().map(decode::<E>).collect::<StoreResult<_>>()?,
            total,
        };
        self.cache_put(&key, &page).await;
        Ok(RepositoryRead::stored(page))
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Insert a row and invalidate every list of this entity type.
    ///
    /// A null `id` is dropped so the store generates one.
    pub async fn create<D>(&self, data: &D) -> TrellisResult<E>
    where
        D: Serialize + Sync,
    {
        let mut row = to_row(data)?;
        if row.get("id").is_some_and(Value::is_null) {
            row.remove("id");
        }

        let started = Instant::now();
        let inserted = self.store.insert(E::TABLE, row).await?;
        self.check_slow(OperationKind::Write, started);

        let entity = decode::<E>(inserted)?;
        self.invalidate_lists().await;
        Ok(entity)
    }

    /// Apply `changes` to one row. The primary key itself is never changed.
    pub async fn update<D>(&self, id: impl Into<Identifier>, changes: &D) -> TrellisResult<Option<E>>
    where
        D: Serialize + Sync,
    {
        let id = id.into();
        let Some(criteria) = self.key_criteria(&id) else {
            return Ok(None);
        };
        let mut changes = to_row(changes)?;
        changes.remove("id");

        let started = Instant::now();
        let updated = self.store.update(E::TABLE, &criteria, changes).await?;
        self.check_slow(OperationKind::Write, started);

        self.invalidate_entity(&id).await;
        self.invalidate_lists().await;
        Ok(updated.map(decode::<E>).transpose()?)
    }

    /// Delete one row. Returns whether anything was removed.
    pub async fn delete(&self, id: impl Into<Identifier>) -> TrellisResult<bool> {
        let id = id.into();
        let Some(criteria) = self.key_criteria(&id) else {
            return Ok(false);
        };

        let started = Instant::now();
        let removed = self.store.delete(E::TABLE, &criteria).await?;
        self.check_slow(OperationKind::Write, started);

        self.invalidate_entity(&id).await;
        self.invalidate_lists().await;
        Ok(removed > 0)
    }

    // ------------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------------

    /// Drop every cached variant of one entity.
    pub async fn invalidate_entity(&self, id: &Identifier) {
        self.invalidate_pattern(&self.keys.entity_pattern(id)).await;
    }

    /// Drop every cached list and filter result of this entity type.
    pub async fn invalidate_lists(&self) {
        self.invalidate_pattern(&self.keys.filters_pattern()).await;
        self.invalidate_pattern(&self.keys.list_pattern()).await;
    }

    /// Drop everything cached for this entity type.
    pub async fn invalidate_all(&self) {
        self.invalidate_pattern(&self.keys.all_pattern()).await;
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Translate a filter spec into a query. Unknown field filters and sort
    /// keys are ignored; unknown relations are configuration errors.
    fn filtered_query(&self, spec: &FilterSpec) -> Result<SelectQuery, ConfigError> {
        let mut query = SelectQuery::for_entity::<E>();

        if let Some(term) = &spec.search_term {
            query = query.where_search(E::SEARCH_COLUMNS, term);
        }

        for (column, value) in &spec.field_filters {
            if !E::FILTERABLE_COLUMNS.contains(&column.as_str()) {
                tracing::debug!(entity = E::NAME, column = %column, "Ignoring unknown filter field");
                continue;
            }
            let value = if is_id_column(column) {
                prepare_for_query(value)
            } else {
                QueryValue::from_json(value)
            };
            query = query.where_eq(column, value);
        }

        for (relation, ids) in &spec.relation_filters {
            query = query.where_has_any_relation(&self.registry, relation, ids)?;
        }

        let mut sorted_by_id = false;
        match spec.sort_by.as_deref() {
            Some(field) if self.registry.contains(E::NAME, field) => {
                query = query.order_by_relation_count(&self.registry, field, spec.sort_direction)?;
            }
            Some(field) if E::SORTABLE_COLUMNS.contains(&field) => {
                query = query.order_by(field, spec.sort_direction);
                sorted_by_id = field == "id";
            }
            Some(field) => {
                tracing::debug!(entity = E::NAME, field, "Ignoring unknown sort field");
            }
            None => {}
        }
        // Stable paging needs a total order.
        if !sorted_by_id {
            query = query.order_by("id", SortDirection::Asc);
        }

        Ok(query.with_limit(spec.limit).with_offset(spec.offset))
    }

    fn check_relations(&self, relations: &BTreeSet<String>) -> Result<(), ConfigError> {
        for relation in relations {
            self.registry.lookup(E::NAME, relation)?;
        }
        Ok(())
    }

    /// Primary-key criteria, or `None` when `id` can never match the key.
    fn key_criteria(&self, id: &Identifier) -> Option<[WhereCondition; 1]> {
        match E::ID_KIND.coerce(id) {
            Some(value) => Some([WhereCondition {
                field: "id".to_string(),
                value,
            }]),
            None => {
                tracing::debug!(
                    entity = E::NAME,
                    id = %id.as_str(),
                    "Identifier cannot match key column"
                );
                None
            }
        }
    }

    /// Attach related rows under each relation's property name, one batched
    /// query per relation.
    async fn hydrate(&self, mut rows: Vec<Row>, relations: &BTreeSet<String>) -> TrellisResult<Vec<Row>> {
        if rows.is_empty() {
            return Ok(rows);
        }

        for relation in relations {
            let descriptor = self.registry.lookup(E::NAME, relation)?;
            let related = self.registry.entity_info(&descriptor.related_entity)?;

            let mut owner_ids: Vec<QueryValue> = Vec::new();
            for row in &rows {
                let id = QueryValue::from_json(row.get("id").unwrap_or(&Value::Null));
                if id != QueryValue::Null && !owner_ids.contains(&id) {
                    owner_ids.push(id);
                }
            }

            let query = RelatedRowsQuery {
                related_table: related.table.clone(),
                join_table: descriptor.join_table.clone(),
                owner_column: descriptor.owner_column.clone(),
                related_column: descriptor.related_column.clone(),
                owner_ids,
            };

            let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
            for mut related_row in self.store.fetch_related(&query).await? {
                let owner = related_row
                    .remove(OWNER_KEY)
                    .map(|v| Identifier::from_json(&v).as_str().to_string())
                    .unwrap_or_default();
                grouped.entry(owner).or_default().push(Value::Object(related_row));
            }

            for row in rows.iter_mut() {
                let owner = row
                    .get("id")
                    .map(|v| Identifier::from_json(v).as_str().to_string())
                    .unwrap_or_default();
                let related_rows = grouped.remove(&owner).unwrap_or_default();
                row.insert(relation.clone(), Value::Array(related_rows));
            }
        }
        Ok(rows)
    }

    async fn cache_get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if !self.config.cache.enabled {
            return None;
        }
        match self.cache.get::<T>(key).await {
            Ok(Some(value)) => {
                tracing::debug!(entity = E::NAME, key, "Cache hit");
                Some(value)
            }
            Ok(None) => {
                tracing::debug!(entity = E::NAME, key, "Cache miss");
                None
            }
            Err(error) => {
                tracing::warn!(
                    entity = E::NAME,
                    key,
                    error = %error,
                    "Cache read failed, falling back to store"
                );
                None
            }
        }
    }

    async fn cache_put<T>(&self, key: &str, value: &T)
    where
        T: Serialize + Sync,
    {
        if !self.config.cache.enabled {
            return;
        }
        let ttl = self.config.cache.ttl_for(E::NAME);
        match self.cache.set(key, value, ttl).await {
            Ok(()) => {
                tracing::debug!(entity = E::NAME, key, ttl_secs = ttl.as_secs(), "Cache populated");
            }
            Err(error) => {
                tracing::warn!(entity = E::NAME, key, error = %error, "Cache write failed");
            }
        }
    }

    async fn invalidate_pattern(&self, pattern: &str) {
        if !self.config.cache.enabled {
            return;
        }
        match self.cache.delete_by_pattern(pattern).await {
            Ok(removed) => {
                tracing::debug!(entity = E::NAME, pattern, removed, "Cache invalidated");
            }
            Err(error) => {
                tracing::error!(
                    entity = E::NAME,
                    pattern,
                    error = %error,
                    "Cache invalidation failed after committed write"
                );
            }
        }
    }

    fn check_slow(&self, kind: OperationKind, started: Instant) {
        let elapsed = started.elapsed();
        let threshold = self.config.slow_queries.for_operation(kind);
        if elapsed > threshold {
            tracing::warn!(
                entity = E::NAME,
                operation = kind.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "Slow query"
            );
        }
    }
}

fn decode<E: Entity>(row: Row) -> StoreResult<E> {
    serde_json::from_value(Value::Object(row)).map_err(|e| StoreError::Decode {
        entity: E::NAME.to_string(),
        reason: e.to_string(),
    })
}

fn to_row<D: Serialize>(data: &D) -> StoreResult<Row> {
    let value = serde_json::to_value(data).map_err(|e| StoreError::Serialization {
        reason: e.to_string(),
    })?;
    into_row(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheClient;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use trellis_core::{IdKind, RelationDescriptor};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Exercise {
        id: Option<i64>,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        categories: Option<Vec<Category>>,
    }

    impl Entity for Exercise {
        const NAME: &'static str = "Exercise";
        const TABLE: &'static str = "exercises";
        const ID_KIND: IdKind = IdKind::Integer;
        const SEARCH_COLUMNS: &'static [&'static str] = &["name"];
        const SORTABLE_COLUMNS: &'static [&'static str] = &["id", "name"];
        const FILTERABLE_COLUMNS: &'static [&'static str] = &["name", "category_id"];

        fn id(&self) -> Identifier {
            Identifier::from(self.id)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Category {
        id: i64,
        name: String,
    }

    type Repo = Repository<Exercise, InMemoryStore, InMemoryCacheClient>;

    fn registry() -> Arc<RelationshipRegistry> {
        Arc::new(
            RelationshipRegistry::builder()
                .entity("Exercise", "exercises", IdKind::Integer)
                .entity("Category", "categories", IdKind::Integer)
                .register_inverse(
                    "Exercise",
                    "categories",
                    "exercises",
                    RelationDescriptor::many_to_many(
                        "exercise_categories",
                        "exercise_id",
                        "category_id",
                        "Category",
                    ),
                )
                .build()
                .unwrap(),
        )
    }

    fn repo() -> Repo {
        let store = InMemoryStore::new()
            .with_table("exercises", IdKind::Integer)
            .with_table("categories", IdKind::Integer)
            .with_join_table("exercise_categories");
        Repository::new(
            Arc::new(store),
            Arc::new(InMemoryCacheClient::new()),
            registry(),
            RepositoryConfig::default(),
        )
    }

    #[test]
    fn test_filtered_query_sql() {
        let spec = FilterSpec::new()
            .with_search("squat")
            .with_field("name", json!("Front squat"))
            .with_field("unknown", json!(1))
            .with_relation_filter("categories", ["7"])
            .with_sort("categories", SortDirection::Desc)
            .with_page(10, 20);

        let rendered = repo().filtered_query(&spec).unwrap().to_sql();
        assert_eq!(
            rendered.sql,
            "SELECT e.*, (SELECT COUNT(*) FROM exercise_categories rc2 WHERE rc2.exercise_id = e.id) AS rc2 \
             FROM exercises e WHERE (e.name ILIKE $1) AND e.name = $2 \
             AND EXISTS (SELECT 1 FROM exercise_categories jt1 WHERE jt1.exercise_id = e.id AND jt1.category_id IN ($3)) \
             ORDER BY rc2 DESC, e.id ASC LIMIT 10 OFFSET 20"
        );
        assert_eq!(rendered.params[2], QueryValue::Integer(7));
    }

    #[test]
    fn test_filtered_query_id_filter_normalized() {
        let spec = FilterSpec::new().with_field("category_id", json!("42"));
        let query = repo().filtered_query(&spec).unwrap();
        assert_eq!(query.to_sql().params, vec![QueryValue::Integer(42)]);
    }

    #[test]
    fn test_filtered_query_sort_by_id_has_no_duplicate_tiebreak() {
        let spec = FilterSpec::new().with_sort("id", SortDirection::Desc);
        let sql = repo().filtered_query(&spec).unwrap().to_sql().sql;
        assert!(sql.ends_with("ORDER BY e.id DESC LIMIT 20 OFFSET 0"));
    }

    #[test]
    fn test_filtered_query_unknown_sort_ignored() {
        let spec = FilterSpec::new().with_sort("password", SortDirection::Asc);
        let sql = repo().filtered_query(&spec).unwrap().to_sql().sql;
        assert!(sql.contains("ORDER BY e.id ASC"));
        assert!(!sql.contains("password"));
    }

    #[test]
    fn test_filtered_query_unknown_relation_filter_fails() {
        let spec = FilterSpec::new().with_relation_filter("doesNotExist", [1]);
        let err = repo().filtered_query(&spec).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRelation { .. }));
    }

    #[tokio::test]
    async fn test_create_then_find_by_id_hydrates() {
        let repo = repo();
        let squat = repo
            .create(&json!({ "id": null, "name": "Squat" }))
            .await
            .unwrap();
        assert_eq!(squat.id, Some(1));

        repo.store
            .insert_row("categories", into_row(json!({ "id": 7, "name": "Legs" })).unwrap())
            .unwrap();
        repo.store
            .insert_row(
                "exercise_categories",
                into_row(json!({ "exercise_id": 1, "category_id": 7 })).unwrap(),
            )
            .unwrap();

        let found = repo.find_by_id("1", &["categories"]).await.unwrap().unwrap();
        assert_eq!(
            found.categories,
            Some(vec![Category {
                id: 7,
                name: "Legs".to_string()
            }])
        );

        let again = repo.find_by_id_with_source(1, &["categories"]).await.unwrap();
        assert!(again.is_cache_hit());
    }

    #[tokio::test]
    async fn test_uuid_against_integer_key_short_circuits() {
        let repo = repo();
        let read = repo
            .find_by_id_with_source("550e8400-e29b-41d4-a716-446655440000", &[])
            .await
            .unwrap();
        assert_eq!(read.value, None);
        assert_eq!(read.source, ReadSource::Store);
        assert!(!repo.delete("not-an-id").await.unwrap());
    }

    #[tokio::test]
    async fn test_absent_entity_not_cached() {
        let repo = repo();
        assert!(repo.find_by_id(99, &[]).await.unwrap().is_none());
        assert!(repo.cache.keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_ignores_primary_key_change() {
        let repo = repo();
        repo.create(&json!({ "name": "Squat" })).await.unwrap();
        let updated = repo
            .update(1, &json!({ "id": 5, "name": "Back squat" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.id, Some(1));
        assert_eq!(updated.name, "Back squat");
    }

    #[tokio::test]
    async fn test_create_rejects_non_object() {
        let err = repo().create(&json!(["not", "a", "row"])).await.unwrap_err();
        assert!(matches!(err, trellis_core::TrellisError::Store(StoreError::Serialization { .. })));
    }
}
