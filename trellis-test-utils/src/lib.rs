//! Trellis Test Utilities
//!
//! Shared test infrastructure for the Trellis workspace:
//! - Fixture entities with integer and UUID keys, plus their registry
//! - Store and cache doubles (call counting, failing, delaying, gated)
//! - A tracing capture for asserting on log output
//! - Proptest generators for identifiers and filter specs
//! - Assertions for the error taxonomy

pub use trellis_core::{
    CacheError, ConfigError, Entity, FilterSpec, IdKind, Identifier, RelationDescriptor,
    RelationshipRegistry, RepositoryConfig, SortDirection, StoreError, TrellisError,
    TrellisResult,
};
pub use trellis_storage::{
    CacheClient, CacheStats, InMemoryCacheClient, InMemoryStore, Page, ReadSource, Repository,
    RepositoryRead, Row, Store,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use trellis_core::{CacheResult, StoreResult, WhereCondition};
use trellis_query::{RelatedRowsQuery, SelectQuery};

// ============================================================================
// FIXTURE ENTITIES
// ============================================================================

/// Integer-keyed entity with two relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<Category>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muscles: Option<Vec<Muscle>>,
}

impl Entity for Exercise {
    const NAME: &'static str = "Exercise";
    const TABLE: &'static str = "exercises";
    const ID_KIND: IdKind = IdKind::Integer;
    const SEARCH_COLUMNS: &'static [&'static str] = &["name"];
    const SORTABLE_COLUMNS: &'static [&'static str] = &["id", "name", "difficulty"];
    const FILTERABLE_COLUMNS: &'static [&'static str] = &["name", "difficulty"];

    fn id(&self) -> Identifier {
        Identifier::from(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Category {
    const NAME: &'static str = "Category";
    const TABLE: &'static str = "categories";
    const ID_KIND: IdKind = IdKind::Integer;
    const SEARCH_COLUMNS: &'static [&'static str] = &["name"];
    const SORTABLE_COLUMNS: &'static [&'static str] = &["id", "name"];

    fn id(&self) -> Identifier {
        Identifier::from(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Muscle {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Muscle {
    const NAME: &'static str = "Muscle";
    const TABLE: &'static str = "muscles";
    const ID_KIND: IdKind = IdKind::Integer;

    fn id(&self) -> Identifier {
        Identifier::from(self.id)
    }
}

/// UUID-keyed entity related to integer-keyed exercises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workout {
    pub id: Option<String>,
    pub title: String,
    pub performed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercises: Option<Vec<Exercise>>,
}

impl Entity for Workout {
    const NAME: &'static str = "Workout";
    const TABLE: &'static str = "workouts";
    const ID_KIND: IdKind = IdKind::Uuid;
    const SEARCH_COLUMNS: &'static [&'static str] = &["title"];
    const SORTABLE_COLUMNS: &'static [&'static str] = &["id", "title", "performed_at"];

    fn id(&self) -> Identifier {
        Identifier::from(self.id.clone())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built registries, stores and repositories.

    use super::*;
    use serde_json::json;
    use trellis_storage::into_row;

    /// Id of the seeded leg-day workout.
    pub const LEG_DAY_ID: &str = "6f1c2d9e-3b4a-4c5d-8e7f-9a0b1c2d3e4f";

    fn exercise_categories() -> RelationDescriptor {
        RelationDescriptor::many_to_many(
            "exercise_categories",
            "exercise_id",
            "category_id",
            "Category",
        )
    }

    fn exercise_muscles() -> RelationDescriptor {
        RelationDescriptor::many_to_many("exercise_muscles", "exercise_id", "muscle_id", "Muscle")
    }

    /// Builder with every fixture entity and relation registered, and the
    /// `Exercise` relation properties annotated.
    pub fn registry_builder() -> trellis_core::RegistryBuilder {
        RelationshipRegistry::builder()
            .entity_of::<Exercise>()
            .entity_of::<Category>()
            .entity_of::<Muscle>()
            .entity_of::<Workout>()
            .register_inverse("Exercise", "categories", "exercises", exercise_categories())
            .register("Exercise", "muscles", exercise_muscles())
            .register_inverse(
                "Workout",
                "exercises",
                "workouts",
                RelationDescriptor::many_to_many(
                    "workout_exercises",
                    "workout_id",
                    "exercise_id",
                    "Exercise",
                ),
            )
            .annotate("Exercise", "categories", exercise_categories())
            .annotate("Exercise", "muscles", exercise_muscles())
    }

    /// Registry with every fixture relation.
    pub fn registry() -> Arc<RelationshipRegistry> {
        Arc::new(
            registry_builder()
                .build()
                .expect("fixture registry must be consistent"),
        )
    }

    fn row(value: serde_json::Value) -> Row {
        into_row(value).expect("fixture rows are objects")
    }

    /// Empty store with every fixture table.
    pub fn empty_store() -> InMemoryStore {
        InMemoryStore::new()
            .with_table("exercises", IdKind::Integer)
            .with_table("categories", IdKind::Integer)
            .with_table("muscles", IdKind::Integer)
            .with_table("workouts", IdKind::Uuid)
            .with_join_table("exercise_categories")
            .with_join_table("exercise_muscles")
            .with_join_table("workout_exercises")
    }

    /// Store seeded with:
    /// - exercises 41 "Bench press", 42 "Squat", 43 "Deadlift"
    /// - categories 7 "Legs", 8 "Push"
    /// - links 42-7, 43-7, 41-8, 43-8
    /// - muscle 1 "Quadriceps" on exercise 42
    /// - workout [`LEG_DAY_ID`] with exercises 42 and 43
    pub fn seeded_store() -> InMemoryStore {
        let store = empty_store();
        let insert = |table: &str, value: serde_json::Value| {
            store.insert_row(table, row(value)).expect("fixture insert");
        };

        insert("exercises", json!({ "id": 41, "name": "Bench press", "difficulty": "medium" }));
        insert("exercises", json!({ "id": 42, "name": "Squat", "difficulty": "hard" }));
        insert("exercises", json!({ "id": 43, "name": "Deadlift", "difficulty": "hard" }));
        insert("categories", json!({ "id": 7, "name": "Legs" }));
        insert("categories", json!({ "id": 8, "name": "Push" }));
        insert("muscles", json!({ "id": 1, "name": "Quadriceps" }));
        insert(
            "workouts",
            json!({
                "id": LEG_DAY_ID,
                "title": "Leg day",
                "performed_at": "2026-03-14T09:30:00Z"
            }),
        );

        for (exercise, category) in [(42, 7), (43, 7), (41, 8), (43, 8)] {
            insert(
                "exercise_categories",
                json!({ "exercise_id": exercise, "category_id": category }),
            );
        }
        insert("exercise_muscles", json!({ "exercise_id": 42, "muscle_id": 1 }));
        for exercise in [42, 43] {
            insert(
                "workout_exercises",
                json!({ "workout_id": LEG_DAY_ID, "exercise_id": exercise }),
            );
        }
        store
    }

    /// Repository with the fixture registry and default configuration.
    pub fn repository<E, S, C>(store: Arc<S>, cache: Arc<C>) -> Repository<E, S, C>
    where
        E: Entity,
        S: Store,
        C: CacheClient,
    {
        Repository::new(store, cache, registry(), RepositoryConfig::default())
    }

    /// A new exercise payload without an id.
    pub fn new_exercise(name: &str) -> serde_json::Value {
        json!({ "name": name, "difficulty": "easy" })
    }
}

// ============================================================================
// STORE DOUBLES
// ============================================================================

/// Per-method call counters.
#[derive(Debug, Default)]
pub struct StoreCalls {
    pub fetch_all: AtomicUsize,
    pub count: AtomicUsize,
    pub fetch_related: AtomicUsize,
    pub find_one: AtomicUsize,
    pub writes: AtomicUsize,
}

impl StoreCalls {
    /// Reads that hit the store: `fetch_all` plus `find_one`.
    pub fn reads(&self) -> usize {
        self.fetch_all.load(Ordering::SeqCst) + self.find_one.load(Ordering::SeqCst)
    }
}

/// Store wrapper that counts every call before delegating.
#[derive(Debug)]
pub struct CountingStore<S> {
    inner: S,
    pub calls: StoreCalls,
}

impl<S: Store> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            calls: StoreCalls::default(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Store> Store for CountingStore<S> {
    async fn fetch_all(&self, query: &SelectQuery) -> StoreResult<Vec<Row>> {
        self.calls.fetch_all.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_all(query).await
    }

    async fn count(&self, query: &SelectQuery) -> StoreResult<u64> {
        self.calls.count.fetch_add(1, Ordering::SeqCst);
        self.inner.count(query).await
    }

    async fn fetch_related(&self, query: &RelatedRowsQuery) -> StoreResult<Vec<Row>> {
        self.calls.fetch_related.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_related(query).await
    }

    async fn find_one(
        &self,
        table: &str,
        criteria: &[WhereCondition],
    ) -> StoreResult<Option<Row>> {
        self.calls.find_one.fetch_add(1, Ordering::SeqCst);
        self.inner.find_one(table, criteria).await
    }

    async fn insert(&self, table: &str, row: Row) -> StoreResult<Row> {
        self.calls.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(table, row).await
    }

    async fn update(
        &self,
        table: &str,
        criteria: &[WhereCondition],
        changes: Row,
    ) -> StoreResult<Option<Row>> {
        self.calls.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update(table, criteria, changes).await
    }

    async fn delete(&self, table: &str, criteria: &[WhereCondition]) -> StoreResult<u64> {
        self.calls.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(table, criteria).await
    }
}

/// Store whose `find_one` parks after reading until released, so a test can
/// interleave a write between a reader's store fetch and its cache populate.
#[derive(Debug)]
pub struct GatedStore<S> {
    inner: S,
    reached: Notify,
    release: Notify,
}

impl<S: Store> GatedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reached: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Wait until a reader has fetched its row and parked.
    pub async fn wait_for_reader(&self) {
        self.reached.notified().await;
    }

    /// Let the parked reader continue.
    pub fn release_reader(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl<S: Store> Store for GatedStore<S> {
    async fn fetch_all(&self, query: &SelectQuery) -> StoreResult<Vec<Row>> {
        self.inner.fetch_all(query).await
    }

    async fn count(&self, query: &SelectQuery) -> StoreResult<u64> {
        self.inner.count(query).await
    }

    async fn fetch_related(&self, query: &RelatedRowsQuery) -> StoreResult<Vec<Row>> {
        self.inner.fetch_related(query).await
    }

    async fn find_one(
        &self,
        table: &str,
        criteria: &[WhereCondition],
    ) -> StoreResult<Option<Row>> {
        let row = self.inner.find_one(table, criteria).await?;
        self.reached.notify_one();
        self.release.notified().await;
        Ok(row)
    }

    async fn insert(&self, table: &str, row: Row) -> StoreResult<Row> {
        self.inner.insert(table, row).await
    }

    async fn update(
        &self,
        table: &str,
        criteria: &[WhereCondition],
        changes: Row,
    ) -> StoreResult<Option<Row>> {
        self.inner.update(table, criteria, changes).await
    }

    async fn delete(&self, table: &str, criteria: &[WhereCondition]) -> StoreResult<u64> {
        self.inner.delete(table, criteria).await
    }
}

/// Store whose every operation fails with a connection error.
#[derive(Debug, Default)]
pub struct FailingStore;

impl FailingStore {
    pub fn new() -> Self {
        Self
    }

    /// The error every call returns.
    pub fn error() -> StoreError {
        StoreError::Connection {
            reason: "database unavailable".to_string(),
        }
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn fetch_all(&self, _query: &SelectQuery) -> StoreResult<Vec<Row>> {
        Err(Self::error())
    }

    async fn count(&self, _query: &SelectQuery) -> StoreResult<u64> {
        Err(Self::error())
    }

    async fn fetch_related(&self, _query: &RelatedRowsQuery) -> StoreResult<Vec<Row>> {
        Err(Self::error())
    }

    async fn find_one(
        &self,
        _table: &str,
        _criteria: &[WhereCondition],
    ) -> StoreResult<Option<Row>> {
        Err(Self::error())
    }

    async fn insert(&self, _table: &str, _row: Row) -> StoreResult<Row> {
        Err(Self::error())
    }

    async fn update(
        &self,
        _table: &str,
        _criteria: &[WhereCondition],
        _changes: Row,
    ) -> StoreResult<Option<Row>> {
        Err(Self::error())
    }

    async fn delete(&self, _table: &str, _criteria: &[WhereCondition]) -> StoreResult<u64> {
        Err(Self::error())
    }
}

/// Store that sleeps before each `fetch_all` and `find_one`. Pair with a
/// paused clock so the delay costs no wall time.
#[derive(Debug)]
pub struct DelayingStore<S> {
    inner: S,
    delay: Duration,
}

impl<S: Store> DelayingStore<S> {
    pub fn new(inner: S, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<S: Store> Store for DelayingStore<S> {
    async fn fetch_all(&self, query: &SelectQuery) -> StoreResult<Vec<Row>> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_all(query).await
    }

    async fn count(&self, query: &SelectQuery) -> StoreResult<u64> {
        self.inner.count(query).await
    }

    async fn fetch_related(&self, query: &RelatedRowsQuery) -> StoreResult<Vec<Row>> {
        self.inner.fetch_related(query).await
    }

    async fn find_one(
        &self,
        table: &str,
        criteria: &[WhereCondition],
    ) -> StoreResult<Option<Row>> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_one(table, criteria).await
    }

    async fn insert(&self, table: &str, row: Row) -> StoreResult<Row> {
        self.inner.insert(table, row).await
    }

    async fn update(
        &self,
        table: &str,
        criteria: &[WhereCondition],
        changes: Row,
    ) -> StoreResult<Option<Row>> {
        self.inner.update(table, criteria, changes).await
    }

    async fn delete(&self, table: &str, criteria: &[WhereCondition]) -> StoreResult<u64> {
        self.inner.delete(table, criteria).await
    }
}

// ============================================================================
// CACHE DOUBLES
// ============================================================================

/// Cache client whose every operation fails.
#[derive(Debug, Default)]
pub struct FailingCacheClient {
    calls: AtomicUsize,
}

impl FailingCacheClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> CacheResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Backend {
            reason: "connection refused".to_string(),
        })
    }
}

#[async_trait]
impl CacheClient for FailingCacheClient {
    async fn get_raw(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.fail()
    }

    async fn set_raw(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> CacheResult<()> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> CacheResult<()> {
        self.fail()
    }

    async fn delete_by_pattern(&self, _pattern: &str) -> CacheResult<u64> {
        self.fail()
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.fail()
    }
}

/// Cache client that records the TTL of every `set`.
#[derive(Debug, Default)]
pub struct RecordingCacheClient {
    inner: InMemoryCacheClient,
    ttls: std::sync::Mutex<Vec<(String, Duration)>>,
}

impl RecordingCacheClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(key, ttl)` for every value stored so far.
    pub fn recorded_ttls(&self) -> Vec<(String, Duration)> {
        self.ttls.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CacheClient for RecordingCacheClient {
    async fn get_raw(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.inner.get_raw(key).await
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        if let Ok(mut ttls) = self.ttls.lock() {
            ttls.push((key.to_string(), ttl));
        }
        self.inner.set_raw(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.inner.delete(key).await
    }

    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<u64> {
        self.inner.delete_by_pattern(pattern).await
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// LOG CAPTURE
// ============================================================================

/// Collects formatted `WARN` and above events in memory.
///
/// Install with `tracing::subscriber::set_default(capture.subscriber())`
/// inside a current-thread test; the guard scopes it to that thread.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

struct CaptureWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut buffer) = self.0.lock() {
            buffer.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let buffer = Arc::clone(&self.buffer);
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || CaptureWriter(Arc::clone(&buffer)))
            .finish()
    }

    /// Everything captured so far.
    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }

    /// Captured lines containing `needle`.
    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.clear();
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for identifiers and filter specs.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate raw identifier text of every shape: digits, UUIDs in either
    /// case, and arbitrary strings.
    pub fn arb_raw_identifier() -> impl Strategy<Value = String> {
        prop_oneof![
            any::<u32>().prop_map(|n| n.to_string()),
            arb_uuid().prop_map(|u| u.to_string()),
            arb_uuid().prop_map(|u| u.to_string().to_uppercase()),
            "[a-z0-9_-]{0,12}",
            ".*",
        ]
    }

    /// Generate an identifier from any supported input type.
    pub fn arb_identifier() -> impl Strategy<Value = Identifier> {
        prop_oneof![
            any::<i64>().prop_map(Identifier::from),
            arb_raw_identifier().prop_map(Identifier::from),
        ]
    }

    pub fn arb_sort_direction() -> impl Strategy<Value = SortDirection> {
        prop_oneof![Just(SortDirection::Asc), Just(SortDirection::Desc)]
    }

    /// Generate a filter spec over fixture relation names.
    pub fn arb_filter_spec() -> impl Strategy<Value = FilterSpec> {
        (
            proptest::option::of("[a-z ]{1,10}"),
            1u32..100,
            0u32..500,
            proptest::option::of(prop_oneof![Just("name"), Just("id"), Just("categories")]),
            arb_sort_direction(),
            proptest::collection::vec(prop_oneof![Just("categories"), Just("muscles")], 0..3),
            proptest::collection::vec(1i64..100, 0..4),
        )
            .prop_map(|(search, limit, offset, sort, direction, relations, category_ids)| {
                let mut spec = FilterSpec::new()
                    .with_page(limit, offset)
                    .with_relations(relations);
                if let Some(term) = search {
                    spec = spec.with_search(term);
                }
                if let Some(field) = sort {
                    spec = spec.with_sort(field, direction);
                }
                if !category_ids.is_empty() {
                    spec = spec.with_relation_filter("categories", category_ids);
                }
                spec
            })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the Trellis error taxonomy.

    use super::*;

    /// Assert that a result is Ok.
    pub fn assert_ok<T: std::fmt::Debug>(result: &TrellisResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got {:?}", result);
    }

    /// Assert a missing-relation configuration error naming `relation`.
    pub fn assert_missing_relation<T: std::fmt::Debug>(result: &TrellisResult<T>, relation: &str) {
        match result {
            Err(TrellisError::Config(ConfigError::MissingRelation { relation: r, .. })) => {
                assert_eq!(r, relation, "Wrong relation in error");
            }
            other => panic!("Expected MissingRelation({}), got {:?}", relation, other),
        }
    }

    /// Assert that a result is a store error.
    pub fn assert_store_error<T: std::fmt::Debug>(result: &TrellisResult<T>) {
        assert!(
            matches!(result, Err(TrellisError::Store(_))),
            "Expected store error, got {:?}",
            result
        );
    }
}
