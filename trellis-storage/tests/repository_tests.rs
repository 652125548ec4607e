//! End-to-end repository tests over the in-memory store and cache

use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use trellis_core::{CacheConfig, TrellisResult};
use trellis_test_utils::assertions::*;
use trellis_test_utils::fixtures::{self, LEG_DAY_ID};
use trellis_test_utils::*;

type ExerciseRepo<S, C> = Repository<Exercise, S, C>;

fn counting_setup() -> (
    Arc<CountingStore<InMemoryStore>>,
    Arc<InMemoryCacheClient>,
    ExerciseRepo<CountingStore<InMemoryStore>, InMemoryCacheClient>,
) {
    let store = Arc::new(CountingStore::new(fixtures::seeded_store()));
    let cache = Arc::new(InMemoryCacheClient::new());
    let repo = fixtures::repository(Arc::clone(&store), Arc::clone(&cache));
    (store, cache, repo)
}

fn ids(page: &Page<Exercise>) -> Vec<i64> {
    page.rows.iter().filter_map(|e| e.id).collect()
}

// ============================================================================
// RELATION FILTERS
// ============================================================================

#[tokio::test]
async fn test_relation_filter_accepts_integer_and_digit_string() -> TrellisResult<()> {
    let (_, _, repo) = counting_setup();

    let by_int = repo
        .find_with_filters(&FilterSpec::new().with_relation_filter("categories", [7]))
        .await?;
    let by_text = repo
        .find_with_filters(&FilterSpec::new().with_relation_filter("categories", ["7"]))
        .await?;

    assert_eq!(ids(&by_int), vec![42, 43]);
    assert_eq!(by_int.total, 2);
    assert_eq!(by_int, by_text);
    Ok(())
}

#[tokio::test]
async fn test_relation_filter_any_of_many() -> TrellisResult<()> {
    let (_, _, repo) = counting_setup();
    let page = repo
        .find_with_filters(&FilterSpec::new().with_relation_filter("categories", [7, 8]))
        .await?;
    assert_eq!(ids(&page), vec![41, 42, 43]);
    Ok(())
}

#[tokio::test]
async fn test_inverse_relation_filter_with_uuid_owner() -> TrellisResult<()> {
    let (_, _, repo) = counting_setup();
    let page = repo
        .find_with_filters(&FilterSpec::new().with_relation_filter("workouts", [LEG_DAY_ID]))
        .await?;
    assert_eq!(ids(&page), vec![42, 43]);
    Ok(())
}

#[tokio::test]
async fn test_unknown_relation_is_configuration_error() {
    let (store, _, repo) = counting_setup();

    let filtered = repo
        .find_with_filters(&FilterSpec::new().with_relation_filter("doesNotExist", [1]))
        .await;
    assert_missing_relation(&filtered, "doesNotExist");

    let included = repo
        .find_with_filters(&FilterSpec::new().with_relations(["doesNotExist"]))
        .await;
    assert_missing_relation(&included, "doesNotExist");

    let by_id = repo.find_by_id(42, &["doesNotExist"]).await;
    assert_missing_relation(&by_id, "doesNotExist");

    let related = repo.find_related("doesNotExist", 7, 10, 0).await;
    assert_missing_relation(&related, "doesNotExist");

    assert_eq!(store.calls.reads(), 0);
}

// ============================================================================
// FILTERS, SORTING AND PAGING
// ============================================================================

#[tokio::test]
async fn test_uuid_relation_filter_ignores_case() -> TrellisResult<()> {
    let (store, _, repo) = counting_setup();

    let upper = repo
        .find_with_filters(
            &FilterSpec::new().with_relation_filter("workouts", [LEG_DAY_ID.to_uppercase()]),
        )
        .await?;
    assert_eq!(ids(&upper), vec![42, 43]);

    let lower = repo
        .find_with_filters_with_source(
            &FilterSpec::new().with_relation_filter("workouts", [LEG_DAY_ID]),
        )
        .await?;
    assert!(lower.is_cache_hit());
    assert_eq!(ids(&lower.value), vec![42, 43]);
    assert_eq!(store.calls.fetch_all.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_search_is_case_insensitive() -> TrellisResult<()> {
    let (_, _, repo) = counting_setup();
    let page = repo.find_with_filters(&FilterSpec::new().with_search("SQU")).await?;
    assert_eq!(ids(&page), vec![42]);
    Ok(())
}

#[tokio::test]
async fn test_field_filters_ignore_unknown_columns() -> TrellisResult<()> {
    let (_, _, repo) = counting_setup();

    let hard = repo
        .find_with_filters(&FilterSpec::new().with_field("difficulty", json!("hard")))
        .await?;
    assert_eq!(ids(&hard), vec![42, 43]);

    let unknown = repo
        .find_with_filters(&FilterSpec::new().with_field("color", json!("red")))
        .await?;
    assert_eq!(unknown.total, 3);
    Ok(())
}

#[tokio::test]
async fn test_sort_by_relation_count() -> TrellisResult<()> {
    let (_, _, repo) = counting_setup();

    let desc = repo
        .find_with_filters(&FilterSpec::new().with_sort("categories", SortDirection::Desc))
        .await?;
    // 43 has two categories; 41 and 42 tie on one and fall back to id order.
    assert_eq!(ids(&desc), vec![43, 41, 42]);

    let asc = repo
        .find_with_filters(&FilterSpec::new().with_sort("categories", SortDirection::Asc))
        .await?;
    assert_eq!(ids(&asc), vec![41, 42, 43]);
    Ok(())
}

#[tokio::test]
async fn test_sort_by_column_and_page() -> TrellisResult<()> {
    let (_, _, repo) = counting_setup();
    let spec = FilterSpec::new()
        .with_sort("name", SortDirection::Asc)
        .with_page(2, 1);
    let page = repo.find_with_filters(&spec).await?;

    // Bench press, Deadlift, Squat
    assert_eq!(ids(&page), vec![43, 42]);
    assert_eq!(page.total, 3);
    Ok(())
}

// ============================================================================
// HYDRATION
// ============================================================================

#[tokio::test]
async fn test_list_hydrates_included_relations() -> TrellisResult<()> {
    let (store, _, repo) = counting_setup();
    let page = repo
        .find_with_filters(&FilterSpec::new().with_relations(["categories", "muscles"]))
        .await?;

    let deadlift = page.rows.iter().find(|e| e.id == Some(43)).expect("deadlift");
    let names: Vec<_> = deadlift
        .categories
        .as_ref()
        .expect("categories loaded")
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(names, vec!["Legs", "Push"]);
    assert_eq!(deadlift.muscles.as_deref(), Some(&[][..]));

    let squat = page.rows.iter().find(|e| e.id == Some(42)).expect("squat");
    assert_eq!(squat.muscles.as_ref().map(Vec::len), Some(1));

    // One batched query per relation, not per row.
    assert_eq!(store.calls.fetch_related.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_uuid_entity_hydrates_integer_relations() -> TrellisResult<()> {
    let store = Arc::new(fixtures::seeded_store());
    let cache = Arc::new(InMemoryCacheClient::new());
    let repo: Repository<Workout, _, _> = fixtures::repository(store, cache);

    let workout = repo
        .find_by_id(LEG_DAY_ID.to_uppercase(), &["exercises"])
        .await?
        .expect("workout exists");
    assert_eq!(workout.title, "Leg day");
    let names: Vec<_> = workout
        .exercises
        .unwrap_or_default()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["Squat", "Deadlift"]);
    Ok(())
}

#[tokio::test]
async fn test_mismatched_id_kind_short_circuits() -> TrellisResult<()> {
    let store = Arc::new(CountingStore::new(fixtures::seeded_store()));
    let cache = Arc::new(InMemoryCacheClient::new());
    let workouts: Repository<Workout, _, _> =
        fixtures::repository(Arc::clone(&store), Arc::clone(&cache));
    let exercises: Repository<Exercise, _, _> =
        fixtures::repository(Arc::clone(&store), Arc::clone(&cache));

    assert!(workouts.find_by_id(42, &[]).await?.is_none());
    assert!(exercises.find_by_id(LEG_DAY_ID, &[]).await?.is_none());
    assert!(!exercises.delete("not-an-id").await?);
    assert_eq!(store.calls.find_one.load(Ordering::SeqCst), 0);
    assert_eq!(store.calls.writes.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_find_related() -> TrellisResult<()> {
    let (store, _, repo) = counting_setup();

    let page = repo.find_related("categories", "7", 10, 0).await?;
    assert_eq!(ids(&page), vec![42, 43]);
    assert_eq!(page.total, 2);

    let again = repo.find_related_with_source("categories", 7, 10, 0).await?;
    assert!(again.is_cache_hit());
    assert_eq!(store.calls.fetch_all.load(Ordering::SeqCst), 1);
    Ok(())
}

// ============================================================================
// CACHE-ASIDE BEHAVIOUR
// ============================================================================

#[tokio::test]
async fn test_find_by_id_caches_and_normalizes_id() -> TrellisResult<()> {
    let (store, _, repo) = counting_setup();

    let first = repo.find_by_id_with_source(42, &[]).await?;
    let second = repo.find_by_id_with_source("042", &[]).await?;

    assert_eq!(first.source, ReadSource::Store);
    assert!(second.is_cache_hit());
    assert_eq!(first.value, second.value);
    assert_eq!(store.calls.find_one.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_absent_entity_is_not_cached() -> TrellisResult<()> {
    let (store, cache, repo) = counting_setup();

    assert!(repo.find_by_id(999, &[]).await?.is_none());
    assert!(repo.find_by_id(999, &[]).await?.is_none());
    assert_eq!(store.calls.find_one.load(Ordering::SeqCst), 2);
    assert!(cache.keys()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_update_invalidates_every_variant() -> TrellisResult<()> {
    let (store, cache, repo) = counting_setup();

    repo.find_by_id(42, &[]).await?;
    repo.find_by_id(42, &["categories"]).await?;
    repo.find_with_filters(&FilterSpec::new()).await?;
    assert_eq!(cache.keys()?.len(), 3);

    let updated = repo
        .update(42, &json!({ "name": "Back squat" }))
        .await?
        .expect("row exists");
    assert_eq!(updated.name, "Back squat");
    assert!(cache.keys()?.is_empty());

    let reread = repo.find_by_id_with_source(42, &[]).await?;
    assert_eq!(reread.source, ReadSource::Store);
    assert_eq!(reread.value.map(|e| e.name), Some("Back squat".to_string()));
    assert_eq!(store.calls.find_one.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn test_update_never_changes_primary_key() -> TrellisResult<()> {
    let (_, _, repo) = counting_setup();
    let updated = repo
        .update(41, &json!({ "id": 99, "difficulty": "easy" }))
        .await?
        .expect("row exists");
    assert_eq!(updated.id, Some(41));
    assert!(repo.find_by_id(99, &[]).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_create_invalidates_lists_only() -> TrellisResult<()> {
    let (_, cache, repo) = counting_setup();

    repo.find_by_id(42, &[]).await?;
    let before = repo.find_with_filters(&FilterSpec::new()).await?;
    assert_eq!(before.total, 3);

    let created = repo.create(&fixtures::new_exercise("Lunge")).await?;
    assert_eq!(created.id, Some(44));

    let keys = cache.keys()?;
    assert_eq!(keys, vec!["exercise:42".to_string()]);

    let after = repo.find_with_filters_with_source(&FilterSpec::new()).await?;
    assert_eq!(after.source, ReadSource::Store);
    assert_eq!(after.value.total, 4);
    Ok(())
}

#[tokio::test]
async fn test_write_invalidates_filter_keys_with_newlines() -> TrellisResult<()> {
    let (_, cache, repo) = counting_setup();
    let spec = FilterSpec::new().with_search("s\nq");

    let before = repo.find_with_filters(&spec).await?;
    assert_eq!(before.total, 0);
    assert_eq!(cache.keys()?.len(), 1);

    repo.create(&fixtures::new_exercise("s\nqueeze")).await?;
    assert!(cache.keys()?.is_empty());

    let after = repo.find_with_filters_with_source(&spec).await?;
    assert_eq!(after.source, ReadSource::Store);
    assert_eq!(after.value.total, 1);
    Ok(())
}

#[tokio::test]
async fn test_delete() -> TrellisResult<()> {
    let (_, cache, repo) = counting_setup();

    repo.find_by_id(43, &["categories"]).await?;
    assert!(repo.delete(43).await?);
    assert!(cache.keys()?.is_empty());
    assert!(repo.find_by_id(43, &[]).await?.is_none());
    assert!(!repo.delete(43).await?);
    Ok(())
}

#[tokio::test]
async fn test_failing_cache_falls_through_to_store() -> TrellisResult<()> {
    let store = Arc::new(fixtures::seeded_store());
    let cache = Arc::new(FailingCacheClient::new());
    let repo: ExerciseRepo<_, _> = fixtures::repository(store, Arc::clone(&cache));

    let squat = repo.find_by_id(42, &[]).await?.expect("squat");
    assert_eq!(squat.name, "Squat");

    let page = repo.find_with_filters(&FilterSpec::new()).await?;
    assert_eq!(page.total, 3);

    let created = repo.create(&fixtures::new_exercise("Lunge")).await;
    assert_ok(&created);
    assert!(repo.update(42, &json!({ "name": "Back squat" })).await?.is_some());

    // get + set per read, list patterns on create, entity and list patterns on update
    assert_eq!(cache.calls(), 2 + 2 + 2 + 3);
    Ok(())
}

#[tokio::test]
async fn test_store_failures_surface_as_store_errors() -> TrellisResult<()> {
    let cache = Arc::new(InMemoryCacheClient::new());
    let repo: ExerciseRepo<_, _> =
        fixtures::repository(Arc::new(FailingStore::new()), Arc::clone(&cache));

    assert_store_error(&repo.find_with_filters(&FilterSpec::new()).await);
    let missing = repo.find_by_id(42, &[]).await;
    assert_store_error(&missing);
    assert!(matches!(
        missing,
        Err(TrellisError::Store(StoreError::Connection { .. }))
    ));
    assert!(cache.keys()?.is_empty());

    // Cached entries must survive writes the store rejected.
    let ttl = Duration::from_secs(60);
    let list_key = repo.keys().for_filters(&FilterSpec::new());
    let entity_key = repo.keys().for_entity(&Identifier::from(42), Vec::<String>::new());
    cache.set_raw(&list_key, b"[]".to_vec(), ttl).await?;
    cache.set_raw(&entity_key, b"{}".to_vec(), ttl).await?;

    assert_store_error(&repo.create(&fixtures::new_exercise("Lunge")).await);
    assert_store_error(&repo.update(42, &json!({ "name": "Back squat" })).await);
    assert_store_error(&repo.delete(42).await);

    let mut keys = cache.keys()?;
    keys.sort();
    let mut expected = vec![list_key, entity_key];
    expected.sort();
    assert_eq!(keys, expected);
    Ok(())
}

#[tokio::test]
async fn test_disabled_cache_is_bypassed() -> TrellisResult<()> {
    let store = Arc::new(CountingStore::new(fixtures::seeded_store()));
    let cache = Arc::new(FailingCacheClient::new());
    let config =
        RepositoryConfig::default().with_cache(CacheConfig::default().with_enabled(false));
    let repo: ExerciseRepo<_, _> =
        Repository::new(Arc::clone(&store), Arc::clone(&cache), fixtures::registry(), config);

    repo.find_by_id(42, &[]).await?;
    repo.find_by_id(42, &[]).await?;
    repo.update(42, &json!({ "name": "Back squat" })).await?;

    assert_eq!(store.calls.find_one.load(Ordering::SeqCst), 2);
    assert_eq!(cache.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_entity_ttl_takes_precedence() -> TrellisResult<()> {
    let store = Arc::new(fixtures::seeded_store());
    let cache = Arc::new(RecordingCacheClient::new());
    let config = RepositoryConfig::default().with_cache(
        CacheConfig::default()
            .with_default_ttl(Duration::from_secs(300))
            .with_entity_ttl("Exercise", Duration::from_secs(60)),
    );
    let exercises: ExerciseRepo<_, _> = Repository::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        fixtures::registry(),
        config.clone(),
    );
    let categories: Repository<Category, _, _> =
        Repository::new(store, Arc::clone(&cache), fixtures::registry(), config);

    exercises.find_by_id(42, &[]).await?;
    categories.find_by_id(7, &[]).await?;

    let ttls = cache.recorded_ttls();
    assert_eq!(
        ttls,
        vec![
            ("exercise:42".to_string(), Duration::from_secs(60)),
            ("category:7".to_string(), Duration::from_secs(300)),
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_expired_entry_rereads_store() -> TrellisResult<()> {
    let store = Arc::new(CountingStore::new(fixtures::seeded_store()));
    let cache = Arc::new(InMemoryCacheClient::new());
    let config = RepositoryConfig::default().with_cache(
        CacheConfig::default().with_entity_ttl("exercise", Duration::from_secs(60)),
    );
    let repo: ExerciseRepo<_, _> =
        Repository::new(Arc::clone(&store), cache, fixtures::registry(), config);

    repo.find_by_id(42, &[]).await?;
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(repo.find_by_id_with_source(42, &[]).await?.is_cache_hit());

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!repo.find_by_id_with_source(42, &[]).await?.is_cache_hit());
    assert_eq!(store.calls.find_one.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_find_by_id_is_logged() -> TrellisResult<()> {
    let capture = LogCapture::new();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let quick: ExerciseRepo<_, _> = fixtures::repository(
        Arc::new(DelayingStore::new(fixtures::seeded_store(), Duration::from_millis(50))),
        Arc::new(InMemoryCacheClient::new()),
    );
    quick.find_by_id(42, &[]).await?;
    assert!(capture.lines_containing("Slow query").is_empty());

    let slow: ExerciseRepo<_, _> = fixtures::repository(
        Arc::new(DelayingStore::new(fixtures::seeded_store(), Duration::from_millis(150))),
        Arc::new(InMemoryCacheClient::new()),
    );
    slow.find_by_id(42, &[]).await?;
    let warnings = capture.lines_containing("Slow query");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("find_by_id"));
    assert!(warnings[0].contains("threshold_ms=100"));

    // Served from cache, so no second warning.
    slow.find_by_id(42, &[]).await?;
    assert_eq!(capture.lines_containing("Slow query").len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_filter_query_is_logged() -> TrellisResult<()> {
    let capture = LogCapture::new();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let under: ExerciseRepo<_, _> = fixtures::repository(
        Arc::new(DelayingStore::new(fixtures::seeded_store(), Duration::from_millis(150))),
        Arc::new(InMemoryCacheClient::new()),
    );
    under.find_with_filters(&FilterSpec::new()).await?;
    assert!(capture.lines_containing("Slow query").is_empty());

    let over: ExerciseRepo<_, _> = fixtures::repository(
        Arc::new(DelayingStore::new(fixtures::seeded_store(), Duration::from_millis(250))),
        Arc::new(InMemoryCacheClient::new()),
    );
    over.find_with_filters(&FilterSpec::new()).await?;
    let warnings = capture.lines_containing("Slow query");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("find_with_filters"));
    assert!(warnings[0].contains("entity=\"Exercise\""));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_read_may_repopulate_pre_write_value() -> TrellisResult<()> {
    let store = Arc::new(GatedStore::new(fixtures::seeded_store()));
    let cache = Arc::new(InMemoryCacheClient::new());
    let repo: ExerciseRepo<_, _> = fixtures::repository(Arc::clone(&store), cache);

    let reader = {
        let repo = repo.clone();
        tokio::spawn(async move { repo.find_by_id(42, &[]).await })
    };
    store.wait_for_reader().await;

    repo.update(42, &json!({ "name": "Back squat" })).await?;
    store.release_reader();

    let stale = reader.await.expect("reader task")?.expect("squat");
    assert_eq!(stale.name, "Squat");

    // The reader populated after the writer invalidated; the entry stays
    // until the next write or its TTL.
    let cached = repo.find_by_id_with_source(42, &[]).await?;
    assert!(cached.is_cache_hit());
    assert_eq!(cached.value.map(|e| e.name), Some("Squat".to_string()));

    repo.invalidate_entity(&Identifier::from(42)).await;
    store.release_reader();
    let fresh = repo.find_by_id(42, &[]).await?.expect("squat");
    assert_eq!(fresh.name, "Back squat");
    Ok(())
}

#[tokio::test]
async fn test_global_registry() -> TrellisResult<()> {
    let store = Arc::new(fixtures::seeded_store());
    let cache = Arc::new(InMemoryCacheClient::new());

    let missing: Result<ExerciseRepo<_, _>, _> = Repository::with_global_registry(
        Arc::clone(&store),
        Arc::clone(&cache),
        RepositoryConfig::default(),
    );
    assert!(missing.is_err());

    fixtures::registry_builder().build()?.install()?;
    let repo: ExerciseRepo<_, _> =
        Repository::with_global_registry(store, cache, RepositoryConfig::default())?;
    let page = repo
        .find_with_filters(&FilterSpec::new().with_relation_filter("categories", [8]))
        .await?;
    assert_eq!(ids(&page), vec![41, 43]);
    Ok(())
}
