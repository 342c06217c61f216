use lpg_storage::error::IndexDefinitionError;
use lpg_storage::graph::indices::ValueFilter;
use lpg_storage::{Config, GraphEngine, PropertyValue, StorageError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// The `#[tokio::test]` attribute runs each test on the Tokio runtime,
// because every GraphEngine operation is async.

#[tokio::test]
async fn test_full_engine_lifecycle() {
    // --- 1. SETUP ---
    lpg_storage::logging::init_tracing();
    let dir = tempdir().unwrap();
    let engine = GraphEngine::new(Config::with_data_directory(dir.path())).unwrap();

    // --- 2. ACTION: STORE & RELATE ---
    let carol = engine
        .store_vertex(
            vec!["Person".to_string()],
            vec![("name".to_string(), PropertyValue::from("Carol")), ("age".to_string(), PropertyValue::Int(41))],
        )
        .await
        .unwrap();
    let project = engine
        .store_vertex(vec!["Project".to_string()], vec![("name".to_string(), PropertyValue::from("lpg"))])
        .await
        .unwrap();
    engine.relate(carol, "LEADS".to_string(), project).await.unwrap();

    // --- 3. VERIFICATION: RETRIEVE ---
    let vertex = engine.vertex(carol).await.unwrap().unwrap();
    let age = engine.storage().property("age").unwrap();
    assert_eq!(vertex.property(age), PropertyValue::Int(41));

    // --- 4. ACTION & VERIFICATION: INDEX ---
    let key = engine
        .create_index("Person", &["age"], Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();
    let count = engine
        .approximate_vertex_count(key.clone(), ValueFilter::Exact(vec![PropertyValue::Int(41)]))
        .await
        .unwrap();
    assert_eq!(count, Some(1));

    // --- 5. ACTION & VERIFICATION: FORGET ---
    assert_eq!(engine.forget(carol).await.unwrap(), 1);
    assert!(engine.vertex(carol).await.unwrap().is_none());
    let stats = engine.collect_garbage().await.unwrap().unwrap();
    assert_eq!(stats.vertices_removed, 1);
    assert_eq!(stats.edges_removed, 1);
    engine.drop_index(key).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_index_build() {
    let dir = tempdir().unwrap();
    let engine = GraphEngine::new(Config::with_data_directory(dir.path())).unwrap();
    engine
        .store_vertex(vec!["Person".to_string()], vec![("age".to_string(), PropertyValue::Int(1))])
        .await
        .unwrap();

    let err = engine
        .create_index("Person", &["age"], Arc::new(AtomicBool::new(true)))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::IndexDefinition(IndexDefinitionError::Cancelled)));
    assert!(engine.storage().list_indices().unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshot_from_engine() {
    let dir = tempdir().unwrap();
    let engine = GraphEngine::new(Config::with_data_directory(dir.path())).unwrap();
    engine.store_vertex(vec!["Person".to_string()], vec![]).await.unwrap();
    let path = engine
        .create_snapshot(Arc::new(AtomicBool::new(false)))
        .await
        .unwrap()
        .unwrap();
    assert!(path.starts_with(engine.storage().config().snapshot_directory()));
}

#[tokio::test]
async fn test_plan_cache_is_invalidated_on_catalog_change() {
    let dir = tempdir().unwrap();
    let invalidations = Arc::new(AtomicUsize::new(0));
    let mut config = Config::with_data_directory(dir.path());
    let counter = Arc::clone(&invalidations);
    config.plan_cache_invalidator = Some(lpg_storage::config::PlanCacheInvalidator::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let engine = GraphEngine::new(config).unwrap();

    let key = engine
        .create_index("Person", &["age"], Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();
    engine.drop_index(key).await.unwrap();
    assert_eq!(invalidations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_gc_task_stops_with_storage() {
    let dir = tempdir().unwrap();
    let mut config = Config::with_data_directory(dir.path());
    config.gc.interval_ms = 10;
    let engine = GraphEngine::new(config).unwrap();
    let handle = engine.spawn_configured_gc_task();
    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(engine);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("gc task did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_failed_write_releases_its_transaction() {
    let dir = tempdir().unwrap();
    let engine = GraphEngine::new(Config::with_data_directory(dir.path())).unwrap();
    let a = engine.store_vertex(vec!["Person".to_string()], vec![]).await.unwrap();
    let b = engine.store_vertex(vec!["Person".to_string()], vec![]).await.unwrap();

    // `a` is touched before the missing endpoint is found.
    assert!(engine.relate(a, "KNOWS".to_string(), lpg_storage::Gid(999)).await.is_err());
    assert_eq!(engine.storage().active_transactions().unwrap(), 0);

    // A leaked writer would still hold `a` and make this a serialization conflict.
    engine.relate(a, "KNOWS".to_string(), b).await.unwrap();

    assert!(engine.forget(lpg_storage::Gid(12345)).await.is_err());
    assert_eq!(engine.storage().active_transactions().unwrap(), 0);
    assert_eq!(engine.forget(a).await.unwrap(), 1);
}
