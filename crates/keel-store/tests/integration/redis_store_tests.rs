use std::time::Duration;

use keel_core::job::{JobStatus, ResultsLookup};
use keel_core::registry::JobRegistry;
use keel_core::store::FallbackStore;
use keel_core::traits::KvStore;
use keel_store::FileStore;

use crate::integration::common::setup_test_redis;

#[tokio::test]
async fn set_get_delete_roundtrip() {
    let (store, _container) = setup_test_redis().await;

    store.set("job:a", r#"{"progress":5}"#, None).await.unwrap();
    assert_eq!(
        store.get("job:a").await.unwrap().as_deref(),
        Some(r#"{"progress":5}"#)
    );

    store.delete("job:a").await.unwrap();
    assert_eq!(store.get("job:a").await.unwrap(), None);
}

#[tokio::test]
async fn missing_key_is_none() {
    let (store, _container) = setup_test_redis().await;
    assert_eq!(store.get("job:missing").await.unwrap(), None);
}

#[tokio::test]
async fn ttl_expires_key() {
    let (store, _container) = setup_test_redis().await;

    // Sub-second TTLs are rounded up to one second.
    store
        .set("job:ttl", "v", Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(store.get("job:ttl").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(store.get("job:ttl").await.unwrap(), None);
}

#[tokio::test]
async fn registry_lifecycle_over_redis_with_file_fallback() {
    let (redis, _container) = setup_test_redis().await;
    let dir = tempfile::tempdir().unwrap();
    let files = FileStore::open(dir.path()).await.unwrap();
    let registry = JobRegistry::new(FallbackStore::new(redis.clone(), files.clone()));

    let id = registry.create_job().await.unwrap();
    registry
        .update_status(id, JobStatus::Processing, 40, "Analyzing keywords")
        .await
        .unwrap();
    registry
        .complete(id, serde_json::json!({"keywords": []}))
        .await
        .unwrap();

    // Healthy primary: the record lives in Redis only.
    let key = format!("job:{id}");
    assert!(redis.get(&key).await.unwrap().is_some());
    assert!(files.get(&key).await.unwrap().is_none());

    match registry.get_results(id).await.unwrap() {
        ResultsLookup::Ready(results) => assert_eq!(results["keywords"], serde_json::json!([])),
        other => panic!("expected ready results, got {other:?}"),
    }
}
